// Copyright 2025 The Gargantua Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::time::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gargantua_config::gargantua::{GargantuaConfig, StoreConfig};
use gargantua_error::{Error, ResultExt, error_if};
use gargantua_resources::hobbyfarm_schemas;
use gargantua_scheduler::{RsaKeyPairGenerator, Scheduler, SchedulerContext};
use gargantua_service::Gateway;
use gargantua_service::auth::from_config;
use gargantua_store::{InformerFactory, KubeObjectStore, MemoryObjectStore, ObjectStore};
use gargantua_util::clock::default_clock;
use gargantua_util::{init_tracing, spawn};
use mimalloc::MiMalloc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Informers replay their whole cache this often, so a missed event is
/// picked up eventually.
const RESYNC_PERIOD: Duration = Duration::from_secs(600);

/// Control plane for interactive VM labs.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the controllers and the HTTP gateway until SIGINT or SIGTERM.
    Serve {
        /// Config file to use.
        #[clap(value_parser)]
        config_file: String,
    },
    /// Generates deployment artifacts and exits.
    Codegen {
        #[command(subcommand)]
        target: Codegen,
    },
}

#[derive(Subcommand, Debug)]
enum Codegen {
    /// Writes one JSON schema per resource kind into `path`.
    Crds { path: PathBuf },
}

fn get_config(config_file: &str) -> Result<GargantuaConfig, Error> {
    let json_contents = std::fs::read_to_string(config_file)
        .err_tip(|| format!("Could not open config file {config_file}"))?;
    let mut cfg: GargantuaConfig = serde_json5::from_str(&json_contents)
        .err_tip(|| format!("Could not parse config file {config_file}"))?;
    cfg.global
        .apply_env_overlay(|key| std::env::var(key).ok());
    Ok(cfg)
}

fn write_crds(path: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(path)
        .err_tip(|| format!("Could not create {}", path.display()))?;
    for (file_name, schema) in hobbyfarm_schemas()? {
        let target = path.join(&file_name);
        let contents = serde_json::to_string_pretty(&schema)?;
        std::fs::write(&target, contents)
            .err_tip(|| format!("Could not write {}", target.display()))?;
        info!(file = %target.display(), "Wrote schema");
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(target_family = "unix")]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(?err, "Failed to listen to SIGTERM");
                wait_for_ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("Process terminated via SIGINT"),
            _ = sigterm.recv() => warn!("Process terminated via SIGTERM"),
        }
    }
    #[cfg(not(target_family = "unix"))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Process terminated via SIGINT"),
        Err(err) => warn!(?err, "Failed to listen to SIGINT"),
    }
}

async fn serve_gateway(
    gateway: Gateway,
    listen_address: String,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = TcpListener::bind(&listen_address)
        .await
        .err_tip(|| format!("Could not bind gateway to {listen_address}"))?;
    info!(address = %listen_address, "Gateway listening");
    axum::serve(listener, gateway.router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .err_tip(|| "Gateway server failed")
}

async fn open_store(cfg: &GargantuaConfig) -> Result<Arc<dyn ObjectStore>, Error> {
    let namespace = cfg.global.namespace.as_str();
    match cfg.store {
        StoreConfig::Kubernetes => Ok(Arc::new(KubeObjectStore::connect(namespace).await?)),
        StoreConfig::Memory => {
            error_if!(
                cfg.controllers.any_sharded(),
                "Sharded controllers need the kubernetes store"
            );
            warn!("Objects are kept in memory and lost on exit");
            Ok(Arc::new(MemoryObjectStore::new(namespace)))
        }
    }
}

async fn inner_main(cfg: GargantuaConfig) -> Result<(), Error> {
    let shutdown = CancellationToken::new();
    let _signals = {
        let shutdown = shutdown.clone();
        spawn!("signal_handler", async move {
            wait_for_signal().await;
            shutdown.cancel();
        })
    };

    let cfg = Arc::new(cfg);
    let store = open_store(&cfg).await?;
    let factory = Arc::new(InformerFactory::new(store, Some(RESYNC_PERIOD)));
    let ctx = SchedulerContext::new(factory, cfg.clone(), default_clock());
    let scheduler = Scheduler::new(ctx.clone(), Arc::new(RsaKeyPairGenerator::default()))
        .await
        .err_tip(|| "Building controllers")?;

    let gateway = if cfg.gateway.listen_address.is_empty() {
        None
    } else {
        let (authn, authr) = from_config(&cfg.gateway.auth);
        Some(Gateway::new(ctx.clone(), scheduler.handles(), authn, authr))
    };

    let scheduler = {
        let shutdown = shutdown.clone();
        spawn!("scheduler", async move {
            let result = scheduler.run(shutdown.clone()).await;
            shutdown.cancel();
            result
        })
    };
    let gateway = gateway.map(|gateway| {
        let shutdown = shutdown.clone();
        let listen_address = cfg.gateway.listen_address.clone();
        spawn!("gateway", async move {
            let result = serve_gateway(gateway, listen_address, shutdown.clone()).await;
            shutdown.cancel();
            result
        })
    });

    let scheduler_result = scheduler.await?;
    if let Some(gateway) = gateway {
        gateway.await??;
    }
    scheduler_result?;
    info!("Successfully shut down gargantua");
    Ok(())
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    init_tracing()?;
    let args = Args::parse();
    match args.command {
        Command::Codegen {
            target: Codegen::Crds { path },
        } => write_crds(&path)?,
        Command::Serve { config_file } => {
            let cfg = get_config(&config_file)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime
                .block_on(inner_main(cfg))
                .err_tip(|| "main() function failed")?;
        }
    }
    Ok(())
}
