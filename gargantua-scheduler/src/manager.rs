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

//! Wires the reconcilers to their controllers and runs them.

use core::time::Duration;
use std::sync::Arc;

use gargantua_config::controllers::ControllerConfig;
use gargantua_controller::{
    BaseController, ControllerHandle, EnqueueFilter, LeaderElector, Reconciler, ShardFilter,
    shard_filter, watch_replicas,
};
use gargantua_error::{Error, ResultExt, make_input_err};
use gargantua_resources::labels::VM_SET;
use gargantua_resources::{
    Resource, ScheduledEvent, Session, StatefulSet, TfExecution, VirtualMachine,
    VirtualMachineClaim, VirtualMachineSet,
};
use gargantua_store::{InformerEvent, InformerFactory};
use gargantua_util::spawn;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::SchedulerContext;
use crate::keypair::KeyPairGenerator;
use crate::scheduled_event_controller::{ScheduledEventReconciler, events_for_vm_set};
use crate::session_controller::SessionReconciler;
use crate::vm_claim_controller::{VmClaimReconciler, claims_for_vm};
use crate::vm_controller::{VmReconciler, vms_for_execution};
use crate::vm_set_controller::VmSetReconciler;

pub const VM_CONTROLLER: &str = "vm_controller";
pub const VM_SET_CONTROLLER: &str = "vm_set_controller";
pub const VM_CLAIM_CONTROLLER: &str = "vm_claim_controller";
pub const SESSION_CONTROLLER: &str = "session_controller";
pub const SCHEDULED_EVENT_CONTROLLER: &str = "scheduled_event_controller";

const DEFAULT_IDENTITY: &str = "gargantua";

/// Queues of the running controllers, for out-of-band enqueues.
#[derive(Debug, Clone)]
pub struct ControllerHandles {
    pub vm: ControllerHandle,
    pub vm_set: ControllerHandle,
    pub vm_claim: ControllerHandle,
    pub session: ControllerHandle,
    pub scheduled_event: ControllerHandle,
}

impl ControllerHandles {
    /// The queue reconciling objects of `kind`, if any controller does.
    pub fn for_kind(&self, kind: &str) -> Option<&ControllerHandle> {
        match kind {
            k if k == VirtualMachine::KIND => Some(&self.vm),
            k if k == VirtualMachineSet::KIND => Some(&self.vm_set),
            k if k == VirtualMachineClaim::KIND => Some(&self.vm_claim),
            k if k == Session::KIND => Some(&self.session),
            k if k == ScheduledEvent::KIND => Some(&self.scheduled_event),
            _ => None,
        }
    }
}

struct Managed {
    controller: BaseController,
    reconciler: Arc<dyn Reconciler>,
    sharded: bool,
}

/// Every controller of the lab scheduler, ready to run.
pub struct Scheduler {
    ctx: SchedulerContext,
    controllers: Vec<Managed>,
    handles: ControllerHandles,
    shard: Option<(String, Arc<ShardFilter>)>,
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("controllers", &self.controllers.len())
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

async fn sharding(ctx: &SchedulerContext) -> Result<Option<(String, Arc<ShardFilter>)>, Error> {
    if !ctx.config().controllers.any_sharded() {
        return Ok(None);
    }
    let global = &ctx.config().global;
    let statefulset = global
        .statefulset_name
        .clone()
        .ok_or_else(|| make_input_err!("Sharded controllers need global.statefulset_name"))?;
    let identity = global
        .pod_identity
        .as_deref()
        .ok_or_else(|| make_input_err!("Sharded controllers need global.pod_identity"))?;
    let filter = shard_filter(&ctx.api::<StatefulSet>(), &statefulset, identity).await?;
    Ok(Some((statefulset, filter)))
}

impl Scheduler {
    /// Builds the controllers and registers their informer handlers. Must
    /// run before the informer factory is started.
    pub async fn new(
        ctx: SchedulerContext,
        key_pairs: Arc<dyn KeyPairGenerator>,
    ) -> Result<Self, Error> {
        let shard = sharding(&ctx).await?;
        let namespace = ctx.namespace().to_string();
        let rate_limiter = ctx.config().rate_limiter.clone();
        let build = |name: &'static str, config: &ControllerConfig| {
            let filter = shard
                .as_ref()
                .filter(|_| config.sharded)
                .map(|(_, filter)| filter.clone() as Arc<dyn EnqueueFilter>);
            BaseController::new(name, namespace.as_str(), config, &rate_limiter, filter)
        };
        let config = &ctx.config().controllers;
        let vm = build(VM_CONTROLLER, &config.vm);
        let vm_set = build(VM_SET_CONTROLLER, &config.vm_set);
        let vm_claim = build(VM_CLAIM_CONTROLLER, &config.vm_claim);
        let session = build(SESSION_CONTROLLER, &config.session);
        let scheduled_event = build(SCHEDULED_EVENT_CONTROLLER, &config.scheduled_event);

        let factory = ctx.factory();
        let vm_informer = factory.informer::<VirtualMachine>();
        vm.watch(&vm_informer);
        let vm_lister = vm_informer.lister();
        vm.watch_related(
            &factory.informer::<TfExecution>(),
            move |event: &InformerEvent<TfExecution>| vms_for_execution(&vm_lister, event.object()),
        );
        vm_set.watch(&factory.informer::<VirtualMachineSet>());
        vm_set.watch_related(&vm_informer, |event: &InformerEvent<VirtualMachine>| {
            event
                .object()
                .metadata
                .label(VM_SET)
                .map(|name| vec![name.to_string()])
                .unwrap_or_default()
        });
        vm_claim.watch(&factory.informer::<VirtualMachineClaim>());
        vm_claim.watch_related(&vm_informer, |event: &InformerEvent<VirtualMachine>| {
            claims_for_vm(event.object())
        });
        session.watch(&factory.informer::<Session>());
        scheduled_event.watch(&factory.informer::<ScheduledEvent>());
        scheduled_event.watch_related(
            &factory.informer::<VirtualMachineSet>(),
            |event: &InformerEvent<VirtualMachineSet>| events_for_vm_set(event.object()),
        );

        let handles = ControllerHandles {
            vm: vm.handle(),
            vm_set: vm_set.handle(),
            vm_claim: vm_claim.handle(),
            session: session.handle(),
            scheduled_event: scheduled_event.handle(),
        };
        let managed = |controller: BaseController, reconciler: Arc<dyn Reconciler>, sharded| {
            Managed {
                controller,
                reconciler,
                sharded,
            }
        };
        let controllers = vec![
            managed(
                vm,
                Arc::new(VmReconciler::new(
                    ctx.clone(),
                    key_pairs,
                    handles.vm_claim.clone(),
                    handles.vm_set.clone(),
                )),
                config.vm.sharded,
            ),
            managed(
                vm_set,
                Arc::new(VmSetReconciler::new(ctx.clone(), handles.vm_set.clone())),
                config.vm_set.sharded,
            ),
            managed(
                vm_claim,
                Arc::new(VmClaimReconciler::new(ctx.clone())),
                config.vm_claim.sharded,
            ),
            managed(
                session,
                Arc::new(SessionReconciler::new(ctx.clone(), handles.session.clone())),
                config.session.sharded,
            ),
            managed(
                scheduled_event,
                Arc::new(ScheduledEventReconciler::new(
                    ctx.clone(),
                    handles.scheduled_event.clone(),
                )),
                config.scheduled_event.sharded,
            ),
        ];
        Ok(Self {
            ctx,
            controllers,
            handles,
            shard,
        })
    }

    pub const fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn handles(&self) -> ControllerHandles {
        self.handles.clone()
    }

    /// Starts the informers and runs every controller until `shutdown`
    /// fires. With leader election enabled, controllers that are not
    /// sharded only run while this replica holds the lease; losing it
    /// shuts the whole scheduler down so the replica restarts clean.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let factory = self.ctx.factory().clone();
        factory.start(&shutdown);

        let _replica_watcher = self.shard.map(|(statefulset, filter)| {
            let api = factory.api::<StatefulSet>();
            spawn!(
                "replica_watcher",
                watch_replicas(api, statefulset, filter, shutdown.clone())
            )
        });

        let election = &self.ctx.config().leader_election;
        let (always, singletons): (Vec<Managed>, Vec<Managed>) = self
            .controllers
            .into_iter()
            .partition(|managed| managed.sharded || !election.enabled);

        let always = spawn!(
            "controllers",
            run_controllers(factory.clone(), always, shutdown.clone())
        );

        if !singletons.is_empty() {
            let identity = self
                .ctx
                .config()
                .global
                .pod_identity
                .clone()
                .unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
            let elector = LeaderElector::new(
                factory.api(),
                election.lease_name.as_str(),
                identity,
                Duration::from_secs(election.lease_duration_seconds),
                self.ctx.clock().clone(),
            );
            let slot = Mutex::new(Some(singletons));
            elector
                .run(shutdown.clone(), |leading| {
                    let controllers = slot.lock().take();
                    let factory = factory.clone();
                    let shutdown = shutdown.clone();
                    async move {
                        let Some(controllers) = controllers else {
                            return;
                        };
                        run_controllers(factory, controllers, leading).await;
                        if !shutdown.is_cancelled() {
                            warn!("Leadership lost, shutting down");
                            shutdown.cancel();
                        }
                    }
                })
                .await
                .err_tip(|| "Running leader election")?;
        }

        always.await.err_tip(|| "Joining controllers")?;
        info!("Scheduler stopped");
        Ok(())
    }
}

async fn run_controllers(
    factory: Arc<InformerFactory>,
    controllers: Vec<Managed>,
    shutdown: CancellationToken,
) {
    let tasks: Vec<_> = controllers
        .into_iter()
        .map(|managed| {
            let factory = factory.clone();
            let shutdown = shutdown.clone();
            let name = managed.controller.handle().name();
            spawn!(
                "controller",
                async move {
                    if let Err(err) = managed
                        .controller
                        .run(&factory, managed.reconciler, shutdown)
                        .await
                    {
                        error!(?err, "Controller failed");
                    }
                },
                controller = name
            )
        })
        .collect();
    for task in tasks {
        if let Err(err) = task.await {
            error!(?err, "Controller task panicked");
        }
    }
}
