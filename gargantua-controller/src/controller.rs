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

use core::fmt::Debug;
use core::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use gargantua_config::controllers::ControllerConfig;
use gargantua_config::queues::RateLimiterConfig;
use gargantua_error::{Error, ResultExt};
use gargantua_resources::Resource;
use gargantua_store::{Informer, InformerEvent, InformerFactory};
use gargantua_util::spawn;
use gargantua_util::workqueue::{RateLimitingQueue, default_controller_rate_limiter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Drives one object towards its desired state.
///
/// Returning an error puts the key back on the queue with backoff, unless
/// the error is permanent, in which case it is logged and dropped.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, name: &str) -> Result<(), Error>;
}

/// Decides which keys this process is responsible for.
pub trait EnqueueFilter: Debug + Send + Sync + 'static {
    fn accepts(&self, key: &str) -> bool;
}

/// `namespace/name`.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Splits a `namespace/name` key. Keys without a namespace have an empty one.
pub fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

#[derive(Debug)]
struct HandleInner {
    name: &'static str,
    namespace: String,
    queue: RateLimitingQueue<String>,
    filter: Option<Arc<dyn EnqueueFilter>>,
}

/// Cloneable enqueue side of a controller. Other controllers hold one to
/// wake this controller up for a specific object.
#[derive(Clone, Debug)]
pub struct ControllerHandle {
    inner: Arc<HandleInner>,
}

impl ControllerHandle {
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    fn key_for(&self, name: &str) -> Option<String> {
        let key = object_key(&self.inner.namespace, name);
        if self
            .inner
            .filter
            .as_ref()
            .is_some_and(|filter| !filter.accepts(&key))
        {
            trace!(controller = self.inner.name, %key, "Key belongs to another shard");
            return None;
        }
        Some(key)
    }

    pub fn enqueue(&self, name: &str) {
        if let Some(key) = self.key_for(name) {
            self.inner.queue.add(key);
        }
    }

    pub fn enqueue_after(&self, name: &str, delay: Duration) {
        if let Some(key) = self.key_for(name) {
            self.inner.queue.add_after(key, delay);
        }
    }

    pub fn enqueue_rate_limited(&self, name: &str) {
        if let Some(key) = self.key_for(name) {
            self.inner.queue.add_rate_limited(key);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Handles one key. Returns false once the queue is shut down and empty.
    async fn process_next(&self, reconciler: &dyn Reconciler) -> bool {
        let queue = &self.inner.queue;
        let Some(key) = queue.get().await else {
            return false;
        };
        let (_, name) = split_key(&key);
        match reconciler.reconcile(name).await {
            Ok(()) => {
                debug!(controller = self.inner.name, %key, "Reconciled");
                queue.forget(&key);
            }
            Err(err) if err.is_permanent() => {
                error!(
                    controller = self.inner.name,
                    %key,
                    ?err,
                    "Reconcile failed permanently, dropping key"
                );
                queue.forget(&key);
            }
            Err(err) => {
                warn!(
                    controller = self.inner.name,
                    %key,
                    requeues = queue.num_requeues(&key),
                    ?err,
                    "Reconcile failed, requeueing"
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
        true
    }
}

/// Informer-fed work queue plus a pool of workers calling a `Reconciler`.
#[derive(Debug)]
pub struct BaseController {
    handle: ControllerHandle,
    workers: usize,
}

impl BaseController {
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: &'static str,
        namespace: impl Into<String>,
        config: &ControllerConfig,
        rate_limiter: &RateLimiterConfig,
        filter: Option<Arc<dyn EnqueueFilter>>,
    ) -> Self {
        Self {
            handle: ControllerHandle {
                inner: Arc::new(HandleInner {
                    name,
                    namespace: namespace.into(),
                    queue: RateLimitingQueue::new(
                        name,
                        Box::new(default_controller_rate_limiter(rate_limiter)),
                    ),
                    filter,
                }),
            },
            workers: config.workers.max(1),
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    /// Enqueues every object of `K` the informer reports.
    pub fn watch<K: Resource>(&self, informer: &Informer<K>) {
        let handle = self.handle();
        informer.add_event_handler(move |event: &InformerEvent<K>| {
            handle.enqueue(event.object().name());
        });
    }

    /// Enqueues the names `related` derives from each event on another kind.
    pub fn watch_related<K, F>(&self, informer: &Informer<K>, related: F)
    where
        K: Resource,
        F: Fn(&InformerEvent<K>) -> Vec<String> + Send + Sync + 'static,
    {
        let handle = self.handle();
        informer.add_event_handler(move |event: &InformerEvent<K>| {
            for name in related(event) {
                handle.enqueue(&name);
            }
        });
    }

    /// Waits for the informer caches, then runs the workers until `shutdown`
    /// fires. On shutdown the queue stops accepting keys, queued keys are
    /// still handed out, and this returns once every worker has exited.
    pub async fn run(
        self,
        factory: &InformerFactory,
        reconciler: Arc<dyn Reconciler>,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let name = self.handle.name();
        if !factory.wait_for_cache_sync(&shutdown).await {
            info!(controller = name, "Shut down before caches synced");
            self.handle.inner.queue.shut_down();
            return Ok(());
        }
        info!(controller = name, workers = self.workers, "Starting workers");
        let workers: Vec<_> = (0..self.workers)
            .map(|worker| {
                let handle = self.handle.clone();
                let reconciler = reconciler.clone();
                spawn!(
                    "controller_worker",
                    async move { while handle.process_next(reconciler.as_ref()).await {} },
                    controller = name,
                    worker
                )
            })
            .collect();

        shutdown.cancelled().await;
        info!(controller = name, "Shutting down, draining queue");
        self.handle.inner.queue.shut_down_with_drain().await;
        for worker in workers {
            worker
                .await
                .err_tip(|| format!("Worker of controller {name} failed"))?;
        }
        Ok(())
    }
}
