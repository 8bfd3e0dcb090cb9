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

//! Watch-fed caches of one kind.
//!
//! An `Informer` lists its kind once, then applies watch events to a local
//! map and forwards every change to the registered handlers. If its watch
//! falls behind it lists again and emits the difference. `Lister`s read the
//! map and refuse to answer until the first listing has been applied.

use core::any::{Any, TypeId};
use core::fmt;
use core::time::Duration;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use gargantua_error::{Code, Error, ResultExt, make_err};
use gargantua_resources::Resource;
use gargantua_util::labels::LabelSelector;
use gargantua_util::spawn;
use gargantua_util::task::JoinHandleDropGuard;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::Api;
use crate::object_store::{FieldSelector, ObjectStore, WatchEvent};

/// Wait before listing again after a failed list.
const RELIST_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum InformerEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> InformerEvent<K> {
    /// The current state of the object, or its last state if deleted.
    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Added(object) | Self::Deleted(object) => object,
            Self::Updated { new, .. } => new,
        }
    }
}

pub type EventHandler<K> = Arc<dyn Fn(&InformerEvent<K>) + Send + Sync>;

struct InformerState<K> {
    objects: BTreeMap<String, Arc<K>>,
    /// Store version the cache reflects. Watch events at or below it are
    /// already applied.
    resource_version: u64,
}

struct InformerInner<K> {
    api: Api<K>,
    state: RwLock<InformerState<K>>,
    handlers: RwLock<Vec<EventHandler<K>>>,
    synced: watch::Sender<bool>,
    resync_period: Option<Duration>,
}

pub struct Informer<K> {
    inner: Arc<InformerInner<K>>,
}

impl<K> Clone for Informer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Resource> fmt::Debug for Informer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Informer")
            .field("kind", &K::KIND)
            .field("synced", &self.has_synced())
            .finish_non_exhaustive()
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => core::future::pending().await,
    }
}

impl<K: Resource> Informer<K> {
    pub fn new(api: Api<K>) -> Self {
        Self::with_resync_period(api, None)
    }

    /// With a resync period, every cached object is re-delivered to the
    /// handlers as an update on that period.
    pub fn with_resync_period(api: Api<K>, resync_period: Option<Duration>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(InformerInner {
                api,
                state: RwLock::new(InformerState {
                    objects: BTreeMap::new(),
                    resource_version: 0,
                }),
                handlers: RwLock::new(Vec::new()),
                synced,
                resync_period,
            }),
        }
    }

    pub fn api(&self) -> &Api<K> {
        &self.inner.api
    }

    pub fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    pub fn lister(&self) -> Lister<K> {
        Lister {
            inner: self.inner.clone(),
        }
    }

    /// Registers `handler`. If the cache is already synced, the handler is
    /// first sent an `Added` event for every cached object.
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(&InformerEvent<K>) + Send + Sync + 'static,
    {
        let handler: EventHandler<K> = Arc::new(handler);
        let existing: Vec<Arc<K>> = {
            let state = self.inner.state.read();
            self.inner.handlers.write().push(handler.clone());
            if self.has_synced() {
                state.objects.values().cloned().collect()
            } else {
                Vec::new()
            }
        };
        for object in existing {
            handler(&InformerEvent::Added(object));
        }
    }

    /// Resolves once the first listing is applied. Returns false if
    /// `shutdown` fires first.
    pub async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        let mut synced = self.inner.synced.subscribe();
        tokio::select! {
            synced = async { synced.wait_for(|synced| *synced).await.is_ok() } => synced,
            () = shutdown.cancelled() => false,
        }
    }

    fn dispatch(&self, event: &InformerEvent<K>) {
        let handlers = self.inner.handlers.read().clone();
        for handler in &handlers {
            handler(event);
        }
    }

    fn apply(&self, event: WatchEvent<Value>) {
        let event = match event.try_map(Api::<K>::decode) {
            Ok(event) => event,
            Err(err) => {
                warn!(kind = K::KIND, ?err, "Dropping undecodable watch event");
                return;
            }
        };
        let informer_event = {
            let mut state = self.inner.state.write();
            let resource_version = event.object().meta().resource_version;
            if resource_version <= state.resource_version {
                return;
            }
            state.resource_version = resource_version;
            match event {
                WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                    let new = Arc::new(object);
                    match state.objects.insert(new.name().to_string(), new.clone()) {
                        Some(old) => InformerEvent::Updated { old, new },
                        None => InformerEvent::Added(new),
                    }
                }
                WatchEvent::Deleted(object) => {
                    state.objects.remove(object.name());
                    InformerEvent::Deleted(Arc::new(object))
                }
            }
        };
        self.dispatch(&informer_event);
    }

    /// Replaces the cache with a fresh listing and emits the difference.
    async fn relist(&self) -> Result<(), Error> {
        let (objects, resource_version) = self
            .inner
            .api
            .list_with_version(&LabelSelector::everything())
            .await
            .err_tip(|| format!("Listing {} for informer", K::KIND))?;
        let fresh: BTreeMap<String, Arc<K>> = objects
            .into_iter()
            .map(|object| (object.name().to_string(), Arc::new(object)))
            .collect();
        let events = {
            let mut state = self.inner.state.write();
            let mut events = Vec::new();
            for (name, new) in &fresh {
                match state.objects.get(name) {
                    Some(old) if old.meta().resource_version == new.meta().resource_version => {}
                    Some(old) => events.push(InformerEvent::Updated {
                        old: old.clone(),
                        new: new.clone(),
                    }),
                    None => events.push(InformerEvent::Added(new.clone())),
                }
            }
            for (name, old) in &state.objects {
                if !fresh.contains_key(name) {
                    events.push(InformerEvent::Deleted(old.clone()));
                }
            }
            state.objects = fresh;
            state.resource_version = resource_version;
            events
        };
        for event in &events {
            self.dispatch(event);
        }
        self.inner.synced.send_replace(true);
        Ok(())
    }

    fn resync(&self) {
        let objects: Vec<Arc<K>> = self.inner.state.read().objects.values().cloned().collect();
        debug!(kind = K::KIND, count = objects.len(), "Resyncing informer");
        for object in objects {
            self.dispatch(&InformerEvent::Updated {
                old: object.clone(),
                new: object,
            });
        }
    }

    /// Lists and watches until `shutdown` fires or the store goes away.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            // Subscribe before listing so no event between the two is lost.
            let mut watcher = self
                .inner
                .api
                .store()
                .watch(K::PLURAL, FieldSelector::Everything);
            if let Err(err) = self.relist().await {
                warn!(kind = K::KIND, ?err, "Informer list failed");
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(RELIST_DELAY) => continue,
                }
            }
            info!(kind = K::KIND, "Informer synced");
            let mut resync = self
                .inner
                .resync_period
                .map(|period| tokio::time::interval_at(Instant::now() + period, period));
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    event = watcher.next() => match event {
                        Some(Ok(event)) => self.apply(event),
                        Some(Err(err)) => {
                            warn!(kind = K::KIND, ?err, "Informer watch interrupted, relisting");
                            break;
                        }
                        None => return,
                    },
                    () = tick(&mut resync) => self.resync(),
                }
            }
        }
    }
}

/// Read access to an informer's cache.
pub struct Lister<K> {
    inner: Arc<InformerInner<K>>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Resource> fmt::Debug for Lister<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lister")
            .field("kind", &K::KIND)
            .finish_non_exhaustive()
    }
}

impl<K: Resource> Lister<K> {
    pub fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    fn ensure_synced(&self) -> Result<(), Error> {
        if self.has_synced() {
            return Ok(());
        }
        Err(make_err!(
            Code::Unavailable,
            "{} cache is not synced yet",
            K::KIND
        ))
    }

    pub fn get(&self, name: &str) -> Result<Arc<K>, Error> {
        self.ensure_synced()?;
        self.inner
            .state
            .read()
            .objects
            .get(name)
            .cloned()
            .err_tip_with_code(|_| (Code::NotFound, format!("{} {name} not found", K::KIND)))
    }

    pub fn list(&self, selector: &LabelSelector) -> Result<Vec<Arc<K>>, Error> {
        self.ensure_synced()?;
        Ok(self
            .inner
            .state
            .read()
            .objects
            .values()
            .filter(|object| selector.matches(&object.meta().labels))
            .cloned()
            .collect())
    }
}

/// Type-erased informer, so informers of different kinds can be shared
/// and started together.
trait SharedInformer: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn kind(&self) -> &'static str;

    fn start(&self, shutdown: CancellationToken) -> JoinHandleDropGuard<()>;

    fn synced(&self) -> watch::Receiver<bool>;
}

impl<K: Resource> SharedInformer for Informer<K> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn kind(&self) -> &'static str {
        K::KIND
    }

    fn start(&self, shutdown: CancellationToken) -> JoinHandleDropGuard<()> {
        let informer = self.clone();
        spawn!(
            "informer",
            async move { informer.run(shutdown).await },
            kind = K::KIND
        )
    }

    fn synced(&self) -> watch::Receiver<bool> {
        self.inner.synced.subscribe()
    }
}

#[derive(Default)]
struct FactoryState {
    informers: HashMap<TypeId, Arc<dyn SharedInformer>>,
    running: HashMap<TypeId, JoinHandleDropGuard<()>>,
}

/// Hands out one shared informer per kind, so every controller watching a
/// kind reads the same cache.
pub struct InformerFactory {
    store: Arc<dyn ObjectStore>,
    resync_period: Option<Duration>,
    state: Mutex<FactoryState>,
}

impl fmt::Debug for InformerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&'static str> = self
            .state
            .lock()
            .informers
            .values()
            .map(|informer| informer.kind())
            .collect();
        f.debug_struct("InformerFactory")
            .field("kinds", &kinds)
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

impl InformerFactory {
    pub fn new(store: Arc<dyn ObjectStore>, resync_period: Option<Duration>) -> Self {
        Self {
            store,
            resync_period,
            state: Mutex::new(FactoryState::default()),
        }
    }

    pub const fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn api<K: Resource>(&self) -> Api<K> {
        Api::new(self.store.clone())
    }

    pub fn informer<K: Resource>(&self) -> Informer<K> {
        let mut state = self.state.lock();
        let shared = state
            .informers
            .entry(TypeId::of::<K>())
            .or_insert_with(|| {
                Arc::new(Informer::<K>::with_resync_period(
                    self.api(),
                    self.resync_period,
                ))
            });
        match shared.as_any().downcast_ref::<Informer<K>>() {
            Some(informer) => informer.clone(),
            None => unreachable!("informer for {} registered under another type", K::KIND),
        }
    }

    pub fn lister<K: Resource>(&self) -> Lister<K> {
        self.informer::<K>().lister()
    }

    /// Starts every informer requested so far that is not running yet.
    pub fn start(&self, shutdown: &CancellationToken) {
        let mut state = self.state.lock();
        let pending: Vec<(TypeId, Arc<dyn SharedInformer>)> = state
            .informers
            .iter()
            .filter(|(type_id, _)| !state.running.contains_key(type_id))
            .map(|(type_id, informer)| (*type_id, informer.clone()))
            .collect();
        for (type_id, informer) in pending {
            debug!(kind = informer.kind(), "Starting informer");
            state
                .running
                .insert(type_id, informer.start(shutdown.child_token()));
        }
    }

    pub fn has_synced(&self) -> bool {
        self.state
            .lock()
            .informers
            .values()
            .all(|informer| *informer.synced().borrow())
    }

    /// Waits for every informer requested so far. Returns false if
    /// `shutdown` fires first.
    pub async fn wait_for_cache_sync(&self, shutdown: &CancellationToken) -> bool {
        let receivers: Vec<watch::Receiver<bool>> = self
            .state
            .lock()
            .informers
            .values()
            .map(|informer| informer.synced())
            .collect();
        for mut receiver in receivers {
            let synced = async { receiver.wait_for(|synced| *synced).await.is_ok() };
            tokio::select! {
                synced = synced => {
                    if !synced {
                        return false;
                    }
                }
                () = shutdown.cancelled() => return false,
            }
        }
        true
    }
}
