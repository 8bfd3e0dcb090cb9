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

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use gargantua_error::{Code, Error, ResultExt, error_if, make_err};
use gargantua_resources::ObjectMeta;
use gargantua_util::clock::{ClockRef, default_clock};
use gargantua_util::labels::LabelSelector;
use gargantua_util::names::random_alphanumeric;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::object_store::{
    FieldSelector, ObjectList, ObjectStore, StoredEvent, WatchEvent, Watcher,
};

/// Events buffered per watcher before it is considered lagging.
const WATCH_CHANNEL_CAPACITY: usize = 4096;

const GENERATED_NAME_SUFFIX_LEN: usize = 5;

#[derive(Debug, Default)]
struct StoreState {
    resource_version: u64,
    kinds: HashMap<String, BTreeMap<String, Value>>,
}

impl StoreState {
    const fn next_version(&mut self) -> u64 {
        self.resource_version += 1;
        self.resource_version
    }

    fn contains(&self, kind: &str, name: &str) -> bool {
        self.kinds
            .get(kind)
            .is_some_and(|objects| objects.contains_key(name))
    }

    fn get(&self, kind: &str, name: &str) -> Result<&Value, Error> {
        self.kinds
            .get(kind)
            .and_then(|objects| objects.get(name))
            .err_tip_with_code(|_| (Code::NotFound, format!("{kind} {name} not found")))
    }

    fn insert(&mut self, kind: &str, name: String, doc: Value) {
        self.kinds.entry(kind.to_string()).or_default().insert(name, doc);
    }

    fn remove(&mut self, kind: &str, name: &str) {
        if let Some(objects) = self.kinds.get_mut(kind) {
            objects.remove(name);
        }
    }
}

fn object_mut<'a>(doc: &'a mut Value, kind: &str) -> Result<&'a mut Map<String, Value>, Error> {
    doc.as_object_mut().err_tip_with_code(|_| {
        (
            Code::InvalidArgument,
            format!("{kind} document is not a JSON object"),
        )
    })
}

fn read_meta(doc: &Value, kind: &str) -> Result<ObjectMeta, Error> {
    match doc.get("metadata") {
        None | Some(Value::Null) => Ok(ObjectMeta::default()),
        Some(meta) => serde_json::from_value(meta.clone()).err_tip_with_code(|_| {
            (
                Code::InvalidArgument,
                format!("Invalid metadata in {kind} document"),
            )
        }),
    }
}

fn write_meta(doc: &mut Value, kind: &str, meta: &ObjectMeta) -> Result<(), Error> {
    let meta = serde_json::to_value(meta).err_tip(|| format!("Encoding {kind} metadata"))?;
    object_mut(doc, kind)?.insert("metadata".to_string(), meta);
    Ok(())
}

fn check_version(kind: &str, submitted: &ObjectMeta, current: &ObjectMeta) -> Result<(), Error> {
    if submitted.resource_version != 0 && submitted.resource_version != current.resource_version
    {
        return Err(make_err!(
            Code::Aborted,
            "Conflict writing {kind} {}: resourceVersion {} does not match current {}",
            current.name,
            submitted.resource_version,
            current.resource_version
        ));
    }
    Ok(())
}

/// In-process `ObjectStore`. All kinds share one `resourceVersion` counter,
/// and events are published while the state lock is held, so watchers see
/// them in version order.
#[derive(Debug)]
pub struct MemoryObjectStore {
    namespace: String,
    clock: ClockRef,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoredEvent>,
}

impl MemoryObjectStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_clock(namespace, default_clock())
    }

    pub fn with_clock(namespace: impl Into<String>, clock: ClockRef) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            namespace: namespace.into(),
            clock,
            state: Mutex::new(StoreState::default()),
            events,
        }
    }

    /// Current store-wide resourceVersion.
    pub fn resource_version(&self) -> u64 {
        self.state.lock().resource_version
    }

    fn publish(&self, kind: &str, event: WatchEvent<Value>) {
        // Having no watchers is fine.
        drop(self.events.send(StoredEvent {
            kind: kind.to_string(),
            event,
        }));
    }

    /// Persists `doc` over `current`. A write that changes nothing keeps the
    /// old version and emits no event. An object being deleted whose last
    /// finalizer is gone is removed.
    fn commit(
        &self,
        state: &mut StoreState,
        kind: &str,
        current: &Value,
        mut doc: Value,
    ) -> Result<Value, Error> {
        if &doc == current {
            return Ok(doc);
        }
        let mut meta = read_meta(&doc, kind)?;
        meta.resource_version = state.next_version();
        write_meta(&mut doc, kind, &meta)?;
        if meta.is_deleting() && meta.finalizers.is_empty() {
            trace!(kind, name = %meta.name, "last finalizer removed, deleting");
            state.remove(kind, &meta.name);
            self.publish(kind, WatchEvent::Deleted(doc.clone()));
        } else {
            state.insert(kind, meta.name.clone(), doc.clone());
            self.publish(kind, WatchEvent::Modified(doc.clone()));
        }
        Ok(doc)
    }

    fn delete_locked(
        &self,
        state: &mut StoreState,
        kind: &str,
        current: Value,
    ) -> Result<(), Error> {
        let mut meta = read_meta(&current, kind)?;
        if meta.finalizers.is_empty() {
            state.remove(kind, &meta.name);
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(self.clock.now());
            }
            meta.resource_version = state.next_version();
            let mut doc = current;
            write_meta(&mut doc, kind, &meta)?;
            self.publish(kind, WatchEvent::Deleted(doc));
        } else if !meta.is_deleting() {
            trace!(kind, name = %meta.name, finalizers = ?meta.finalizers, "marking for deletion");
            meta.deletion_timestamp = Some(self.clock.now());
            let mut doc = current.clone();
            write_meta(&mut doc, kind, &meta)?;
            self.commit(state, kind, &current, doc)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, kind: &str, name: &str) -> Result<Value, Error> {
        self.state.lock().get(kind, name).cloned()
    }

    async fn list(&self, kind: &str, selector: &LabelSelector) -> Result<ObjectList, Error> {
        let state = self.state.lock();
        let mut items = Vec::new();
        for doc in state.kinds.get(kind).into_iter().flat_map(BTreeMap::values) {
            if selector.is_empty() || selector.matches(&read_meta(doc, kind)?.labels) {
                items.push(doc.clone());
            }
        }
        Ok(ObjectList {
            items,
            resource_version: state.resource_version,
        })
    }

    async fn create(&self, kind: &str, mut doc: Value) -> Result<Value, Error> {
        object_mut(&mut doc, kind)?;
        let mut meta = read_meta(&doc, kind)?;
        let mut state = self.state.lock();
        if meta.name.is_empty() {
            error_if!(
                meta.generate_name.is_empty(),
                "{kind} needs either metadata.name or metadata.generateName"
            );
            meta.name = loop {
                let candidate = format!(
                    "{}{}",
                    meta.generate_name,
                    random_alphanumeric(GENERATED_NAME_SUFFIX_LEN).to_ascii_lowercase()
                );
                if !state.contains(kind, &candidate) {
                    break candidate;
                }
            };
        } else if state.contains(kind, &meta.name) {
            return Err(make_err!(
                Code::AlreadyExists,
                "{kind} {} already exists",
                meta.name
            ));
        }
        meta.namespace.clone_from(&self.namespace);
        meta.uid = Uuid::new_v4().to_string();
        meta.creation_timestamp = Some(self.clock.now());
        meta.deletion_timestamp = None;
        meta.resource_version = state.next_version();
        write_meta(&mut doc, kind, &meta)?;
        state.insert(kind, meta.name.clone(), doc.clone());
        self.publish(kind, WatchEvent::Added(doc.clone()));
        Ok(doc)
    }

    async fn update(&self, kind: &str, mut doc: Value) -> Result<Value, Error> {
        object_mut(&mut doc, kind)?;
        let mut meta = read_meta(&doc, kind)?;
        let mut state = self.state.lock();
        let current = state.get(kind, &meta.name)?.clone();
        let current_meta = read_meta(&current, kind)?;
        check_version(kind, &meta, &current_meta)?;

        // Store-owned fields cannot be changed through an update.
        meta.namespace = current_meta.namespace;
        meta.uid = current_meta.uid;
        meta.creation_timestamp = current_meta.creation_timestamp;
        meta.deletion_timestamp = current_meta.deletion_timestamp;
        meta.resource_version = current_meta.resource_version;
        write_meta(&mut doc, kind, &meta)?;

        let object = object_mut(&mut doc, kind)?;
        match current.get("status") {
            Some(status) => object.insert("status".to_string(), status.clone()),
            None => object.remove("status"),
        };
        self.commit(&mut state, kind, &current, doc)
    }

    async fn update_status(&self, kind: &str, doc: Value) -> Result<Value, Error> {
        let meta = read_meta(&doc, kind)?;
        let mut state = self.state.lock();
        let current = state.get(kind, &meta.name)?.clone();
        check_version(kind, &meta, &read_meta(&current, kind)?)?;

        let mut updated = current.clone();
        let object = object_mut(&mut updated, kind)?;
        match doc.get("status") {
            Some(status) => object.insert("status".to_string(), status.clone()),
            None => object.remove("status"),
        };
        self.commit(&mut state, kind, &current, updated)
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        let current = state.get(kind, name)?.clone();
        self.delete_locked(&mut state, kind, current)
    }

    async fn delete_collection(
        &self,
        kind: &str,
        selector: &LabelSelector,
    ) -> Result<usize, Error> {
        let mut state = self.state.lock();
        let mut matches = Vec::new();
        for doc in state.kinds.get(kind).into_iter().flat_map(BTreeMap::values) {
            if selector.matches(&read_meta(doc, kind)?.labels) {
                matches.push(doc.clone());
            }
        }
        let count = matches.len();
        for doc in matches {
            self.delete_locked(&mut state, kind, doc)?;
        }
        Ok(count)
    }

    fn watch(&self, kind: &str, fields: FieldSelector) -> Watcher {
        Watcher::new(kind, fields, self.events.subscribe())
    }
}
