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

use core::str::FromStr;

use async_trait::async_trait;
use gargantua_error::{Code, Error, make_err, make_input_err};
use gargantua_util::labels::LabelSelector;
use gargantua_util::task::JoinHandleDropGuard;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

/// A change to one object, as seen by a watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    /// Carries the last state of the object, with a fresh resourceVersion.
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub const fn object(&self) -> &T {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }

    pub fn into_object(self) -> T {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }

    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<WatchEvent<U>, E> {
        Ok(match self {
            Self::Added(object) => WatchEvent::Added(f(object)?),
            Self::Modified(object) => WatchEvent::Modified(f(object)?),
            Self::Deleted(object) => WatchEvent::Deleted(f(object)?),
        })
    }
}

/// Restricts a watch by object fields. Only `metadata.name` is supported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FieldSelector {
    #[default]
    Everything,
    Name(String),
}

impl FieldSelector {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::Everything => true,
            Self::Name(name) => doc
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .is_some_and(|n| n == name),
        }
    }
}

impl FromStr for FieldSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::Everything);
        }
        let (field, value) = s
            .split_once("==")
            .or_else(|| s.split_once('='))
            .ok_or_else(|| make_input_err!("Invalid field selector '{s}'"))?;
        if field.trim() != "metadata.name" {
            return Err(make_input_err!(
                "Unsupported field '{}' in field selector",
                field.trim()
            ));
        }
        Ok(Self::Name(value.trim().to_string()))
    }
}

/// Result of a list call. `resource_version` is the store version the
/// listing was taken at; watch events at or below it are already reflected.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectList {
    pub items: Vec<Value>,
    pub resource_version: u64,
}

/// An event as broadcast by a store to every watcher.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    pub kind: String,
    pub event: WatchEvent<Value>,
}

#[derive(Debug)]
enum Source {
    Broadcast(broadcast::Receiver<StoredEvent>),
    /// Fed by a task that lives as long as the watcher.
    Channel {
        receiver: mpsc::Receiver<Result<WatchEvent<Value>, Error>>,
        _task: JoinHandleDropGuard<()>,
    },
}

/// Receives the events of one kind, filtered by a field selector.
#[derive(Debug)]
pub struct Watcher {
    kind: String,
    fields: FieldSelector,
    source: Source,
}

impl Watcher {
    pub fn new(
        kind: impl Into<String>,
        fields: FieldSelector,
        receiver: broadcast::Receiver<StoredEvent>,
    ) -> Self {
        Self {
            kind: kind.into(),
            fields,
            source: Source::Broadcast(receiver),
        }
    }

    /// A watcher over events that `task` pushes into `receiver`. Dropping
    /// the watcher aborts the task.
    pub fn from_task(
        kind: impl Into<String>,
        fields: FieldSelector,
        receiver: mpsc::Receiver<Result<WatchEvent<Value>, Error>>,
        task: JoinHandleDropGuard<()>,
    ) -> Self {
        Self {
            kind: kind.into(),
            fields,
            source: Source::Channel {
                receiver,
                _task: task,
            },
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Waits for the next matching event. Returns `None` once the store is
    /// gone. An `OutOfRange` error means events were dropped because this
    /// watcher fell behind or its stream was interrupted; the caller must
    /// list again.
    pub async fn next(&mut self) -> Option<Result<WatchEvent<Value>, Error>> {
        loop {
            match &mut self.source {
                Source::Broadcast(receiver) => match receiver.recv().await {
                    Ok(stored) => {
                        if stored.kind == self.kind && self.fields.matches(stored.event.object())
                        {
                            return Some(Ok(stored.event));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        return Some(Err(make_err!(
                            Code::OutOfRange,
                            "Watch on {} fell behind by {skipped} events",
                            self.kind
                        )));
                    }
                    Err(RecvError::Closed) => return None,
                },
                Source::Channel { receiver, .. } => match receiver.recv().await? {
                    Ok(event) if !self.fields.matches(event.object()) => {}
                    result => return Some(result),
                },
            }
        }
    }
}

/// Versioned document store. Every document is a JSON object with a
/// `metadata` section; `kind` is the resource plural.
///
/// Writes return the stored document with its new `resourceVersion`.
/// `update` and `update_status` fail with `Aborted` when the submitted
/// `resourceVersion` is stale; a `resourceVersion` of zero skips the check.
#[async_trait]
pub trait ObjectStore: core::fmt::Debug + Send + Sync + 'static {
    /// The single logical namespace every object lives in.
    fn namespace(&self) -> &str;

    async fn get(&self, kind: &str, name: &str) -> Result<Value, Error>;

    async fn list(&self, kind: &str, selector: &LabelSelector) -> Result<ObjectList, Error>;

    /// Assigns uid, timestamps and, when `metadata.name` is empty, a name
    /// derived from `metadata.generateName`.
    async fn create(&self, kind: &str, doc: Value) -> Result<Value, Error>;

    /// Writes everything but `status`.
    async fn update(&self, kind: &str, doc: Value) -> Result<Value, Error>;

    /// Writes only `status`.
    async fn update_status(&self, kind: &str, doc: Value) -> Result<Value, Error>;

    /// Objects with finalizers are only marked for deletion.
    async fn delete(&self, kind: &str, name: &str) -> Result<(), Error>;

    /// Applies `delete` to every match and returns how many matched.
    async fn delete_collection(&self, kind: &str, selector: &LabelSelector)
    -> Result<usize, Error>;

    /// Starts receiving events immediately; events that happen before the
    /// first `next()` are buffered.
    fn watch(&self, kind: &str, fields: FieldSelector) -> Watcher;
}
