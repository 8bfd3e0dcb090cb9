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

use core::fmt;
use core::marker::PhantomData;
use core::time::Duration;
use std::sync::Arc;

use gargantua_error::{Code, Error, ResultExt, make_err};
use gargantua_resources::Resource;
use gargantua_util::labels::LabelSelector;
use gargantua_util::retry::Retrier;
use serde_json::Value;
use tracing::debug;

use crate::object_store::{FieldSelector, ObjectStore, WatchEvent, Watcher};

/// Which part of an object a conflict-retried write targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subresource {
    /// Everything but `status`.
    Main,
    Status,
}

/// Typed view of one kind in an `ObjectStore`.
pub struct Api<K> {
    store: Arc<dyn ObjectStore>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> fmt::Debug for Api<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("kind", &K::KIND)
            .field("namespace", &self.store.namespace())
            .finish()
    }
}

impl<K: Resource> Api<K> {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }

    pub const fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn namespace(&self) -> &str {
        self.store.namespace()
    }

    pub fn encode(object: &K) -> Result<Value, Error> {
        let mut doc =
            serde_json::to_value(object).err_tip(|| format!("Encoding {}", K::KIND))?;
        if let Some(map) = doc.as_object_mut() {
            map.insert("apiVersion".to_string(), Value::String(K::api_version()));
            map.insert("kind".to_string(), Value::String(K::KIND.to_string()));
        }
        Ok(doc)
    }

    pub fn decode(doc: Value) -> Result<K, Error> {
        serde_json::from_value(doc).err_tip(|| format!("Decoding {}", K::KIND))
    }

    pub async fn get(&self, name: &str) -> Result<K, Error> {
        Self::decode(self.store.get(K::PLURAL, name).await?)
    }

    /// Like `get`, but a missing object is `None`.
    pub async fn get_opt(&self, name: &str) -> Result<Option<K>, Error> {
        match self.get(name).await {
            Ok(object) => Ok(Some(object)),
            Err(err) if err.code == Code::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>, Error> {
        Ok(self.list_with_version(selector).await?.0)
    }

    /// Objects matching `selector`, plus the store version they were read at.
    pub async fn list_with_version(
        &self,
        selector: &LabelSelector,
    ) -> Result<(Vec<K>, u64), Error> {
        let list = self.store.list(K::PLURAL, selector).await?;
        let objects = list
            .items
            .into_iter()
            .map(Self::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((objects, list.resource_version))
    }

    pub async fn create(&self, object: &K) -> Result<K, Error> {
        Self::decode(self.store.create(K::PLURAL, Self::encode(object)?).await?)
    }

    pub async fn update(&self, object: &K) -> Result<K, Error> {
        Self::decode(self.store.update(K::PLURAL, Self::encode(object)?).await?)
    }

    pub async fn update_status(&self, object: &K) -> Result<K, Error> {
        Self::decode(
            self.store
                .update_status(K::PLURAL, Self::encode(object)?)
                .await?,
        )
    }

    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        self.store.delete(K::PLURAL, name).await
    }

    /// Like `delete`, but a missing object counts as deleted.
    pub async fn delete_ignore_missing(&self, name: &str) -> Result<(), Error> {
        match self.delete(name).await {
            Err(err) if err.code == Code::NotFound => Ok(()),
            result => result,
        }
    }

    pub async fn delete_collection(&self, selector: &LabelSelector) -> Result<usize, Error> {
        self.store.delete_collection(K::PLURAL, selector).await
    }

    pub fn watch(&self, fields: FieldSelector) -> TypedWatcher<K> {
        TypedWatcher {
            inner: self.store.watch(K::PLURAL, fields),
            _kind: PhantomData,
        }
    }

    /// Fetches `name`, applies `mutate` and writes the result back, starting
    /// over from a fresh read whenever the write hits a resourceVersion
    /// conflict. Any other error is returned as is. When `mutate` leaves the
    /// object unchanged nothing is written.
    pub async fn retry_on_conflict<F>(
        &self,
        retrier: &Retrier,
        name: &str,
        subresource: Subresource,
        mut mutate: F,
    ) -> Result<K, Error>
    where
        F: FnMut(&mut K) -> Result<(), Error> + Send,
    {
        let mut backoff = retrier.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get(name).await?;
            let mut updated = current.clone();
            mutate(&mut updated)?;
            if updated == current {
                return Ok(current);
            }
            let result = match subresource {
                Subresource::Main => self.update(&updated).await,
                Subresource::Status => self.update_status(&updated).await,
            };
            match result {
                Err(err) if err.code == Code::Aborted => {
                    let Some(delay) = backoff.next() else {
                        return Err(err.append(format!("Giving up after attempt {attempt}")));
                    };
                    debug!(kind = K::KIND, name, attempt, ?delay, "write conflict, retrying");
                    retrier.sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    pub async fn update_with_retry<F>(
        &self,
        retrier: &Retrier,
        name: &str,
        mutate: F,
    ) -> Result<K, Error>
    where
        F: FnMut(&mut K) -> Result<(), Error> + Send,
    {
        self.retry_on_conflict(retrier, name, Subresource::Main, mutate)
            .await
    }

    pub async fn update_status_with_retry<F>(
        &self,
        retrier: &Retrier,
        name: &str,
        mutate: F,
    ) -> Result<K, Error>
    where
        F: FnMut(&mut K) -> Result<(), Error> + Send,
    {
        self.retry_on_conflict(retrier, name, Subresource::Status, mutate)
            .await
    }

    /// Waits until `name` is gone from the store. Fails with
    /// `DeadlineExceeded` if it is still present after `timeout`.
    pub async fn wait_for_deletion(&self, name: &str, timeout: Duration) -> Result<(), Error> {
        let mut watcher = self.watch(FieldSelector::name(name));
        if self.get_opt(name).await?.is_none() {
            return Ok(());
        }
        let wait = async {
            loop {
                match watcher.next().await {
                    Some(Ok(WatchEvent::Deleted(_))) => return Ok(()),
                    Some(Ok(_)) => {}
                    // Missed events; look at the store directly.
                    Some(Err(_)) => {
                        if self.get_opt(name).await?.is_none() {
                            return Ok(());
                        }
                    }
                    None => {
                        return Err(make_err!(
                            Code::Unavailable,
                            "Watch on {} closed while waiting for deletion",
                            K::KIND
                        ));
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .err_tip_with_code(|_| {
                (
                    Code::DeadlineExceeded,
                    format!("{} {name} still present after {timeout:?}", K::KIND),
                )
            })?
    }
}

/// A `Watcher` decoding events into `K`.
#[derive(Debug)]
pub struct TypedWatcher<K> {
    inner: Watcher,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Resource> TypedWatcher<K> {
    pub async fn next(&mut self) -> Option<Result<WatchEvent<K>, Error>> {
        let event = self.inner.next().await?;
        Some(event.and_then(|event| event.try_map(Api::<K>::decode)))
    }
}
