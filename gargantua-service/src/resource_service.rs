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
use core::str::FromStr;

use bytes::Bytes;
use gargantua_error::{Code, Error, make_err};
use gargantua_resources::Resource;
use gargantua_scheduler::{ControllerHandles, SchedulerContext};
use gargantua_store::{Api, Lister};
use gargantua_util::labels::LabelSelector;
use serde::{Deserialize, Serialize};
use tonic::Status;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListRequest {
    pub label_selector: String,
    /// Read from the informer cache instead of the store. Fails with
    /// `Unavailable` until the cache has synced.
    pub load_from_cache: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteCollectionRequest {
    pub label_selector: String,
}

/// Converts `err` into a status carrying the JSON encoded `request` as its
/// details.
pub fn error_to_status<R: Serialize + ?Sized>(err: Error, request: &R) -> Status {
    let status = Status::from(err);
    match serde_json::to_vec(request) {
        Ok(details) => Status::with_details(status.code(), status.message(), Bytes::from(details)),
        Err(_) => status,
    }
}

/// Create, read, update and delete of one kind, plus a way to poke the
/// controller reconciling it.
pub struct ResourceService<K> {
    api: Api<K>,
    lister: Lister<K>,
    handles: ControllerHandles,
}

impl<K: Resource> fmt::Debug for ResourceService<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceService")
            .field("kind", &K::KIND)
            .finish_non_exhaustive()
    }
}

impl<K: Resource> ResourceService<K> {
    /// Registers `K`'s informer with the context's factory if it is not
    /// there yet, so this must be called before the factory starts for
    /// cache reads to ever succeed.
    pub fn new(ctx: &SchedulerContext, handles: ControllerHandles) -> Self {
        Self {
            api: ctx.api(),
            lister: ctx.lister(),
            handles,
        }
    }

    pub async fn create(&self, object: &K) -> Result<K, Status> {
        self.api
            .create(object)
            .await
            .map_err(|err| error_to_status(err, object))
    }

    pub async fn get(&self, request: &NameRequest) -> Result<K, Status> {
        self.api
            .get(&request.name)
            .await
            .map_err(|err| error_to_status(err, request))
    }

    pub async fn update(&self, object: &K) -> Result<K, Status> {
        self.api
            .update(object)
            .await
            .map_err(|err| error_to_status(err, object))
    }

    pub async fn update_status(&self, object: &K) -> Result<K, Status> {
        self.api
            .update_status(object)
            .await
            .map_err(|err| error_to_status(err, object))
    }

    pub async fn delete(&self, request: &NameRequest) -> Result<(), Status> {
        self.api
            .delete(&request.name)
            .await
            .map_err(|err| error_to_status(err, request))
    }

    pub async fn delete_collection(
        &self,
        request: &DeleteCollectionRequest,
    ) -> Result<usize, Status> {
        let result = async {
            let selector = LabelSelector::from_str(&request.label_selector)?;
            self.api.delete_collection(&selector).await
        };
        result.await.map_err(|err| error_to_status(err, request))
    }

    pub async fn list(&self, request: &ListRequest) -> Result<Vec<K>, Status> {
        let result = async {
            let selector = LabelSelector::from_str(&request.label_selector)?;
            if !request.load_from_cache {
                return self.api.list(&selector).await;
            }
            Ok(self
                .lister
                .list(&selector)?
                .into_iter()
                .map(|object| K::clone(&object))
                .collect())
        };
        result.await.map_err(|err| error_to_status(err, request))
    }

    pub async fn add_to_workqueue(&self, request: &NameRequest) -> Result<(), Status> {
        let handle = self.handles.for_kind(K::KIND).ok_or_else(|| {
            error_to_status(
                make_err!(Code::FailedPrecondition, "No controller reconciles {}", K::KIND),
                request,
            )
        })?;
        debug!(controller = handle.name(), name = %request.name, "Enqueued on request");
        handle.enqueue(&request.name);
        Ok(())
    }
}
