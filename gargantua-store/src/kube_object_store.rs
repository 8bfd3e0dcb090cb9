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

//! `ObjectStore` backed by a Kubernetes API server.
//!
//! Documents travel as `DynamicObject`s. Our `resourceVersion` is numeric
//! while the API server's is an opaque string, so it is converted on the
//! way in and out; Secrets are read back through their base64 `data`.

use core::fmt;
use std::collections::HashMap;
use std::pin::pin;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use gargantua_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};
use gargantua_resources::{ALL_KINDS, KindInfo, Resource, Secret};
use gargantua_util::labels::LabelSelector;
use gargantua_util::spawn;
use kube::Client;
use kube::api::{Api as KubeApi, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::object_store::{FieldSelector, ObjectList, ObjectStore, WatchEvent, Watcher};

/// Events buffered per watcher before the forwarding task waits.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Maps an API server failure onto our codes. A 409 is a stale
/// `resourceVersion` unless the server says the name is taken.
pub fn from_kube(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) => {
            let code = match response.code {
                400 | 422 => Code::InvalidArgument,
                401 => Code::Unauthenticated,
                403 => Code::PermissionDenied,
                404 => Code::NotFound,
                409 if response.reason == "AlreadyExists" => Code::AlreadyExists,
                409 => Code::Aborted,
                410 => Code::OutOfRange,
                429 | 500.. => Code::Unavailable,
                _ => Code::Internal,
            };
            make_err!(code, "{}", response.message)
        }
        other => make_err!(Code::Unavailable, "{other}"),
    }
}

fn api_resource(info: &KindInfo) -> ApiResource {
    ApiResource {
        group: info.group.to_string(),
        version: info.version.to_string(),
        api_version: info.api_version(),
        kind: info.kind.to_string(),
        plural: info.plural.to_string(),
    }
}

/// Turns one of our documents into what the API server accepts.
fn to_wire(
    resource: &ApiResource,
    namespace: &str,
    mut doc: Value,
) -> Result<DynamicObject, Error> {
    {
        let object = doc.as_object_mut().ok_or_else(|| {
            make_input_err!("{} document is not a JSON object", resource.plural)
        })?;
        object.insert("apiVersion".to_string(), resource.api_version.clone().into());
        object.insert("kind".to_string(), resource.kind.clone().into());
        let meta = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| make_input_err!("Invalid metadata in {} document", resource.plural))?;
        meta.insert("namespace".to_string(), namespace.into());
        if let Some(version) = meta.remove("resourceVersion") {
            if version.as_u64().is_some_and(|version| version != 0) {
                meta.insert("resourceVersion".to_string(), version.to_string().into());
            }
        }
        for key in ["name", "generateName", "uid"] {
            if meta.get(key).and_then(Value::as_str) == Some("") {
                meta.remove(key);
            }
        }
    }
    serde_json::from_value(doc)
        .err_tip(|| format!("Encoding {} for the API server", resource.plural))
}

/// Turns an API server object back into one of our documents.
fn from_wire(plural: &str, object: DynamicObject) -> Result<Value, Error> {
    let mut doc = serde_json::to_value(object).err_tip(|| format!("Decoding {plural}"))?;
    let meta = doc
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .err_tip_with_code(|_| (Code::DataLoss, format!("{plural} object has no metadata")))?;
    if let Some(version) = meta.get("resourceVersion").and_then(Value::as_str) {
        let version: u64 = version.parse().err_tip_with_code(|_| {
            (
                Code::DataLoss,
                format!("{plural} resourceVersion {version:?} is not numeric"),
            )
        })?;
        meta.insert("resourceVersion".to_string(), version.into());
    }
    if plural == Secret::PLURAL {
        decode_secret_data(&mut doc)?;
    }
    Ok(doc)
}

/// The server only returns `data`; fold it into `stringData`.
fn decode_secret_data(doc: &mut Value) -> Result<(), Error> {
    let Some(object) = doc.as_object_mut() else {
        return Ok(());
    };
    let Some(Value::Object(data)) = object.remove("data") else {
        return Ok(());
    };
    let string_data = object
        .entry("stringData")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .err_tip_with_code(|_| (Code::DataLoss, "Secret stringData is not an object"))?;
    for (key, encoded) in data {
        let Some(encoded) = encoded.as_str() else {
            continue;
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| make_err!(Code::DataLoss, "Secret field {key} is not base64: {e}"))?;
        let value = String::from_utf8(bytes)
            .map_err(|e| make_err!(Code::DataLoss, "Secret field {key} is not UTF-8: {e}"))?;
        string_data.entry(key).or_insert(value.into());
    }
    Ok(())
}

fn name_of<'a>(doc: &'a Value, kind: &str) -> Result<&'a str, Error> {
    let name = doc
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    error_if!(name.is_empty(), "{kind} document has no name");
    Ok(name)
}

/// Pushes the events of one watch into `sender` until the receiving
/// watcher is dropped. A stream that had to list again reports
/// `OutOfRange`, since deletions in between were not seen.
async fn forward_events(
    api: KubeApi<DynamicObject>,
    config: watcher::Config,
    plural: String,
    sender: mpsc::Sender<Result<WatchEvent<Value>, Error>>,
) {
    let mut stream = pin!(watcher::watcher(api, config).default_backoff());
    let mut initialized = false;
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(Event::Init) if initialized => Err(make_err!(
                Code::OutOfRange,
                "Watch on {plural} restarted from a fresh listing"
            )),
            Ok(Event::Init) => continue,
            Ok(Event::InitDone) => {
                initialized = true;
                continue;
            }
            Ok(Event::InitApply(object)) => {
                WatchEvent::Added(object).try_map(|object| from_wire(&plural, object))
            }
            Ok(Event::Apply(object)) => {
                WatchEvent::Modified(object).try_map(|object| from_wire(&plural, object))
            }
            Ok(Event::Delete(object)) => {
                WatchEvent::Deleted(object).try_map(|object| from_wire(&plural, object))
            }
            Err(err) => Err(make_err!(
                Code::OutOfRange,
                "Watch on {plural} interrupted: {err}"
            )),
        };
        if sender.send(event).await.is_err() {
            return;
        }
    }
}

pub struct KubeObjectStore {
    client: Client,
    namespace: String,
    resources: HashMap<&'static str, ApiResource>,
}

impl fmt::Debug for KubeObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeObjectStore")
            .field("namespace", &self.namespace)
            .field("kinds", &self.resources.len())
            .finish_non_exhaustive()
    }
}

impl KubeObjectStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            resources: ALL_KINDS
                .iter()
                .map(|info| (info.plural, api_resource(info)))
                .collect(),
        }
    }

    /// Connects with the in-cluster service account, or the local
    /// kubeconfig outside a cluster.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self, Error> {
        let client = Client::try_default()
            .await
            .map_err(from_kube)
            .err_tip(|| "Creating Kubernetes client")?;
        let store = Self::new(client, namespace);
        info!(namespace = %store.namespace, "Connected to the Kubernetes API server");
        Ok(store)
    }

    fn resource(&self, kind: &str) -> Result<&ApiResource, Error> {
        self.resources
            .get(kind)
            .ok_or_else(|| make_input_err!("Unknown kind {kind}"))
    }

    fn api(&self, kind: &str) -> Result<(KubeApi<DynamicObject>, &ApiResource), Error> {
        let resource = self.resource(kind)?;
        let api = KubeApi::namespaced_with(self.client.clone(), &self.namespace, resource);
        Ok((api, resource))
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, kind: &str, name: &str) -> Result<Value, Error> {
        let (api, _) = self.api(kind)?;
        let object = api
            .get(name)
            .await
            .map_err(from_kube)
            .err_tip(|| format!("Getting {kind} {name}"))?;
        from_wire(kind, object)
    }

    async fn list(&self, kind: &str, selector: &LabelSelector) -> Result<ObjectList, Error> {
        let (api, _) = self.api(kind)?;
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let list = api
            .list(&params)
            .await
            .map_err(from_kube)
            .err_tip(|| format!("Listing {kind}"))?;
        let resource_version = match list.metadata.resource_version.as_deref() {
            Some(version) if !version.is_empty() => version.parse::<u64>().err_tip_with_code(
                |_| (Code::DataLoss, format!("{kind} list version {version:?} is not numeric")),
            )?,
            _ => 0,
        };
        let items = list
            .items
            .into_iter()
            .map(|object| from_wire(kind, object))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ObjectList {
            items,
            resource_version,
        })
    }

    async fn create(&self, kind: &str, doc: Value) -> Result<Value, Error> {
        let (api, resource) = self.api(kind)?;
        let object = to_wire(resource, &self.namespace, doc)?;
        let created = api
            .create(&PostParams::default(), &object)
            .await
            .map_err(from_kube)
            .err_tip(|| format!("Creating {kind}"))?;
        debug!(kind, name = ?created.metadata.name, "Created object");
        from_wire(kind, created)
    }

    async fn update(&self, kind: &str, doc: Value) -> Result<Value, Error> {
        let (api, resource) = self.api(kind)?;
        let name = name_of(&doc, kind)?.to_string();
        let object = to_wire(resource, &self.namespace, doc)?;
        let updated = api
            .replace(&name, &PostParams::default(), &object)
            .await
            .map_err(from_kube)
            .err_tip(|| format!("Updating {kind} {name}"))?;
        from_wire(kind, updated)
    }

    async fn update_status(&self, kind: &str, doc: Value) -> Result<Value, Error> {
        let (api, resource) = self.api(kind)?;
        let name = name_of(&doc, kind)?.to_string();
        let object = to_wire(resource, &self.namespace, doc)?;
        let body = serde_json::to_vec(&object)?;
        let updated = api
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(from_kube)
            .err_tip(|| format!("Updating status of {kind} {name}"))?;
        from_wire(kind, updated)
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<(), Error> {
        let (api, _) = self.api(kind)?;
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(from_kube)
            .err_tip(|| format!("Deleting {kind} {name}"))?;
        Ok(())
    }

    async fn delete_collection(
        &self,
        kind: &str,
        selector: &LabelSelector,
    ) -> Result<usize, Error> {
        let listed = self.list(kind, selector).await?;
        let mut deleted = 0;
        for doc in &listed.items {
            match self.delete(kind, name_of(doc, kind)?).await {
                Ok(()) => deleted += 1,
                Err(err) if err.code == Code::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(deleted)
    }

    fn watch(&self, kind: &str, fields: FieldSelector) -> Watcher {
        let (sender, receiver) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let plural = kind.to_string();
        let task = match self.api(kind) {
            Ok((api, _)) => {
                let mut config = watcher::Config::default();
                if let FieldSelector::Name(name) = &fields {
                    config = config.fields(&format!("metadata.name={name}"));
                }
                spawn!(
                    "kube_watch",
                    forward_events(api, config, plural, sender),
                    kind
                )
            }
            Err(err) => spawn!("kube_watch", async move {
                drop(sender.send(Err(err)).await);
            }),
        };
        Watcher::from_task(kind, fields, receiver, task)
    }
}
