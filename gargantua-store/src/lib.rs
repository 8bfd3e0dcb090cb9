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

//! Typed access to a versioned object store.
//!
//! `ObjectStore` is the untyped document interface. `KubeObjectStore`
//! implements it over a Kubernetes API server and `MemoryObjectStore` in
//! process. `Api<K>` adds typing and conflict-retried writes on top;
//! `Informer<K>` keeps a watched cache of one kind that controllers read
//! through a `Lister<K>`.

pub mod api;
pub mod informer;
pub mod kube_object_store;
pub mod memory_object_store;
pub mod object_store;

pub use api::{Api, Subresource, TypedWatcher};
pub use informer::{EventHandler, Informer, InformerEvent, InformerFactory, Lister};
pub use kube_object_store::KubeObjectStore;
pub use memory_object_store::MemoryObjectStore;
pub use object_store::{FieldSelector, ObjectList, ObjectStore, WatchEvent, Watcher};
