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

//! Controller runtime: informer-fed work queues with reconcile workers,
//! key sharding across StatefulSet replicas, and lease-based leader
//! election.

pub mod controller;
pub mod leader_election;
pub mod sharding;

pub use controller::{
    BaseController, ControllerHandle, EnqueueFilter, Reconciler, object_key, split_key,
};
pub use leader_election::LeaderElector;
pub use sharding::{ShardFilter, fnv32a, parse_ordinal, shard_filter, watch_replicas};
