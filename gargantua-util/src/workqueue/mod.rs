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

//! Work queues feeding reconcile workers.
//!
//! The three variants build on each other: `Queue` provides
//! `add/get/done/shut_down`, `DelayingQueue` adds `add_after`, and
//! `RateLimitingQueue` adds `add_rate_limited/forget/num_requeues`.

use core::fmt::Debug;
use core::hash::Hash;

pub mod delaying_queue;
pub mod queue;
pub mod rate_limiter;
pub mod rate_limiting_queue;

pub use delaying_queue::DelayingQueue;
pub use queue::Queue;
pub use rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};
pub use rate_limiting_queue::RateLimitingQueue;

pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
