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

use core::time::Duration;

use super::QueueKey;
use super::delaying_queue::DelayingQueue;
use super::rate_limiter::RateLimiter;

/// Delaying queue whose retries are paced by a `RateLimiter`.
#[derive(Debug)]
pub struct RateLimitingQueue<T: QueueKey> {
    queue: DelayingQueue<T>,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T: QueueKey> RateLimitingQueue<T> {
    /// Must be called from within a tokio runtime.
    pub fn new(name: &'static str, limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            queue: DelayingQueue::new(name),
            limiter,
        }
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        self.queue.add_after(item, delay);
    }

    /// Adds `item` after the delay the limiter assigns to it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        self.queue.add_after(item, delay);
    }

    /// Resets the backoff of `item`. Does not remove it from the queue.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub async fn shut_down_with_drain(&self) {
        self.queue.shut_down_with_drain().await;
    }

    pub fn shutting_down(&self) -> bool {
        self.queue.shutting_down()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn waiting_len(&self) -> usize {
        self.queue.waiting_len()
    }
}
