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

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::QueueKey;

#[derive(Debug)]
struct QueueState<T> {
    /// Keys waiting for a worker, in FIFO order.
    queue: VecDeque<T>,
    /// Keys that need processing. A key can be dirty and processing at the
    /// same time, in which case it is re-queued by `done()`.
    dirty: HashSet<T>,
    /// Keys currently held by a worker.
    processing: HashSet<T>,
    shutting_down: bool,
}

/// FIFO work queue that never hands the same key to two workers at once.
///
/// A key added while it is queued is dropped; a key added while a worker
/// holds it is queued again once the worker calls `done()`.
#[derive(Debug)]
pub struct Queue<T: QueueKey> {
    state: Mutex<QueueState<T>>,
    item_available: Notify,
    drained: Notify,
}

impl<T: QueueKey> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueKey> Queue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            item_available: Notify::new(),
            drained: Notify::new(),
        }
    }

    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.item_available.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down
    /// and every queued key has been handed out.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.item_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Another worker may be parked on a permit this call consumed.
                        self.item_available.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as no longer being processed.
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.item_available.notify_one();
            return;
        }
        if state.processing.is_empty() {
            drop(state);
            self.drained.notify_waiters();
        }
    }

    /// Stops accepting new keys. Keys already queued are still handed out.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.item_available.notify_waiters();
    }

    /// Same as `shut_down`, then waits for every key held by a worker to be
    /// marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.state.lock().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Queue;

    #[tokio::test]
    async fn duplicate_adds_are_collapsed() {
        let queue = Queue::new();
        queue.add("a".to_string());
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn key_added_while_processing_is_requeued_on_done() {
        let queue = Queue::new();
        queue.add("a".to_string());
        let item = queue.get().await.unwrap();
        queue.add("a".to_string());
        assert_eq!(queue.len(), 0, "held key must not be handed out twice");
        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn shut_down_drains_then_returns_none() {
        let queue = Queue::new();
        queue.add(1_u32);
        queue.shut_down();
        queue.add(2_u32);
        assert!(queue.shutting_down());
        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, None);
    }
}
