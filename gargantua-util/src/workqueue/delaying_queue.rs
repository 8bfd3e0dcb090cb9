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
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::QueueKey;
use super::queue::Queue;
use crate::spawn;
use crate::task::JoinHandleDropGuard;

#[derive(Debug)]
struct Waiting<T> {
    /// Ready time plus a sequence number to keep equal deadlines distinct.
    by_deadline: BTreeMap<(Instant, u64), T>,
    deadline_of: HashMap<T, (Instant, u64)>,
    next_seq: u64,
}

impl<T: QueueKey> Waiting<T> {
    /// Records `item` for `ready_at` unless it is already waiting for an
    /// earlier time. Returns true if the earliest deadline changed.
    fn insert(&mut self, item: T, ready_at: Instant) -> bool {
        if let Some(existing) = self.deadline_of.get(&item) {
            if existing.0 <= ready_at {
                return false;
            }
            let existing = *existing;
            self.by_deadline.remove(&existing);
        }
        let key = (ready_at, self.next_seq);
        self.next_seq += 1;
        let is_first = self
            .by_deadline
            .first_key_value()
            .is_none_or(|(first, _)| key < *first);
        self.by_deadline.insert(key, item.clone());
        self.deadline_of.insert(item, key);
        is_first
    }

    fn pop_ready(&mut self, now: Instant) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(entry) = self.by_deadline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let item = entry.remove();
            self.deadline_of.remove(&item);
            ready.push(item);
        }
        ready
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.first_key_value().map(|((at, _), _)| *at)
    }
}

/// Work queue that can hold keys back until a deadline. A single timer task
/// per queue moves keys into the underlying `Queue` when they become ready.
#[derive(Debug)]
pub struct DelayingQueue<T: QueueKey> {
    queue: Arc<Queue<T>>,
    waiting: Arc<Mutex<Waiting<T>>>,
    wake_timer: Arc<Notify>,
    _timer: JoinHandleDropGuard<()>,
}

impl<T: QueueKey> DelayingQueue<T> {
    /// Must be called from within a tokio runtime.
    pub fn new(name: &'static str) -> Self {
        let queue = Arc::new(Queue::new());
        let waiting = Arc::new(Mutex::new(Waiting {
            by_deadline: BTreeMap::new(),
            deadline_of: HashMap::new(),
            next_seq: 0,
        }));
        let wake_timer = Arc::new(Notify::new());
        let timer = spawn!(
            "delaying_queue_timer",
            Self::run_timer(queue.clone(), waiting.clone(), wake_timer.clone()),
            queue = name
        );
        Self {
            queue,
            waiting,
            wake_timer,
            _timer: timer,
        }
    }

    async fn run_timer(queue: Arc<Queue<T>>, waiting: Arc<Mutex<Waiting<T>>>, wake: Arc<Notify>) {
        loop {
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if queue.shutting_down() {
                return;
            }
            let next = {
                let mut waiting = waiting.lock();
                for item in waiting.pop_ready(Instant::now()) {
                    queue.add(item);
                }
                waiting.next_deadline()
            };
            match next {
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {}
                        () = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    /// Adds `item` once `delay` has elapsed. A zero delay adds immediately.
    /// If the key is already waiting, the earlier deadline wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.queue.shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(item);
            return;
        }
        let ready_at = Instant::now() + delay;
        if self.waiting.lock().insert(item, ready_at) {
            self.wake_timer.notify_one();
        }
    }

    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
        self.wake_timer.notify_one();
    }

    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
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

    /// Number of keys waiting for their deadline.
    pub fn waiting_len(&self) -> usize {
        self.waiting.lock().by_deadline.len()
    }
}
