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
use std::sync::Arc;

use gargantua_config::queues::RateLimiterConfig;
use gargantua_error::Error;
use gargantua_macro::gargantua_test;
use gargantua_util::workqueue::{
    DelayingQueue, Queue, RateLimitingQueue, default_controller_rate_limiter,
};
use pretty_assertions::assert_eq;
use tokio::time::Instant;

#[gargantua_test(start_paused = true)]
async fn delayed_keys_come_out_in_deadline_order() -> Result<(), Error> {
    let queue = DelayingQueue::new("test");
    let start = Instant::now();
    queue.add_after("late".to_string(), Duration::from_secs(2));
    queue.add_after("soon".to_string(), Duration::from_millis(100));
    queue.add("now".to_string());
    assert_eq!(queue.waiting_len(), 2);

    assert_eq!(queue.get().await.as_deref(), Some("now"));
    assert_eq!(queue.get().await.as_deref(), Some("soon"));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(queue.get().await.as_deref(), Some("late"));
    assert!(start.elapsed() >= Duration::from_secs(2));
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn earlier_deadline_wins_for_same_key() -> Result<(), Error> {
    let queue = DelayingQueue::new("test");
    let start = Instant::now();
    queue.add_after("session-1".to_string(), Duration::from_secs(300));
    queue.add_after("session-1".to_string(), Duration::from_secs(1));
    queue.add_after("session-1".to_string(), Duration::from_secs(60));
    assert_eq!(queue.waiting_len(), 1);

    assert_eq!(queue.get().await.as_deref(), Some("session-1"));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(60));
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn rate_limited_requeue_backs_off_and_forget_resets() -> Result<(), Error> {
    let queue = RateLimitingQueue::new(
        "test",
        Box::new(default_controller_rate_limiter(&RateLimiterConfig::default())),
    );
    let key = "vm-1".to_string();
    for _ in 0..3 {
        queue.add_rate_limited(key.clone());
        let got = queue.get().await.unwrap();
        queue.done(&got);
    }
    assert_eq!(queue.num_requeues(&key), 3);
    queue.forget(&key);
    assert_eq!(queue.num_requeues(&key), 0);
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn shut_down_with_drain_waits_for_workers() -> Result<(), Error> {
    let queue = Arc::new(Queue::new());
    queue.add(7_u32);
    let held = queue.get().await.unwrap();

    let worker_queue = queue.clone();
    let worker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        worker_queue.done(&held);
    });
    let start = Instant::now();
    queue.shut_down_with_drain().await;
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(queue.get().await, None);
    worker.await.unwrap();
    Ok(())
}
