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

use core::future::Future;
use core::pin::Pin;
use core::time::Duration;
use std::sync::Arc;

use gargantua_config::queues::Retry;
use gargantua_error::Error;
use rand::Rng;
use tracing::debug;

struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    const fn new(base: Duration) -> Self {
        Self { current: base }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.current = self.current.saturating_mul(2);
        Some(self.current)
    }
}

pub type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Sync + Send>;
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

#[derive(PartialEq, Eq, Debug)]
pub enum RetryResult<T> {
    Ok(T),
    Retry(Error),
    Err(Error),
}

/// Runs an operation until it succeeds, fails permanently or runs out of
/// attempts, sleeping with exponential backoff in between.
#[derive(Clone)]
pub struct Retrier {
    sleep_fn: SleepFn,
    jitter_fn: JitterFn,
    config: Retry,
}

impl core::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Retrier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Retrier {
    pub fn new(sleep_fn: SleepFn, jitter_fn: JitterFn, config: Retry) -> Self {
        Self {
            sleep_fn,
            jitter_fn,
            config,
        }
    }

    /// Retrier that sleeps on the tokio timer and applies the configured
    /// jitter.
    pub fn from_config(config: Retry) -> Self {
        let jitter = config.jitter;
        Self::new(
            Arc::new(|duration: Duration| -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(tokio::time::sleep(duration))
            }),
            Self::jitter_fn(jitter),
            config,
        )
    }

    /// Spreads `delay` uniformly over `delay * (1 ± jitter / 2)`.
    pub fn jitter_fn(jitter: f32) -> JitterFn {
        Arc::new(move |delay: Duration| {
            if jitter <= 0.0 {
                return delay;
            }
            let min = 1.0 - (jitter / 2.0);
            let max = 1.0 + (jitter / 2.0);
            delay.mul_f32(rand::rng().random_range(min..max))
        })
    }

    /// The jittered delays between attempts. Yields `max_retries` items.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + '_ {
        ExponentialBackoff::new(Duration::from_micros((self.config.delay.max(0.0) * 1000.0) as u64))
            .map(|d| (self.jitter_fn)(d))
            // Number of retries, so it runs max_retries + 1 times.
            .take(self.config.max_retries)
    }

    pub async fn sleep(&self, delay: Duration) {
        (self.sleep_fn)(delay).await;
    }

    pub async fn retry<T, F, Fut>(&self, mut operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = RetryResult<T>> + Send,
        T: Send,
    {
        let mut iter = self.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                RetryResult::Ok(value) => return Ok(value),
                RetryResult::Err(e) => return Err(e),
                RetryResult::Retry(e) => {
                    let Some(delay) = iter.next() else {
                        return Err(e.append(format!("Giving up after attempt {attempt}")));
                    };
                    debug!(attempt, ?delay, ?e, "retrying operation");
                    (self.sleep_fn)(delay).await;
                }
            }
        }
    }
}
