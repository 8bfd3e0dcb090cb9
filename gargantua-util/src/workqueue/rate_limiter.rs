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

use core::fmt::Debug;
use core::time::Duration;
use std::collections::HashMap;

use gargantua_config::queues::RateLimiterConfig;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::QueueKey;

/// Decides how long a failed key waits before it is handed out again.
pub trait RateLimiter<T>: Debug + Send + Sync {
    /// Delay for the next retry of `item`. Counts as one requeue.
    fn when(&self, item: &T) -> Duration;

    /// Stops tracking `item`, resetting its backoff.
    fn forget(&self, item: &T);

    fn num_requeues(&self, item: &T) -> u32;
}

/// `base * 2^failures`, capped at `max`, tracked per key.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<T> {
    failures: Mutex<HashMap<T, u32>>,
    base: Duration,
    max: Duration,
}

impl<T: QueueKey> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base,
            max,
        }
    }
}

impl<T: QueueKey> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };
        2_u32
            .checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all keys: `burst` requeues are free, after that
/// they are spaced at `qps`.
#[derive(Debug)]
pub struct BucketRateLimiter {
    bucket: Mutex<Bucket>,
    qps: f64,
    burst: f64,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
            qps,
            burst,
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = elapsed.mul_add(self.qps, bucket.tokens).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Uses the longest delay any of the inner limiters asks for.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> Debug for MaxOfRateLimiter<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters)
            .finish()
    }
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff combined with the shared token bucket.
pub fn default_controller_rate_limiter<T: QueueKey>(
    config: &RateLimiterConfig,
) -> MaxOfRateLimiter<T> {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_secs(config.max_delay_seconds),
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use gargantua_config::queues::RateLimiterConfig;
    use pretty_assertions::assert_eq;

    use super::{
        BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
        default_controller_rate_limiter,
    };

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        );
        let key = "vm-1".to_string();
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.when(&key), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues(&key), 3);
        for _ in 0..20 {
            limiter.when(&key);
        }
        assert_eq!(limiter.when(&key), Duration::from_secs(1));
        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn exponential_backoff_is_per_key() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        );
        limiter.when(&"a");
        limiter.when(&"a");
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_requests() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        assert_eq!(RateLimiter::<u8>::when(&limiter, &0), Duration::ZERO);
        assert_eq!(RateLimiter::<u8>::when(&limiter, &0), Duration::ZERO);
        let third = RateLimiter::<u8>::when(&limiter, &0);
        assert!(
            third > Duration::from_millis(90) && third <= Duration::from_millis(100),
            "unexpected delay {third:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_uses_per_key_curve_within_burst() {
        let limiter = default_controller_rate_limiter::<String>(&RateLimiterConfig::default());
        let key = "session-1".to_string();
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&key), 2);
        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn combined_limiter_nests_behind_the_trait() {
        let inner = default_controller_rate_limiter::<String>(&RateLimiterConfig::default());
        let limiter: Box<dyn RateLimiter<String>> =
            Box::new(MaxOfRateLimiter::new(vec![Box::new(inner)]));
        assert!(format!("{limiter:?}").starts_with("MaxOfRateLimiter"));
        assert_eq!(limiter.when(&"vm-1".to_string()), Duration::from_millis(5));
    }
}
