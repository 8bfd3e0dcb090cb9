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

use serde::{Deserialize, Serialize};

use crate::serde_utils::{convert_float_with_shellexpand, convert_numeric_with_shellexpand};

/// Retry configuration for optimistic-concurrency loops. The delay grows
/// exponentially with each attempt; jitter spreads concurrent writers.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    /// Maximum number of retries until retrying stops.
    /// Setting this to zero will always attempt 1 time, but not retry.
    ///
    /// Default: 4 (five attempts in total)
    #[serde(
        default = "default_max_retries",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub max_retries: usize,

    /// Base delay in milliseconds for exponential back off.
    ///
    /// Default: 10
    #[serde(default = "default_delay", deserialize_with = "convert_float_with_shellexpand")]
    pub delay: f32,

    /// Amount of jitter to add as a percentage in decimal form. This will
    /// change the formula like:
    /// ```haskell
    /// random(
    ///    (2 ^ {attempt_number}) * {delay} * (1 - (jitter / 2)),
    ///    (2 ^ {attempt_number}) * {delay} * (1 + (jitter / 2)),
    /// )
    /// ```
    ///
    /// Default: 1.0
    #[serde(default = "default_jitter", deserialize_with = "convert_float_with_shellexpand")]
    pub jitter: f32,
}

const fn default_max_retries() -> usize {
    4
}

const fn default_delay() -> f32 {
    10.0
}

const fn default_jitter() -> f32 {
    1.0
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay: default_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Backoff for keys whose reconcile failed. The effective delay is the
/// larger of the per-key exponential curve and the shared token bucket.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterConfig {
    /// Delay of the first retry of a key, doubled on every failure.
    ///
    /// Default: 5
    #[serde(
        default = "default_base_delay_ms",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub base_delay_ms: u64,

    /// Ceiling of the per-key curve.
    ///
    /// Default: 1000
    #[serde(
        default = "default_max_delay_seconds",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub max_delay_seconds: u64,

    /// Sustained requeues per second across all keys.
    ///
    /// Default: 10
    #[serde(default = "default_qps", deserialize_with = "convert_float_with_shellexpand")]
    pub qps: f64,

    /// Requeues allowed in a burst before the bucket starts delaying.
    ///
    /// Default: 100
    #[serde(
        default = "default_burst",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub burst: u32,
}

const fn default_base_delay_ms() -> u64 {
    5
}

const fn default_max_delay_seconds() -> u64 {
    1000
}

const fn default_qps() -> f64 {
    10.0
}

const fn default_burst() -> u32 {
    100
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_seconds: default_max_delay_seconds(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}
