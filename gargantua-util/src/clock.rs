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
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use mock_instant::thread_local::MockClock as ThreadLocalMockClock;

/// Wall-clock source used by everything that compares against stored
/// timestamps (expirations, lease renewals, event windows).
pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub type ClockRef = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn default_clock() -> ClockRef {
    Arc::new(SystemClock)
}

/// Clock backed by `mock_instant`'s thread-local time, expressed as an
/// offset from the unix epoch. Every clone observes the same time, but only
/// on the thread that set it, so tests using it must run on a
/// current-thread runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockClock;

impl MockClock {
    /// Creates the clock and moves mocked time to `now`.
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self::set(now);
        Self
    }

    pub fn set(now: DateTime<Utc>) {
        let since_epoch = now
            .signed_duration_since(DateTime::<Utc>::UNIX_EPOCH)
            .to_std()
            .unwrap_or_default();
        ThreadLocalMockClock::set_time(since_epoch);
    }

    pub fn advance(duration: Duration) {
        ThreadLocalMockClock::advance(duration);
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        TimeDelta::from_std(ThreadLocalMockClock::time())
            .ok()
            .and_then(|delta| DateTime::<Utc>::UNIX_EPOCH.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Positive distance from `now` to `then`, or zero if `then` has passed.
pub fn until(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    then.signed_duration_since(now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
