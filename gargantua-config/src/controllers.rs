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

use crate::serde_utils::convert_numeric_with_shellexpand;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers. Reconciles of the same key
    /// are always serialized regardless of this value.
    ///
    /// Default: 1
    #[serde(
        default = "default_workers",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub workers: usize,

    /// Spread keys across all replicas of the StatefulSet instead of running
    /// on the lease holder only.
    ///
    /// Default: false
    #[serde(default)]
    pub sharded: bool,
}

const fn default_workers() -> usize {
    1
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            sharded: false,
        }
    }
}

/// Timer defaults used when neither the course nor the scenario sets one.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionTimersConfig {
    /// Default: 300 (5 minutes)
    #[serde(
        default = "default_keepalive_seconds",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub default_keepalive_seconds: u64,

    /// Default: 7200 (2 hours)
    #[serde(
        default = "default_pause_seconds",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub default_pause_seconds: u64,
}

const fn default_keepalive_seconds() -> u64 {
    5 * 60
}

const fn default_pause_seconds() -> u64 {
    2 * 60 * 60
}

impl Default for SessionTimersConfig {
    fn default() -> Self {
        Self {
            default_keepalive_seconds: default_keepalive_seconds(),
            default_pause_seconds: default_pause_seconds(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct ControllersConfig {
    #[serde(default)]
    pub vm: ControllerConfig,

    #[serde(default)]
    pub vm_set: ControllerConfig,

    #[serde(default)]
    pub vm_claim: ControllerConfig,

    #[serde(default)]
    pub session: ControllerConfig,

    #[serde(default)]
    pub scheduled_event: ControllerConfig,

    #[serde(default)]
    pub session_timers: SessionTimersConfig,
}

impl ControllersConfig {
    /// True when at least one controller spreads its keys over replicas.
    pub const fn any_sharded(&self) -> bool {
        self.vm.sharded
            || self.vm_set.sharded
            || self.vm_claim.sharded
            || self.session.sharded
            || self.scheduled_event.sharded
    }
}
