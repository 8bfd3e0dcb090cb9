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

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Session {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SessionSpec,
    #[serde(default)]
    pub status: SessionStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSpec {
    pub scenario: String,
    pub course: String,
    pub keep_course_vm: bool,
    pub user: String,
    pub vm_claim: Vec<String>,
    pub access_code: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct SessionStatus {
    pub active: bool,
    pub finished: bool,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
}

/// Per-user learning progress through one scenario of a session.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Progress {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ProgressSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct ProgressSpec {
    pub current_step: u32,
    pub max_step: u32,
    pub total_step: u32,
    pub course: String,
    pub scenario: String,
    pub user: String,
    pub session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    pub finished: bool,
    pub steps: Vec<ProgressStep>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct ProgressStep {
    pub step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Grants a cohort permission to start sessions. The object name is the
/// code itself; the `scheduledevent` label points at the owning event.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AccessCode {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: AccessCodeSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct AccessCodeSpec {
    pub code: String,
    pub description: String,
    pub scenarios: Vec<String>,
    pub courses: Vec<String>,
    /// Unix date; empty means the code never expires.
    pub expiration: String,
    pub restricted_bind: bool,
    pub restricted_bind_value: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ScheduledEvent {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ScheduledEventSpec,
    #[serde(default)]
    pub status: ScheduledEventStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduledEventSpec {
    pub creator: String,
    pub name: String,
    pub description: String,
    /// Unix date.
    pub start_time: String,
    /// Unix date.
    pub end_time: String,
    pub on_demand: bool,
    pub restricted_bind: bool,
    pub restricted_bind_value: String,
    pub access_code: String,
    pub scenarios: Vec<String>,
    pub courses: Vec<String>,
    /// Environment -> template -> count.
    pub required_vms: BTreeMap<String, BTreeMap<String, u32>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduledEventStatus {
    pub active: bool,
    pub provisioned: bool,
    pub ready: bool,
    pub finished: bool,
    pub vm_sets: Vec<String>,
}

impl ScheduledEvent {
    pub fn allows_environment(&self, environment: &str) -> bool {
        self.spec.required_vms.contains_key(environment)
    }

    /// `(restricted, value)` stamped on everything provisioned for this
    /// event. A restricted event without an explicit value binds to its own
    /// name.
    pub fn bind_restriction(&self) -> (bool, String) {
        if !self.spec.restricted_bind {
            return (false, String::new());
        }
        let value = if self.spec.restricted_bind_value.is_empty() {
            self.metadata.name.clone()
        } else {
            self.spec.restricted_bind_value.clone()
        };
        (true, value)
    }

    pub fn grants(&self, scenario: &str, course: &str) -> bool {
        (!scenario.is_empty() && self.spec.scenarios.iter().any(|s| s == scenario))
            || (!course.is_empty() && self.spec.courses.iter().any(|c| c == course))
    }
}

/// How far a scheduled event may burst into one environment.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct DynamicBindConfig {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DynamicBindConfigSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct DynamicBindConfigSpec {
    pub environment: String,
    pub restricted_bind: bool,
    pub restricted_bind_value: String,
    pub burst_count_capacity: BTreeMap<String, u32>,
}

impl DynamicBindConfig {
    pub fn burst_capacity_for(&self, template: &str) -> u32 {
        self.spec
            .burst_count_capacity
            .get(template)
            .copied()
            .unwrap_or(0)
    }
}
