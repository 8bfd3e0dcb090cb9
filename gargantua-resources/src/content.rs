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

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Scenario {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ScenarioSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct ScenarioSpec {
    pub name: String,
    pub description: String,
    pub steps: Vec<ScenarioStep>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    /// One entry per VM claim; each maps a local VM name to a template.
    pub virtualmachines: Vec<BTreeMap<String, String>>,
    pub keepalive_duration: String,
    pub pause_duration: String,
    pub pausable: bool,
    pub vm_tasks: Vec<VirtualMachineTasks>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct ScenarioStep {
    pub title: String,
    pub content: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualMachineTasks {
    pub vm_name: String,
    pub tasks: Vec<Task>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct Task {
    pub name: String,
    pub description: String,
    pub command: String,
    pub expected_output_value: String,
    pub expected_return_code: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Course {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CourseSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct CourseSpec {
    pub name: String,
    pub description: String,
    pub scenarios: Vec<String>,
    pub categories: Vec<String>,
    pub virtualmachines: Vec<BTreeMap<String, String>>,
    pub keepalive_duration: String,
    pub pause_duration: String,
    pub pausable: bool,
    pub keep_vm: bool,
}

/// Storage version of a user. See `conversion` for the older shape.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct User {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: UserSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct UserSpec {
    pub email: String,
    pub password: String,
    pub access_codes: Vec<String>,
    pub settings: BTreeMap<String, String>,
}
