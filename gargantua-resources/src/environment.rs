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

/// An infrastructure target with a fixed per-template capacity.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Environment {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: EnvironmentSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentSpec {
    pub display_name: String,
    pub provider: String,
    pub dnssuffix: String,
    /// Per-template config overlay. A template missing here cannot be
    /// provisioned in this environment.
    pub template_mapping: BTreeMap<String, BTreeMap<String, String>>,
    pub environment_specifics: BTreeMap<String, String>,
    /// First three octets of a private address mapped to a public prefix.
    pub ip_translation_map: BTreeMap<String, String>,
    pub ws_endpoint: String,
    pub count_capacity: BTreeMap<String, u32>,
}

impl Environment {
    pub fn supports_template(&self, template: &str) -> bool {
        self.spec.template_mapping.contains_key(template)
    }

    pub fn capacity_for(&self, template: &str) -> u32 {
        self.spec.count_capacity.get(template).copied().unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CostTimeUnit {
    Seconds,
    Minutes,
    Hours,
}

impl CostTimeUnit {
    pub const fn seconds(self) -> i64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 60 * 60,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VirtualMachineTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct VirtualMachineTemplateSpec {
    pub name: String,
    pub image: String,
    /// May contain `secret:<name>:<field>` and `configmap:<name>:<field>`
    /// handles, resolved by the executor.
    pub config_map: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_base_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_time_unit: Option<CostTimeUnit>,
}
