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

//! Records consumed and produced by the external infrastructure executor.

use std::collections::BTreeMap;

use gargantua_error::{Error, ResultExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Desired infrastructure for one VM. The executor watches these and runs
/// the module, recording each run as a `TfExecution`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TfState {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TfStateSpec,
    #[serde(default)]
    pub status: TfStateStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TfStateSpec {
    pub image: String,
    pub module_name: String,
    pub variables: TfVariables,
    pub auto_confirm: bool,
    pub destroy_on_delete: bool,
    pub data: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TfVariables {
    pub config_names: Vec<String>,
    pub secret_names: Vec<String>,
    pub env_config_name: Vec<String>,
    pub env_secret_names: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TfStateStatus {
    pub last_run_hash: String,
    pub execution_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TfExecution {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TfExecutionSpec,
    #[serde(default)]
    pub status: TfExecutionStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TfExecutionSpec {
    pub auto_confirm: bool,
    pub action: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TfExecutionStatus {
    pub job_name: String,
    pub job_logs: String,
    /// JSON encoded `map<output, map<field, value>>`.
    pub outputs: String,
}

pub type TfOutputs = BTreeMap<String, BTreeMap<String, String>>;

impl TfExecution {
    /// Decodes `status.outputs`. Returns `None` while the run has not
    /// produced outputs yet.
    pub fn outputs(&self) -> Result<Option<TfOutputs>, Error> {
        if self.status.outputs.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&self.status.outputs)
            .map(Some)
            .err_tip(|| format!("decoding outputs of execution {}", self.metadata.name))
    }
}
