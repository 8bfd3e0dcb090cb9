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

use core::fmt;
use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// Lifecycle of a single VM. Only forward transitions are legal:
/// `RequestedForProvisioning -> Provisioned -> Running -> Tainted`, plus a
/// direct jump to `Tainted` from any state.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum VmStatus {
    #[default]
    RequestedForProvisioning,
    Provisioned,
    Running,
    Tainted,
}

impl VmStatus {
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::RequestedForProvisioning, Self::Provisioned)
                | (Self::Provisioned, Self::Running)
                | (_, Self::Tainted)
        )
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RequestedForProvisioning => "RequestedForProvisioning",
            Self::Provisioned => "Provisioned",
            Self::Running => "Running",
            Self::Tainted => "Tainted",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VirtualMachine {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualMachineSpec {
    pub vm_template_id: String,
    pub ssh_username: String,
    pub protocol: String,
    pub secret_name: String,
    pub vm_claim_id: String,
    pub user: String,
    /// False when an external provisioner owns the infrastructure.
    pub provision: bool,
    pub vm_set_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualMachineStatus {
    pub status: VmStatus,
    pub allocated: bool,
    pub tainted: bool,
    pub public_ip: String,
    pub private_ip: String,
    pub hostname: String,
    pub environment_id: String,
    pub tfstate: String,
    pub ws_endpoint: String,
}

impl VirtualMachine {
    /// Free for static binding.
    pub const fn is_allocatable(&self) -> bool {
        !self.status.allocated && !self.status.tainted && !self.metadata.is_deleting()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VirtualMachineSet {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineSetSpec,
    #[serde(default)]
    pub status: VirtualMachineSetStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualMachineSetSpec {
    pub count: u32,
    pub environment: String,
    pub vm_template: String,
    pub base_name: String,
    pub restricted_bind: bool,
    pub restricted_bind_value: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualMachineSetStatus {
    pub available: u32,
    pub provisioned: u32,
    pub machines: Vec<VirtualMachineProvision>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualMachineProvision {
    pub vm_name: String,
    pub tfc_state: String,
    pub tfc_cm: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Static,
    Dynamic,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VirtualMachineClaim {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineClaimSpec,
    #[serde(default)]
    pub status: VirtualMachineClaimStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualMachineClaimSpec {
    pub user_id: String,
    pub restricted_bind: bool,
    pub restricted_bind_value: String,
    pub base_name: String,
    pub dynamic_capable: bool,
    /// Local name -> requested template and, once bound, the VM.
    pub vms: BTreeMap<String, VirtualMachineClaimVm>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualMachineClaimVm {
    pub template: String,
    pub vm_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualMachineClaimStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_mode: Option<BindMode>,
    pub static_bind_attempts: u32,
    pub bound: bool,
    pub ready: bool,
    pub tainted: bool,
}
