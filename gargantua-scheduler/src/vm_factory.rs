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

use gargantua_resources::labels::{
    BOUND, ENVIRONMENT, PROVISIONER, RESTRICTED_BIND, RESTRICTED_BIND_VALUE, SCHEDULED_EVENT,
    TEMPLATE, bool_value,
};
use gargantua_resources::vm::{VirtualMachineSpec, VirtualMachineStatus};
use gargantua_resources::{Environment, ObjectMeta, VirtualMachine, VirtualMachineTemplate};
use gargantua_util::names::generate_name;

const SSH_USERNAME_KEY: &str = "ssh_username";
const PROTOCOL_KEY: &str = "protocol";
const DEFAULT_PROTOCOL: &str = "ssh";

/// A fresh, unbound VM of `template` in `environment`, named
/// `<base_name>-<rand32>` and waiting to be provisioned. Callers add the
/// labels and references of whatever creates it.
pub fn new_vm(
    base_name: &str,
    template: &VirtualMachineTemplate,
    environment: &Environment,
    restriction: &(bool, String),
    scheduled_event: Option<&str>,
) -> VirtualMachine {
    let provisioner = environment
        .metadata
        .annotation(PROVISIONER)
        .filter(|provisioner| !provisioner.is_empty());

    let (restricted, restricted_value) = restriction;
    let mut metadata = ObjectMeta::named(generate_name(base_name))
        .with_label(ENVIRONMENT, environment.metadata.name.as_str())
        .with_label(TEMPLATE, template.metadata.name.as_str())
        .with_label(BOUND, bool_value(false))
        .with_label(RESTRICTED_BIND, bool_value(*restricted));
    if *restricted {
        metadata = metadata.with_label(RESTRICTED_BIND_VALUE, restricted_value.as_str());
    }
    if let Some(scheduled_event) = scheduled_event {
        metadata = metadata.with_label(SCHEDULED_EVENT, scheduled_event);
    }
    if let Some(provisioner) = provisioner {
        metadata = metadata.with_label(PROVISIONER, provisioner);
    }

    let config = &template.spec.config_map;
    VirtualMachine {
        metadata,
        spec: VirtualMachineSpec {
            vm_template_id: template.metadata.name.clone(),
            ssh_username: config.get(SSH_USERNAME_KEY).cloned().unwrap_or_default(),
            protocol: config
                .get(PROTOCOL_KEY)
                .cloned()
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            provision: provisioner.is_none(),
            ..VirtualMachineSpec::default()
        },
        status: VirtualMachineStatus {
            environment_id: environment.metadata.name.clone(),
            ws_endpoint: environment.spec.ws_endpoint.clone(),
            ..VirtualMachineStatus::default()
        },
    }
}
