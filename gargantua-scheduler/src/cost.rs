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
use gargantua_resources::{VirtualMachine, VirtualMachineTemplate};

/// Cost of one VM from creation until deletion (or `now`), charged per
/// started time unit. `None` when the template carries no price.
pub fn vm_cost(
    vm: &VirtualMachine,
    template: &VirtualMachineTemplate,
    now: DateTime<Utc>,
) -> Option<f64> {
    let price = template.spec.cost_base_price?;
    let unit = template.spec.cost_time_unit?.seconds();
    let created = vm.metadata.creation_timestamp?;
    let until = vm.metadata.deletion_timestamp.unwrap_or(now);
    let seconds = (until - created).num_seconds().max(0);
    let units = (seconds + unit - 1) / unit;
    Some(price * units as f64)
}

/// Total cost per template of `vms`. VMs whose template is unknown or
/// unpriced are left out.
pub fn cost_for_group<'a>(
    vms: impl IntoIterator<Item = &'a VirtualMachine>,
    templates: &BTreeMap<String, VirtualMachineTemplate>,
    now: DateTime<Utc>,
) -> BTreeMap<String, f64> {
    let mut costs = BTreeMap::new();
    for vm in vms {
        let Some(template) = templates.get(&vm.spec.vm_template_id) else {
            continue;
        };
        if let Some(cost) = vm_cost(vm, template, now) {
            *costs.entry(vm.spec.vm_template_id.clone()).or_insert(0.0) += cost;
        }
    }
    costs
}
