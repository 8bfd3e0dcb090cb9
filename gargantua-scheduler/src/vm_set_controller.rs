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

use core::time::Duration;

use async_trait::async_trait;
use gargantua_controller::{ControllerHandle, Reconciler};
use gargantua_error::{Code, Error, ResultExt};
use gargantua_resources::labels::{SCHEDULED_EVENT, VM_SET, VM_SET_FINALIZER};
use gargantua_resources::vm::VirtualMachineProvision;
use gargantua_resources::{
    Environment, TfState, VirtualMachine, VirtualMachineSet, VirtualMachineTemplate, VmStatus,
};
use gargantua_store::{Api, Lister};
use gargantua_util::labels::LabelSelector;
use tracing::{debug, info, warn};

use crate::context::SchedulerContext;
use crate::vm_factory::new_vm;

/// Delay before a set that is still short of VMs is looked at again.
pub const SHORTFALL_REQUEUE: Duration = Duration::from_secs(5);

/// Keeps `spec.count` live VMs in each set.
#[derive(Debug)]
pub struct VmSetReconciler {
    ctx: SchedulerContext,
    vm_sets: Api<VirtualMachineSet>,
    vm_set_lister: Lister<VirtualMachineSet>,
    vms: Api<VirtualMachine>,
    handle: ControllerHandle,
}

impl VmSetReconciler {
    pub fn new(ctx: SchedulerContext, handle: ControllerHandle) -> Self {
        Self {
            vm_sets: ctx.api(),
            vm_set_lister: ctx.lister(),
            vms: ctx.api(),
            ctx,
            handle,
        }
    }

    /// The set is gone; its VMs follow.
    async fn delete_members(&self, name: &str) -> Result<(), Error> {
        let deleted = self
            .vms
            .delete_collection(&LabelSelector::everything().eq(VM_SET, name))
            .await
            .err_tip(|| format!("Deleting vms of removed vm set {name}"))?;
        if deleted > 0 {
            info!(vm_set = name, deleted, "Deleted vms of removed vm set");
        }
        Ok(())
    }

    async fn scale_up(&self, vm_set: &VirtualMachineSet, missing: usize) -> Result<(), Error> {
        let name = vm_set.metadata.name.as_str();
        let environment = self
            .ctx
            .lister::<Environment>()
            .get(&vm_set.spec.environment)
            .err_tip(|| format!("Loading environment of vm set {name}"))?;
        let template = self
            .ctx
            .lister::<VirtualMachineTemplate>()
            .get(&vm_set.spec.vm_template)
            .err_tip(|| format!("Loading template of vm set {name}"))?;
        let restriction = (
            vm_set.spec.restricted_bind,
            vm_set.spec.restricted_bind_value.clone(),
        );
        for _ in 0..missing {
            let mut vm = new_vm(
                &vm_set.spec.base_name,
                &template,
                &environment,
                &restriction,
                vm_set.metadata.label(SCHEDULED_EVENT),
            );
            vm.metadata = vm.metadata.with_label(VM_SET, name).owned_by(vm_set);
            vm.metadata.add_finalizer(VM_SET_FINALIZER);
            vm.spec.vm_set_id = name.to_string();
            let vm = self
                .vms
                .create(&vm)
                .await
                .err_tip(|| format!("Creating vm for vm set {name}"))?;
            debug!(vm_set = name, vm = %vm.metadata.name, "Created vm");
        }
        Ok(())
    }

    /// Deletes up to `need` unallocated VMs and returns how many could not
    /// be deleted.
    async fn scale_down(&self, live: &[&VirtualMachine], mut need: usize) -> Result<usize, Error> {
        for vm in live {
            if need == 0 {
                break;
            }
            if vm.status.allocated {
                continue;
            }
            self.vms.delete_ignore_missing(&vm.metadata.name).await?;
            need -= 1;
        }
        Ok(need)
    }

    fn machine(&self, vm: &VirtualMachine) -> VirtualMachineProvision {
        let tfc_cm = if vm.status.tfstate.is_empty() {
            String::new()
        } else {
            self.ctx
                .lister::<TfState>()
                .get(&vm.status.tfstate)
                .ok()
                .and_then(|state| state.spec.variables.config_names.first().cloned())
                .unwrap_or_default()
        };
        VirtualMachineProvision {
            vm_name: vm.metadata.name.clone(),
            tfc_state: vm.status.tfstate.clone(),
            tfc_cm,
        }
    }
}

#[async_trait]
impl Reconciler for VmSetReconciler {
    async fn reconcile(&self, name: &str) -> Result<(), Error> {
        let vm_set = match self.vm_set_lister.get(name) {
            Ok(vm_set) => vm_set,
            Err(err) if err.code == Code::NotFound => return self.delete_members(name).await,
            Err(err) => return Err(err),
        };
        let selector = LabelSelector::everything().eq(VM_SET, name);
        let count = usize::try_from(vm_set.spec.count)?;

        // Listed from the store rather than the cache so VMs created by the
        // previous pass are always counted.
        let vms = self.vms.list(&selector).await?;
        let deleting = vms.iter().filter(|vm| vm.metadata.is_deleting()).count();
        let live: Vec<&VirtualMachine> =
            vms.iter().filter(|vm| !vm.metadata.is_deleting()).collect();

        if live.len() < count {
            self.scale_up(&vm_set, count - live.len()).await?;
        } else {
            let need = vms.len().saturating_sub(count).saturating_sub(deleting);
            let residual = self.scale_down(&live, need).await?;
            if residual > 0 {
                warn!(
                    vm_set = name,
                    residual, "Vm set is above its count but the rest are allocated"
                );
            }
        }

        let vms = self.vms.list(&selector).await?;
        let usable: Vec<&VirtualMachine> = vms
            .iter()
            .filter(|vm| !vm.metadata.is_deleting() && !vm.status.tainted)
            .collect();
        let available = u32::try_from(usable.len())?;
        let provisioned = u32::try_from(
            usable
                .iter()
                .filter(|vm| vm.status.status == VmStatus::Running)
                .count(),
        )?;
        let machines: Vec<VirtualMachineProvision> =
            usable.iter().map(|vm| self.machine(vm)).collect();

        let result = self
            .vm_sets
            .update_status_with_retry(self.ctx.retrier(), name, |vm_set| {
                vm_set.status.available = available;
                vm_set.status.provisioned = provisioned;
                vm_set.status.machines.clone_from(&machines);
                Ok(())
            })
            .await;
        match result {
            Err(err) if err.code == Code::NotFound => return Ok(()),
            result => {
                result.err_tip(|| format!("Updating status of vm set {name}"))?;
            }
        }

        if available < vm_set.spec.count {
            self.handle.enqueue_after(name, SHORTFALL_REQUEUE);
        }
        Ok(())
    }
}
