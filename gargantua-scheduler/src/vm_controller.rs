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
use std::sync::Arc;

use async_trait::async_trait;
use gargantua_controller::{ControllerHandle, Reconciler};
use gargantua_error::{Code, Error, ResultExt};
use gargantua_resources::labels::{
    PROVISIONER, TF_STATE, VM_CONTROLLER_FINALIZER, VM_SET_FINALIZER,
};
use gargantua_resources::{
    ConfigMap, Environment, Secret, TfExecution, TfState, VirtualMachine,
    VirtualMachineTemplate, VmStatus,
};
use gargantua_store::{Api, Lister};
use gargantua_util::labels::LabelSelector;
use tracing::{debug, info, warn};

use crate::context::SchedulerContext;
use crate::keypair::KeyPairGenerator;
use crate::terraform::{
    addresses_from, create_records, delete_records, environment_of, latest_execution,
    resolve_config, resolve_handles,
};

/// How long deletion of a finalized VM is watched before giving up.
pub const DELETION_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives a VM through `RequestedForProvisioning -> Provisioned -> Running`
/// and tears its infrastructure down once it is tainted or deleted.
#[derive(Debug)]
pub struct VmReconciler {
    ctx: SchedulerContext,
    key_pairs: Arc<dyn KeyPairGenerator>,
    vms: Api<VirtualMachine>,
    vm_lister: Lister<VirtualMachine>,
    vm_claims: ControllerHandle,
    vm_sets: ControllerHandle,
}

impl VmReconciler {
    pub fn new(
        ctx: SchedulerContext,
        key_pairs: Arc<dyn KeyPairGenerator>,
        vm_claims: ControllerHandle,
        vm_sets: ControllerHandle,
    ) -> Self {
        Self {
            vms: ctx.api(),
            vm_lister: ctx.lister(),
            ctx,
            key_pairs,
            vm_claims,
            vm_sets,
        }
    }

    async fn finalize(&self, vm: &VirtualMachine) -> Result<(), Error> {
        let name = vm.metadata.name.as_str();
        if vm.metadata.has_finalizer(VM_SET_FINALIZER) {
            if !vm.spec.vm_set_id.is_empty() {
                self.vm_sets.enqueue(&vm.spec.vm_set_id);
            }
            self.vms
                .update_with_retry(self.ctx.retrier(), name, |vm| {
                    vm.metadata.remove_finalizer(VM_SET_FINALIZER);
                    Ok(())
                })
                .await
                .err_tip(|| format!("Removing vm set finalizer from {name}"))?;
            return Ok(());
        }
        if !vm.metadata.has_finalizer(VM_CONTROLLER_FINALIZER) {
            return Ok(());
        }

        delete_records(
            vm,
            &self.ctx.api::<ConfigMap>(),
            &self.ctx.api::<Secret>(),
            &self.ctx.api::<TfState>(),
        )
        .await
        .err_tip(|| format!("Deleting provisioning records of vm {name}"))?;
        let result = self
            .vms
            .update_with_retry(self.ctx.retrier(), name, |vm| {
                vm.metadata.finalizers.clear();
                Ok(())
            })
            .await;
        match result {
            Err(err) if err.code == Code::NotFound => {}
            result => {
                result.err_tip(|| format!("Clearing finalizers of vm {name}"))?;
            }
        }
        if let Err(err) = self
            .vms
            .wait_for_deletion(name, DELETION_VERIFY_TIMEOUT)
            .await
        {
            warn!(vm = name, ?err, "Vm deletion was not confirmed");
        } else {
            info!(vm = name, "Vm deleted");
        }
        if !vm.spec.vm_claim_id.is_empty() {
            self.vm_claims.enqueue(&vm.spec.vm_claim_id);
        }
        Ok(())
    }

    async fn taint(&self, vm: &VirtualMachine) -> Result<(), Error> {
        let name = vm.metadata.name.as_str();
        if vm.status.status != VmStatus::Tainted {
            self.vms
                .update_status_with_retry(self.ctx.retrier(), name, |vm| {
                    vm.status.status = VmStatus::Tainted;
                    Ok(())
                })
                .await
                .err_tip(|| format!("Marking vm {name} tainted"))?;
        }
        info!(vm = name, "Deleting tainted vm");
        self.vms.delete_ignore_missing(name).await
    }

    async fn provision(&self, name: &str) -> Result<(), Error> {
        // The cache may not have seen our last write yet; only provision
        // what the store still reports as unprovisioned.
        let Some(vm) = self.vms.get_opt(name).await? else {
            return Ok(());
        };
        if vm.status.status != VmStatus::RequestedForProvisioning || vm.metadata.is_deleting() {
            return Ok(());
        }

        let template = self
            .ctx
            .lister::<VirtualMachineTemplate>()
            .get(&vm.spec.vm_template_id)
            .err_tip(|| format!("Loading template of vm {name}"))?;
        let environment = self
            .ctx
            .lister::<Environment>()
            .get(environment_of(&vm)?)
            .err_tip(|| format!("Loading environment of vm {name}"))?;
        let config_maps = self.ctx.api::<ConfigMap>();
        let secrets = self.ctx.api::<Secret>();
        let config = resolve_config(&template, &environment, &vm.status.ws_endpoint)
            .err_tip(|| format!("Resolving provisioning config of vm {name}"))?;
        let config = resolve_handles(config, &config_maps, &secrets)
            .await
            .err_tip(|| format!("Resolving config handles of vm {name}"))?;
        let key_pair = self.key_pairs.generate()?;

        let records = create_records(
            &vm,
            config,
            key_pair,
            &config_maps,
            &secrets,
            &self.ctx.api::<TfState>(),
        )
        .await?;
        debug!(vm = name, ?records, "Created provisioning records");

        self.vms
            .update_with_retry(self.ctx.retrier(), name, |vm| {
                vm.spec.secret_name.clone_from(&records.secret);
                vm.metadata.add_finalizer(VM_CONTROLLER_FINALIZER);
                Ok(())
            })
            .await
            .err_tip(|| format!("Recording secret of vm {name}"))?;
        self.vms
            .update_status_with_retry(self.ctx.retrier(), name, |vm| {
                vm.status.status = VmStatus::Provisioned;
                vm.status.tfstate.clone_from(&records.state);
                Ok(())
            })
            .await
            .err_tip(|| format!("Marking vm {name} provisioned"))?;
        info!(vm = name, state = %records.state, "Vm provisioned");
        Ok(())
    }

    async fn check_running(&self, vm: &VirtualMachine) -> Result<(), Error> {
        let name = vm.metadata.name.as_str();
        let executions = self.ctx.lister::<TfExecution>();
        let Some(execution) = latest_execution(&executions, &vm.status.tfstate)? else {
            debug!(vm = name, "No execution for vm yet");
            return Ok(());
        };
        let environment = self.ctx.lister::<Environment>().get(environment_of(vm)?)?;
        let Some(addresses) = addresses_from(&execution, &environment)
            .err_tip(|| format!("Reading outputs for vm {name}"))?
        else {
            return Ok(());
        };
        self.vms
            .update_status_with_retry(self.ctx.retrier(), name, |vm| {
                if vm.status.status != VmStatus::Provisioned {
                    return Ok(());
                }
                vm.status.status = VmStatus::Running;
                vm.status.private_ip.clone_from(&addresses.private_ip);
                vm.status.public_ip.clone_from(&addresses.public_ip);
                vm.status.hostname.clone_from(&addresses.hostname);
                Ok(())
            })
            .await
            .err_tip(|| format!("Marking vm {name} running"))?;
        info!(vm = name, private_ip = %addresses.private_ip, "Vm running");
        if !vm.spec.vm_claim_id.is_empty() {
            self.vm_claims.enqueue(&vm.spec.vm_claim_id);
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VmReconciler {
    async fn reconcile(&self, name: &str) -> Result<(), Error> {
        let vm = match self.vm_lister.get(name) {
            Ok(vm) => vm,
            Err(err) if err.code == Code::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if vm.metadata.is_deleting() {
            return self.finalize(&vm).await;
        }
        if vm.status.tainted {
            return self.taint(&vm).await;
        }
        if vm
            .metadata
            .label(PROVISIONER)
            .is_some_and(|provisioner| !provisioner.is_empty())
        {
            return Ok(());
        }
        match vm.status.status {
            VmStatus::RequestedForProvisioning => self.provision(name).await,
            VmStatus::Provisioned => self.check_running(&vm).await,
            VmStatus::Running => Ok(()),
            VmStatus::Tainted => self.vms.delete_ignore_missing(name).await,
        }
    }
}

/// Names of VMs whose TfState produced `execution`.
pub fn vms_for_execution(
    vms: &Lister<VirtualMachine>,
    execution: &TfExecution,
) -> Vec<String> {
    let Some(state) = execution.metadata.label(TF_STATE) else {
        return Vec::new();
    };
    vms.list(&LabelSelector::everything())
        .unwrap_or_default()
        .into_iter()
        .filter(|vm| vm.status.tfstate == state)
        .map(|vm| vm.metadata.name.clone())
        .collect()
}
