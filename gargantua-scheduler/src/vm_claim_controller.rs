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
use std::sync::Arc;

use async_trait::async_trait;
use gargantua_controller::Reconciler;
use gargantua_error::{Code, Error, ResultExt, make_err};
use gargantua_resources::labels::{
    ACCESS_CODE, BOUND, DYNAMIC, RESTRICTED_BIND, RESTRICTED_BIND_VALUE,
    SCHEDULED_EVENT, SESSION, TEMPLATE, USER, VM_CLAIM, bool_value,
};
use gargantua_resources::vm::BindMode;
use gargantua_resources::{
    AccessCode, DynamicBindConfig, Environment, ScheduledEvent, Session, VirtualMachine,
    VirtualMachineClaim, VirtualMachineTemplate, VmStatus,
};
use gargantua_store::{Api, Lister};
use gargantua_util::labels::LabelSelector;
use tracing::{debug, info, warn};

use crate::access_code::{resolve_access_code, scheduled_event_for};
use crate::allocation::{EnvironmentCapacity, plan_dynamic};
use crate::context::SchedulerContext;
use crate::session_controller::{taint_claim, taint_session};
use crate::terraform::environment_of;
use crate::vm_factory::new_vm;

/// Slot name -> VM id.
type Assignments = BTreeMap<String, String>;

/// Binds each claim's VM slots to concrete VMs, either from the event's
/// pool (static) or by creating them (dynamic), and reports readiness once
/// they all run.
#[derive(Debug)]
pub struct VmClaimReconciler {
    ctx: SchedulerContext,
    claims: Api<VirtualMachineClaim>,
    claim_lister: Lister<VirtualMachineClaim>,
    vms: Api<VirtualMachine>,
    vm_lister: Lister<VirtualMachine>,
}

impl VmClaimReconciler {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self {
            claims: ctx.api(),
            claim_lister: ctx.lister(),
            vms: ctx.api(),
            vm_lister: ctx.lister(),
            ctx,
        }
    }

    fn scheduled_event(&self, claim: &VirtualMachineClaim) -> Result<Arc<ScheduledEvent>, Error> {
        let code = claim
            .metadata
            .label(ACCESS_CODE)
            .filter(|code| !code.is_empty())
            .ok_or_else(|| {
                make_err!(
                    Code::PermissionDenied,
                    "Claim {} has no access code",
                    claim.metadata.name
                )
            })?;
        let access_code =
            resolve_access_code(&self.ctx.lister::<AccessCode>(), code, self.ctx.now())?;
        scheduled_event_for(&self.ctx.lister::<ScheduledEvent>(), &access_code)
    }

    fn unbound_slots(claim: &VirtualMachineClaim) -> Vec<(String, String)> {
        claim
            .spec
            .vms
            .iter()
            .filter(|(_, slot)| slot.vm_id.is_empty())
            .map(|(name, slot)| (name.clone(), slot.template.clone()))
            .collect()
    }

    /// Marks `vm` as bound to `claim`. The `bound` label is flipped first
    /// with a version-checked write, so two claims racing for the same VM
    /// cannot both win.
    async fn claim_vm(&self, vm: &str, claim: &VirtualMachineClaim) -> Result<(), Error> {
        let claim_name = claim.metadata.name.as_str();
        let user = claim.spec.user_id.as_str();
        self.vms
            .update_with_retry(self.ctx.retrier(), vm, |vm| {
                if !vm.is_allocatable() || vm.metadata.label(BOUND) != Some(bool_value(false)) {
                    return Err(make_err!(
                        Code::FailedPrecondition,
                        "Vm {} was taken by someone else",
                        vm.metadata.name
                    ));
                }
                vm.metadata
                    .labels
                    .insert(BOUND.to_string(), bool_value(true).to_string());
                vm.spec.vm_claim_id = claim_name.to_string();
                vm.spec.user = user.to_string();
                Ok(())
            })
            .await?;
        self.vms
            .update_status_with_retry(self.ctx.retrier(), vm, |vm| {
                vm.status.allocated = true;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Best effort; a VM that stays bound is reclaimed when its session
    /// is torn down.
    async fn release_vms(&self, claim: &str, vms: &[String]) {
        for vm in vms {
            let result = self
                .vms
                .update_with_retry(self.ctx.retrier(), vm, |vm| {
                    if vm.spec.vm_claim_id != claim {
                        return Ok(());
                    }
                    vm.metadata
                        .labels
                        .insert(BOUND.to_string(), bool_value(false).to_string());
                    vm.spec.vm_claim_id.clear();
                    vm.spec.user.clear();
                    Ok(())
                })
                .await;
            let result = match result {
                Ok(_) => self
                    .vms
                    .update_status_with_retry(self.ctx.retrier(), vm, |vm| {
                        vm.status.allocated = false;
                        Ok(())
                    })
                    .await
                    .map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(claim, vm = %vm, ?err, "Could not release vm");
            }
        }
    }

    async fn bind_static(
        &self,
        claim: &VirtualMachineClaim,
        event: &ScheduledEvent,
    ) -> Result<Assignments, Error> {
        let claim_name = claim.metadata.name.as_str();
        let environments = self.ctx.lister::<Environment>();
        let mut assignments = Assignments::new();

        for (slot, template) in Self::unbound_slots(claim) {
            let mut selector = LabelSelector::everything()
                .eq(BOUND, bool_value(false))
                .eq(TEMPLATE, template.as_str())
                .eq(RESTRICTED_BIND, bool_value(claim.spec.restricted_bind));
            if claim.spec.restricted_bind {
                selector = selector.eq(
                    RESTRICTED_BIND_VALUE,
                    claim.spec.restricted_bind_value.as_str(),
                );
            }
            let mut candidates: Vec<Arc<VirtualMachine>> = self
                .vm_lister
                .list(&selector)?
                .into_iter()
                .filter(|vm| vm.is_allocatable())
                .filter(|vm| !assignments.values().any(|id| *id == vm.metadata.name))
                .filter(|vm| {
                    environment_of(vm).is_ok_and(|env| {
                        event.allows_environment(env)
                            && environments
                                .get(env)
                                .is_ok_and(|env| env.supports_template(&template))
                    })
                })
                .collect();
            candidates.sort_by_key(|vm| vm.status.status != VmStatus::Running);

            let mut chosen = None;
            for candidate in candidates {
                match self.claim_vm(&candidate.metadata.name, claim).await {
                    Ok(()) => {
                        chosen = Some(candidate.metadata.name.clone());
                        break;
                    }
                    Err(err)
                        if matches!(
                            err.code,
                            Code::FailedPrecondition | Code::Aborted | Code::NotFound
                        ) =>
                    {
                        debug!(
                            claim = claim_name,
                            vm = %candidate.metadata.name,
                            ?err,
                            "Candidate was taken"
                        );
                    }
                    Err(err) => {
                        let taken: Vec<String> = assignments.into_values().collect();
                        self.release_vms(claim_name, &taken).await;
                        return Err(err);
                    }
                }
            }
            let Some(vm) = chosen else {
                let taken: Vec<String> = assignments.into_values().collect();
                self.release_vms(claim_name, &taken).await;
                return Err(make_err!(
                    Code::ResourceExhausted,
                    "No vm of template {template} is available for claim {claim_name}"
                ));
            };
            assignments.insert(slot, vm);
        }
        Ok(assignments)
    }

    async fn capacities(
        &self,
        event: &ScheduledEvent,
    ) -> Result<Vec<EnvironmentCapacity>, Error> {
        let event_name = event.metadata.name.as_str();
        let mut bind_configs: BTreeMap<String, Vec<Arc<DynamicBindConfig>>> = BTreeMap::new();
        for config in self
            .ctx
            .lister::<DynamicBindConfig>()
            .list(&LabelSelector::everything().eq(SCHEDULED_EVENT, event_name))?
        {
            if event.allows_environment(&config.spec.environment) {
                bind_configs
                    .entry(config.spec.environment.clone())
                    .or_default()
                    .push(config);
            }
        }

        // From the store, so VMs created moments ago count against capacity.
        let vms = self.vms.list(&LabelSelector::everything()).await?;
        let environments = self.ctx.lister::<Environment>();
        let mut capacities = Vec::with_capacity(bind_configs.len());
        for (environment, mut configs) in bind_configs {
            let env = match environments.get(&environment) {
                Ok(env) => env,
                Err(err) if err.code == Code::NotFound => {
                    warn!(
                        scheduled_event = event_name,
                        %environment,
                        "Bind config names a missing environment"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            configs.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
            let mut capacity = EnvironmentCapacity {
                environment: environment.clone(),
                capacity: env.spec.count_capacity.clone(),
                burst: configs
                    .iter()
                    .map(|config| {
                        (
                            config.metadata.name.clone(),
                            config.spec.burst_count_capacity.clone(),
                        )
                    })
                    .collect(),
                ..EnvironmentCapacity::default()
            };
            for vm in vms.iter().filter(|vm| {
                !vm.metadata.is_deleting()
                    && environment_of(vm).is_ok_and(|env| env == environment)
            }) {
                let template = vm.spec.vm_template_id.clone();
                *capacity.existing.entry(template.clone()).or_default() += 1;
                if vm.metadata.label(SCHEDULED_EVENT) == Some(event_name) {
                    *capacity.existing_for_event.entry(template).or_default() += 1;
                }
            }
            capacities.push(capacity);
        }
        Ok(capacities)
    }

    async fn bind_dynamic(
        &self,
        claim: &VirtualMachineClaim,
        event: &ScheduledEvent,
    ) -> Result<Assignments, Error> {
        let claim_name = claim.metadata.name.as_str();
        let plan = plan_dynamic(&Self::unbound_slots(claim), &self.capacities(event).await?)
            .err_tip(|| format!("Placing vms of claim {claim_name}"))?;

        let templates = self.ctx.lister::<VirtualMachineTemplate>();
        let environments = self.ctx.lister::<Environment>();
        let restriction = (
            claim.spec.restricted_bind,
            claim.spec.restricted_bind_value.clone(),
        );
        let mut assignments = Assignments::new();
        for (slot, placement) in plan {
            let created = async {
                let template_id = claim
                    .spec
                    .vms
                    .get(&slot)
                    .map(|slot| slot.template.as_str())
                    .unwrap_or_default();
                let template = templates.get(template_id)?;
                let environment = environments.get(&placement.environment)?;
                let mut vm = new_vm(
                    &claim.spec.base_name,
                    &template,
                    &environment,
                    &restriction,
                    Some(&event.metadata.name),
                );
                vm.metadata = vm
                    .metadata
                    .with_label(DYNAMIC, bool_value(true))
                    .with_label(VM_CLAIM, claim_name)
                    .with_label(BOUND, bool_value(true))
                    .with_label(USER, claim.spec.user_id.as_str())
                    .owned_by(claim);
                vm.spec.vm_claim_id = claim_name.to_string();
                vm.spec.user.clone_from(&claim.spec.user_id);
                vm.status.allocated = true;
                self.vms.create(&vm).await
            }
            .await;
            match created {
                Ok(vm) => {
                    debug!(
                        claim = claim_name,
                        vm = %vm.metadata.name,
                        environment = %placement.environment,
                        bind_config = %placement.bind_config,
                        "Created vm"
                    );
                    assignments.insert(slot, vm.metadata.name);
                }
                Err(err) => {
                    for vm in assignments.values() {
                        if let Err(err) = self.vms.delete_ignore_missing(vm).await {
                            warn!(
                                claim = claim_name,
                                %vm,
                                ?err,
                                "Could not remove vm of failed claim"
                            );
                        }
                    }
                    return Err(err.append(format!("Creating vms of claim {claim_name}")));
                }
            }
        }
        Ok(assignments)
    }

    /// Session the claim belongs to.
    fn session_of(&self, claim: &VirtualMachineClaim) -> Option<String> {
        if let Some(session) = claim.metadata.label(SESSION).filter(|s| !s.is_empty()) {
            return Some(session.to_string());
        }
        self.ctx
            .lister::<Session>()
            .list(&LabelSelector::everything())
            .ok()?
            .into_iter()
            .find(|session| session.spec.vm_claim.contains(&claim.metadata.name))
            .map(|session| session.metadata.name.clone())
    }

    async fn bind(&self, name: &str) -> Result<(), Error> {
        // Binding has side effects; only act on what the store says.
        let Some(claim) = self.claims.get_opt(name).await? else {
            return Ok(());
        };
        if claim.status.bound || claim.status.tainted || claim.metadata.is_deleting() {
            return Ok(());
        }

        let event = self.scheduled_event(&claim);
        let bind_mode = match &event {
            Ok(event) if event.spec.on_demand && claim.spec.dynamic_capable => BindMode::Dynamic,
            _ => BindMode::Static,
        };
        let result = match event {
            Ok(event) => match bind_mode {
                BindMode::Static => self.bind_static(&claim, &event).await,
                BindMode::Dynamic => self.bind_dynamic(&claim, &event).await,
            },
            Err(err) => Err(err),
        };
        let assignments = match result {
            Ok(assignments) => assignments,
            Err(err) if err.is_permanent() => {
                warn!(claim = name, ?err, "Binding failed, tainting session");
                return match self.session_of(&claim) {
                    Some(session) => taint_session(&self.ctx, &session).await,
                    None => taint_claim(&self.ctx, name).await,
                };
            }
            Err(err) => return Err(err),
        };

        self.claims
            .update_with_retry(self.ctx.retrier(), name, |claim| {
                for (slot, vm) in &assignments {
                    if let Some(slot) = claim.spec.vms.get_mut(slot) {
                        slot.vm_id.clone_from(vm);
                    }
                }
                Ok(())
            })
            .await
            .err_tip(|| format!("Recording vms of claim {name}"))?;
        self.claims
            .update_status_with_retry(self.ctx.retrier(), name, |claim| {
                claim.status.bound = true;
                claim.status.ready = false;
                claim.status.bind_mode = Some(bind_mode);
                if bind_mode == BindMode::Static {
                    claim.status.static_bind_attempts += 1;
                }
                Ok(())
            })
            .await
            .err_tip(|| format!("Marking claim {name} bound"))?;
        info!(claim = name, ?bind_mode, vms = ?assignments, "Claim bound");
        Ok(())
    }

    async fn check_ready(&self, claim: &VirtualMachineClaim) -> Result<(), Error> {
        let name = claim.metadata.name.as_str();
        let all_running = claim.spec.vms.values().all(|slot| {
            !slot.vm_id.is_empty()
                && self
                    .vm_lister
                    .get(&slot.vm_id)
                    .is_ok_and(|vm| vm.status.status == VmStatus::Running)
        });
        if !all_running {
            return Ok(());
        }
        self.claims
            .update_status_with_retry(self.ctx.retrier(), name, |claim| {
                claim.status.ready = true;
                Ok(())
            })
            .await
            .err_tip(|| format!("Marking claim {name} ready"))?;
        info!(claim = name, "Claim ready");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VmClaimReconciler {
    async fn reconcile(&self, name: &str) -> Result<(), Error> {
        let claim = match self.claim_lister.get(name) {
            Ok(claim) => claim,
            Err(err) if err.code == Code::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if claim.metadata.is_deleting() {
            return Ok(());
        }
        if claim.status.tainted {
            taint_claim(&self.ctx, name).await?;
            info!(claim = name, "Deleting tainted claim");
            return self.claims.delete_ignore_missing(name).await;
        }
        match (claim.status.bound, claim.status.ready) {
            (false, _) => self.bind(name).await,
            (true, false) => self.check_ready(&claim).await,
            (true, true) => Ok(()),
        }
    }
}

/// Claims to wake up when `vm` changes.
pub fn claims_for_vm(vm: &VirtualMachine) -> Vec<String> {
    if vm.spec.vm_claim_id.is_empty() {
        return Vec::new();
    }
    vec![vm.spec.vm_claim_id.clone()]
}

