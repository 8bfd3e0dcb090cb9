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

//! Drives each scheduled event through its time window: provisions its
//! VM sets or burst configs, tracks readiness and tears everything down
//! once the event ends.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gargantua_controller::{ControllerHandle, Reconciler};
use gargantua_error::{Code, Error, ResultExt};
use gargantua_resources::labels::{ENVIRONMENT, SCHEDULED_EVENT, TEMPLATE};
use gargantua_resources::session::DynamicBindConfigSpec;
use gargantua_resources::time::parse_unix_date;
use gargantua_resources::vm::VirtualMachineSetSpec;
use gargantua_resources::{
    AccessCode, DynamicBindConfig, ObjectMeta, ScheduledEvent, VirtualMachineSet,
};
use gargantua_store::{Api, Lister};
use gargantua_util::clock::until;
use gargantua_util::labels::LabelSelector;
use gargantua_util::names::generate_name;
use tracing::{debug, info};

use crate::access_code::{access_code_for_event, expire_at, is_expired};
use crate::context::SchedulerContext;

fn owned_by_event(event: &str) -> LabelSelector {
    LabelSelector::everything().eq(SCHEDULED_EVENT, event)
}

/// Name of the burst config `event` holds on `environment`.
pub fn bind_config_name(event: &str, environment: &str) -> String {
    format!("{event}-{environment}")
}

#[derive(Debug)]
pub struct ScheduledEventReconciler {
    ctx: SchedulerContext,
    events: Api<ScheduledEvent>,
    event_lister: Lister<ScheduledEvent>,
    vm_sets: Api<VirtualMachineSet>,
    bind_configs: Api<DynamicBindConfig>,
    access_codes: Api<AccessCode>,
    handle: ControllerHandle,
}

impl ScheduledEventReconciler {
    pub fn new(ctx: SchedulerContext, handle: ControllerHandle) -> Self {
        Self {
            events: ctx.api(),
            event_lister: ctx.lister(),
            vm_sets: ctx.api(),
            bind_configs: ctx.api(),
            access_codes: ctx.api(),
            ctx,
            handle,
        }
    }

    async fn ensure_access_code(&self, event: &ScheduledEvent) -> Result<(), Error> {
        if event.spec.access_code.is_empty() {
            return Ok(());
        }
        if self
            .access_codes
            .get_opt(&event.spec.access_code)
            .await?
            .is_some()
        {
            return Ok(());
        }
        match self.access_codes.create(&access_code_for_event(event)).await {
            Err(err) if err.code == Code::AlreadyExists => Ok(()),
            result => result.map(|_| ()).err_tip(|| {
                format!(
                    "Creating access code {} for event {}",
                    event.spec.access_code, event.metadata.name
                )
            }),
        }
    }

    /// Creates the sets the event still lacks and returns the names of all
    /// of them. Existing sets are matched on their environment and template
    /// labels, so a pass cut short is picked up where it stopped.
    async fn provision_vm_sets(&self, event: &ScheduledEvent) -> Result<Vec<String>, Error> {
        let name = event.metadata.name.as_str();
        let existing = self.vm_sets.list(&owned_by_event(name)).await?;
        let present: BTreeSet<(&str, &str)> = existing
            .iter()
            .filter_map(|vm_set| {
                Some((
                    vm_set.metadata.label(ENVIRONMENT)?,
                    vm_set.metadata.label(TEMPLATE)?,
                ))
            })
            .collect();
        let mut names: Vec<String> = existing.iter().map(|s| s.metadata.name.clone()).collect();

        let prefix = self.ctx.config().global.scheduled_base_name_prefix.as_str();
        let (restricted_bind, restricted_bind_value) = event.bind_restriction();
        for (environment, templates) in &event.spec.required_vms {
            for (template, count) in templates {
                if present.contains(&(environment.as_str(), template.as_str())) {
                    continue;
                }
                let vm_set = VirtualMachineSet {
                    metadata: ObjectMeta::named(generate_name(prefix))
                        .with_label(SCHEDULED_EVENT, name)
                        .with_label(ENVIRONMENT, environment.as_str())
                        .with_label(TEMPLATE, template.as_str())
                        .owned_by(event),
                    spec: VirtualMachineSetSpec {
                        count: *count,
                        environment: environment.clone(),
                        vm_template: template.clone(),
                        base_name: prefix.to_string(),
                        restricted_bind,
                        restricted_bind_value: restricted_bind_value.clone(),
                    },
                    ..VirtualMachineSet::default()
                };
                let created = self
                    .vm_sets
                    .create(&vm_set)
                    .await
                    .err_tip(|| format!("Creating vm set for event {name} in {environment}"))?;
                debug!(event = name, vm_set = %created.metadata.name, "Created vm set");
                names.push(created.metadata.name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn provision_bind_configs(&self, event: &ScheduledEvent) -> Result<(), Error> {
        let name = event.metadata.name.as_str();
        let (restricted_bind, restricted_bind_value) = event.bind_restriction();
        for (environment, templates) in &event.spec.required_vms {
            let spec = DynamicBindConfigSpec {
                environment: environment.clone(),
                restricted_bind,
                restricted_bind_value: restricted_bind_value.clone(),
                burst_count_capacity: templates.clone(),
            };
            let config_name = bind_config_name(name, environment);
            if self.bind_configs.get_opt(&config_name).await?.is_some() {
                self.bind_configs
                    .update_with_retry(self.ctx.retrier(), &config_name, |config| {
                        config.spec.clone_from(&spec);
                        Ok(())
                    })
                    .await
                    .err_tip(|| format!("Updating bind config {config_name}"))?;
                continue;
            }
            let config = DynamicBindConfig {
                metadata: ObjectMeta::named(config_name.as_str())
                    .with_label(SCHEDULED_EVENT, name)
                    .with_label(ENVIRONMENT, environment.as_str())
                    .owned_by(event),
                spec,
            };
            self.bind_configs
                .create(&config)
                .await
                .err_tip(|| format!("Creating bind config {config_name}"))?;
        }
        Ok(())
    }

    fn vm_sets_ready(&self, names: &[String]) -> bool {
        let lister = self.ctx.lister::<VirtualMachineSet>();
        names.iter().all(|name| {
            lister
                .get(name)
                .is_ok_and(|vm_set| vm_set.status.provisioned >= vm_set.spec.count)
        })
    }

    async fn delete_children(&self, event: &str) -> Result<(), Error> {
        let vm_sets = self
            .vm_sets
            .delete_collection(&owned_by_event(event))
            .await
            .err_tip(|| format!("Deleting vm sets of event {event}"))?;
        let bind_configs = self
            .bind_configs
            .delete_collection(&owned_by_event(event))
            .await
            .err_tip(|| format!("Deleting bind configs of event {event}"))?;
        if vm_sets + bind_configs > 0 {
            info!(event, vm_sets, bind_configs, "Released event capacity");
        }
        Ok(())
    }

    async fn expire_access_codes(&self, event: &str, now: DateTime<Utc>) -> Result<(), Error> {
        let expiration = expire_at(now);
        for code in self.access_codes.list(&owned_by_event(event)).await? {
            if is_expired(&code, now).unwrap_or(false) {
                continue;
            }
            self.access_codes
                .update_with_retry(self.ctx.retrier(), &code.metadata.name, |code| {
                    code.spec.expiration.clone_from(&expiration);
                    Ok(())
                })
                .await
                .err_tip(|| format!("Expiring access code {}", code.metadata.name))?;
        }
        Ok(())
    }

    async fn finish(&self, event: &ScheduledEvent, now: DateTime<Utc>) -> Result<(), Error> {
        let name = event.metadata.name.as_str();
        self.delete_children(name).await?;
        self.expire_access_codes(name, now).await?;
        self.events
            .update_status_with_retry(self.ctx.retrier(), name, |event| {
                event.status.finished = true;
                event.status.active = false;
                event.status.ready = false;
                Ok(())
            })
            .await
            .err_tip(|| format!("Finishing event {name}"))?;
        info!(event = name, "Scheduled event finished");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ScheduledEventReconciler {
    async fn reconcile(&self, name: &str) -> Result<(), Error> {
        let event = match self.event_lister.get(name) {
            Ok(event) => event,
            Err(err) if err.code == Code::NotFound => return self.delete_children(name).await,
            Err(err) => return Err(err),
        };
        if event.status.finished || event.metadata.is_deleting() {
            return Ok(());
        }
        let start = parse_unix_date(&event.spec.start_time)
            .err_tip(|| format!("Reading start time of event {name}"))?;
        let end = parse_unix_date(&event.spec.end_time)
            .err_tip(|| format!("Reading end time of event {name}"))?;
        let now = self.ctx.now();
        if now >= end {
            return self.finish(&event, now).await;
        }

        self.ensure_access_code(&event).await?;
        let vm_sets = if event.spec.on_demand {
            if !event.status.provisioned {
                self.provision_bind_configs(&event).await?;
            }
            Vec::new()
        } else if event.status.provisioned {
            event.status.vm_sets.clone()
        } else {
            self.provision_vm_sets(&event).await?
        };
        let ready = event.spec.on_demand || self.vm_sets_ready(&vm_sets);
        let active = now >= start;

        self.events
            .update_status_with_retry(self.ctx.retrier(), name, |event| {
                event.status.provisioned = true;
                event.status.vm_sets.clone_from(&vm_sets);
                event.status.ready = ready;
                event.status.active = active;
                Ok(())
            })
            .await
            .err_tip(|| format!("Updating status of event {name}"))?;

        let next = if active { end } else { start };
        self.handle.enqueue_after(name, until(now, next));
        Ok(())
    }
}

/// Scheduled events to look at again when one of their sets changes.
pub fn events_for_vm_set(vm_set: &VirtualMachineSet) -> Vec<String> {
    vm_set
        .metadata
        .label(SCHEDULED_EVENT)
        .map(|event| vec![event.to_string()])
        .unwrap_or_default()
}

