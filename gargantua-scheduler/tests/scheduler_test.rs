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
use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use gargantua_error::{Code, Error};
use gargantua_macro::gargantua_test;
use gargantua_resources::labels::{BOUND, DYNAMIC, SCHEDULED_EVENT, VM_CLAIM};
use gargantua_resources::vm::BindMode;
use gargantua_resources::{
    AccessCode, ConfigMap, DynamicBindConfig, Progress, ScheduledEvent, Secret, Session,
    TfState, VirtualMachine, VirtualMachineClaim, VirtualMachineSet, VmStatus,
};
use gargantua_scheduler::access_code::is_expired;
use gargantua_scheduler::scheduled_event_controller::bind_config_name;
use gargantua_scheduler::{NewSession, StartedSession};
use gargantua_util::labels::LabelSelector;
use pretty_assertions::assert_eq;

use crate::utils::lab::{Lab, course, environment, scenario, scheduled_event, template};

mod utils {
    pub(crate) mod lab;
}

const USER: &str = "u1";
const CODE: &str = "ac1";
const EVENT: &str = "se1";

fn request(scenario: &str, course: &str) -> NewSession {
    NewSession {
        user: USER.to_string(),
        scenario: scenario.to_string(),
        course: course.to_string(),
        access_code: CODE.to_string(),
    }
}

fn event_vms() -> LabelSelector {
    LabelSelector::everything().eq(SCHEDULED_EVENT, EVENT)
}

fn running(vms: &[VirtualMachine], count: usize) -> bool {
    vms.len() == count
        && vms
            .iter()
            .all(|vm| vm.status.status == VmStatus::Running && !vm.metadata.is_deleting())
}

/// A lab whose event keeps a warm pool of `pool` VMs in `env1`.
async fn static_lab(pool: u32, vms: usize, ends_in: TimeDelta) -> Result<Lab, Error> {
    let lab = Lab::start().await?;
    lab.seed(template()).await?;
    lab.seed(environment("env1", 10)).await?;
    lab.seed(scenario(vms, false)).await?;
    lab.seed(course(false)).await?;
    lab.seed(scheduled_event(EVENT, CODE, false, &[("env1", pool)], ends_in))
        .await?;
    lab.wait_cached::<AccessCode>(CODE).await?;
    lab.wait_list::<VirtualMachine, _>(&event_vms(), "warm pool", |vms| {
        running(vms, pool as usize)
    })
    .await?;
    Ok(lab)
}

/// A lab whose on-demand event may burst up to each environment's
/// capacity.
async fn on_demand_lab(
    environments: &[(&str, u32)],
    vms: usize,
    pausable_course: bool,
) -> Result<Lab, Error> {
    let lab = Lab::start().await?;
    lab.seed(template()).await?;
    for (name, capacity) in environments {
        lab.seed(environment(name, *capacity)).await?;
    }
    lab.seed(scenario(vms, false)).await?;
    lab.seed(course(pausable_course)).await?;
    lab.seed(scheduled_event(
        EVENT,
        CODE,
        true,
        environments,
        TimeDelta::days(1),
    ))
    .await?;
    lab.wait_cached::<AccessCode>(CODE).await?;
    for (name, _) in environments {
        lab.wait_cached::<DynamicBindConfig>(&bind_config_name(EVENT, name))
            .await?;
    }
    Ok(lab)
}

/// Waits for the session's single claim to become ready and returns it
/// with its VMs.
async fn ready_claim(
    lab: &Lab,
    started: &StartedSession,
) -> Result<(VirtualMachineClaim, Vec<VirtualMachine>), Error> {
    assert_eq!(started.session.spec.vm_claim.len(), 1);
    let claim = lab
        .wait_for::<VirtualMachineClaim, _>(&started.session.spec.vm_claim[0], "ready", |c| {
            c.status.ready
        })
        .await?;
    let vms = lab.api::<VirtualMachine>();
    let mut bound = Vec::new();
    for slot in claim.spec.vms.values() {
        bound.push(vms.get(&slot.vm_id).await?);
    }
    Ok((claim, bound))
}

/// Timestamps come from a clock that moves while the test awaits.
fn assert_about(actual: Option<DateTime<Utc>>, expected: DateTime<Utc>) {
    let actual = actual.unwrap();
    assert!(
        (actual - expected).abs() <= TimeDelta::seconds(1),
        "{actual} is not close to {expected}"
    );
}

async fn assert_session_torn_down(lab: &Lab, started: &StartedSession) -> Result<(), Error> {
    lab.wait_gone::<Session>(&started.session.metadata.name).await?;
    for claim in &started.session.spec.vm_claim {
        lab.wait_gone::<VirtualMachineClaim>(claim).await?;
        lab.wait_list::<VirtualMachine, _>(
            &LabelSelector::everything().eq(VM_CLAIM, claim.as_str()),
            "claim's vms released",
            <[VirtualMachine]>::is_empty,
        )
        .await?;
    }
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn session_binds_warm_pool_vms() -> Result<(), Error> {
    let lab = static_lab(2, 2, TimeDelta::days(1)).await?;

    let started = lab.sessions.new_session(request("scen1", "")).await?;
    assert!(started.created);
    assert!(started.session.status.active);
    assert_eq!(started.session.spec.user, USER);

    let (claim, vms) = ready_claim(&lab, &started).await?;
    assert_eq!(claim.status.bind_mode, Some(BindMode::Static));
    assert!(claim.status.bound);
    assert_eq!(claim.status.static_bind_attempts, 1);
    assert_eq!(vms.len(), 2);
    for vm in &vms {
        assert!(vm.status.allocated);
        assert_eq!(vm.status.status, VmStatus::Running);
        assert_eq!(vm.metadata.label(BOUND), Some("true"));
        assert_eq!(vm.spec.vm_claim_id, claim.metadata.name);
        assert_eq!(vm.spec.user, USER);
        assert!(vm.status.public_ip.starts_with("203.0.113."));
        assert_eq!(vm.status.ws_endpoint, "wss://env1.example.com/shell");
    }
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn on_demand_claim_fits_in_one_environment() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env2", 5)], 2, false).await?;

    let started = lab.sessions.new_session(request("scen1", "")).await?;
    let (claim, vms) = ready_claim(&lab, &started).await?;
    assert_eq!(claim.status.bind_mode, Some(BindMode::Dynamic));
    assert_eq!(vms.len(), 2);
    for vm in &vms {
        assert_eq!(vm.status.environment_id, "env2");
        assert_eq!(vm.status.status, VmStatus::Running);
        assert_eq!(vm.metadata.label(DYNAMIC), Some("true"));
        assert_eq!(vm.spec.vm_claim_id, claim.metadata.name);
        assert!(!vm.spec.secret_name.is_empty());
        assert!(!vm.status.tfstate.is_empty());
    }
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn on_demand_claim_spreads_across_environments() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env2", 1), ("env3", 1)], 2, false).await?;

    let started = lab.sessions.new_session(request("scen1", "")).await?;
    let (_, vms) = ready_claim(&lab, &started).await?;
    let environments: BTreeSet<&str> = vms
        .iter()
        .map(|vm| vm.status.environment_id.as_str())
        .collect();
    assert_eq!(environments, BTreeSet::from(["env2", "env3"]));
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn claim_without_capacity_ends_the_session() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env2", 1)], 2, false).await?;

    let started = lab.sessions.new_session(request("scen1", "")).await?;
    assert!(started.created);
    assert_session_torn_down(&lab, &started).await?;
    lab.wait_list::<VirtualMachine, _>(&event_vms(), "no vms", <[VirtualMachine]>::is_empty)
        .await?;
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn finished_session_removes_provisioning_records() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env2", 5)], 2, false).await?;
    let started = lab.sessions.new_session(request("scen1", "")).await?;
    let (_, vms) = ready_claim(&lab, &started).await?;
    let everything = LabelSelector::everything();
    assert_eq!(lab.api::<ConfigMap>().list(&everything).await?.len(), 2);
    assert_eq!(lab.api::<Secret>().list(&everything).await?.len(), 2);

    lab.sessions
        .finish(&started.session.metadata.name, USER)
        .await?;
    for vm in &vms {
        lab.wait_gone::<VirtualMachine>(&vm.metadata.name).await?;
        lab.wait_gone::<TfState>(&vm.status.tfstate).await?;
        lab.wait_gone::<Secret>(&vm.spec.secret_name).await?;
    }
    lab.wait_list::<ConfigMap, _>(&everything, "config maps removed", <[ConfigMap]>::is_empty)
        .await?;
    lab.wait_list::<Secret, _>(&everything, "secrets removed", <[Secret]>::is_empty)
        .await?;
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn keepalive_extends_the_session() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env1", 5)], 1, false).await?;
    let started = lab.sessions.new_session(request("scen1", "")).await?;
    let id = started.session.metadata.name.as_str();
    ready_claim(&lab, &started).await?;

    tokio::time::sleep(Duration::from_secs(200)).await;
    let kept = lab.sessions.keepalive(id, USER).await?;
    assert_about(kept.status.expiration_time, lab.now() + TimeDelta::seconds(300));

    tokio::time::sleep(Duration::from_secs(200)).await;
    let session = lab.sessions.get(id, USER).await?;
    assert!(session.status.active);
    assert!(!session.status.finished);

    tokio::time::sleep(Duration::from_secs(110)).await;
    assert_session_torn_down(&lab, &started).await?;
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn paused_session_does_not_expire() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env1", 5)], 1, true).await?;
    let started = lab.sessions.new_session(request("", "course1")).await?;
    let id = started.session.metadata.name.as_str();
    assert_eq!(started.session.spec.scenario, "scen1");
    ready_claim(&lab, &started).await?;

    let paused = lab.sessions.pause(id, USER).await?;
    assert!(paused.status.paused);
    assert_about(paused.status.paused_time, lab.now() + TimeDelta::hours(2));

    tokio::time::sleep(Duration::from_secs(600)).await;
    let session = lab.sessions.get(id, USER).await?;
    assert!(session.status.active);
    assert!(session.status.paused);

    let resumed = lab.sessions.resume(id, USER).await?;
    assert!(!resumed.status.paused);
    assert_eq!(resumed.status.paused_time, None);
    assert_about(resumed.status.expiration_time, lab.now() + TimeDelta::seconds(300));

    let finished = lab.sessions.finish(id, USER).await?;
    assert!(!finished.status.active);
    assert_about(finished.status.expiration_time, lab.now());
    assert_session_torn_down(&lab, &started).await?;
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn pause_needs_a_pausable_session() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env1", 5)], 1, false).await?;
    let started = lab.sessions.new_session(request("scen1", "")).await?;

    let error = lab
        .sessions
        .pause(&started.session.metadata.name, USER)
        .await
        .unwrap_err();
    assert_eq!(error.code, Code::FailedPrecondition);
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn live_session_is_reused() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env1", 5)], 1, false).await?;
    let first = lab.sessions.new_session(request("scen1", "")).await?;
    let second = lab.sessions.new_session(request("scen1", "")).await?;

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(second.session.metadata.name, first.session.metadata.name);
    assert_eq!(second.session.spec.vm_claim, first.session.spec.vm_claim);

    let progress = lab
        .api::<Progress>()
        .list(&LabelSelector::everything())
        .await?;
    assert_eq!(progress.len(), 1);
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn sessions_need_a_granting_access_code() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env1", 5)], 1, false).await?;

    let error = lab
        .sessions
        .new_session(request("other-scenario", ""))
        .await
        .unwrap_err();
    assert_eq!(error.code, Code::PermissionDenied);

    let error = lab
        .sessions
        .new_session(NewSession {
            access_code: "nope".to_string(),
            ..request("scen1", "")
        })
        .await
        .unwrap_err();
    assert_eq!(error.code, Code::PermissionDenied);

    let error = lab
        .sessions
        .new_session(request("", ""))
        .await
        .unwrap_err();
    assert_eq!(error.code, Code::InvalidArgument);

    let sessions = lab
        .api::<Session>()
        .list(&LabelSelector::everything())
        .await?;
    assert!(sessions.is_empty());
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn other_users_cannot_see_a_session() -> Result<(), Error> {
    let lab = on_demand_lab(&[("env1", 5)], 1, false).await?;
    let started = lab.sessions.new_session(request("scen1", "")).await?;

    let error = lab
        .sessions
        .keepalive(&started.session.metadata.name, "u2")
        .await
        .unwrap_err();
    assert_eq!(error.code, Code::NotFound);
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn deleted_pool_vm_is_replaced() -> Result<(), Error> {
    let lab = static_lab(2, 1, TimeDelta::days(1)).await?;
    let pool = lab
        .api::<VirtualMachine>()
        .list(&event_vms())
        .await?;
    let victim = pool[0].metadata.name.clone();

    lab.api::<VirtualMachine>().delete(&victim).await?;
    lab.wait_gone::<VirtualMachine>(&victim).await?;
    let refilled = lab
        .wait_list::<VirtualMachine, _>(&event_vms(), "pool refilled", |vms| running(vms, 2))
        .await?;
    assert!(refilled.iter().all(|vm| vm.metadata.name != victim));
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn scale_down_keeps_allocated_vms() -> Result<(), Error> {
    let lab = static_lab(3, 1, TimeDelta::days(1)).await?;
    let started = lab.sessions.new_session(request("scen1", "")).await?;
    let (_, bound) = ready_claim(&lab, &started).await?;
    let kept = bound[0].metadata.name.clone();

    let vm_sets = lab
        .api::<VirtualMachineSet>()
        .list(&LabelSelector::everything().eq(SCHEDULED_EVENT, EVENT))
        .await?;
    assert_eq!(vm_sets.len(), 1);
    lab.api::<VirtualMachineSet>()
        .update_with_retry(lab.ctx.retrier(), &vm_sets[0].metadata.name, |vm_set| {
            vm_set.spec.count = 0;
            Ok(())
        })
        .await?;

    let left = lab
        .wait_list::<VirtualMachine, _>(&event_vms(), "unallocated vms removed", |vms| {
            vms.len() == 1
        })
        .await?;
    assert_eq!(left[0].metadata.name, kept);
    assert!(left[0].status.allocated);
    assert!(!left[0].metadata.is_deleting());

    tokio::time::sleep(Duration::from_secs(10)).await;
    let vm = lab.api::<VirtualMachine>().get(&kept).await?;
    assert!(vm.status.allocated);
    assert!(!vm.metadata.is_deleting());
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn failed_static_bind_releases_taken_vms() -> Result<(), Error> {
    let lab = static_lab(1, 2, TimeDelta::days(1)).await?;
    let pool = lab.api::<VirtualMachine>().list(&event_vms()).await?;
    assert_eq!(pool.len(), 1);
    let only = pool[0].metadata.name.clone();

    let started = lab.sessions.new_session(request("scen1", "")).await?;
    assert_eq!(started.session.spec.vm_claim.len(), 1);
    assert_session_torn_down(&lab, &started).await?;

    let vm = lab
        .wait_for::<VirtualMachine, _>(&only, "released", |vm| {
            vm.metadata.label(BOUND) == Some("false") && !vm.status.allocated
        })
        .await?;
    assert!(vm.spec.vm_claim_id.is_empty());
    assert!(vm.spec.user.is_empty());
    assert!(!vm.status.tainted);
    assert!(!vm.metadata.is_deleting());
    Ok(())
}

#[gargantua_test(start_paused = true)]
async fn ended_event_releases_its_resources() -> Result<(), Error> {
    let lab = static_lab(2, 1, TimeDelta::hours(1)).await?;
    let event = lab
        .wait_for::<ScheduledEvent, _>(EVENT, "ready", |e| e.status.ready)
        .await?;
    assert!(event.status.active);
    assert!(event.status.provisioned);
    assert_eq!(event.status.vm_sets.len(), 1);

    tokio::time::sleep(Duration::from_secs(3_601)).await;
    let event = lab
        .wait_for::<ScheduledEvent, _>(EVENT, "finished", |e| e.status.finished)
        .await?;
    assert!(!event.status.active);
    lab.wait_list::<VirtualMachineSet, _>(
        &LabelSelector::everything().eq(SCHEDULED_EVENT, EVENT),
        "vm sets removed",
        <[VirtualMachineSet]>::is_empty,
    )
    .await?;
    lab.wait_list::<VirtualMachine, _>(&event_vms(), "vms removed", <[VirtualMachine]>::is_empty)
        .await?;

    let code = lab.api::<AccessCode>().get(CODE).await?;
    assert!(is_expired(&code, lab.now())?);
    Ok(())
}
