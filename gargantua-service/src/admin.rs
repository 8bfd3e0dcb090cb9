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

//! Admin CRUD under `/a/<plural>`, gated per resource and verb.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Form, Json, Router};
use gargantua_error::{Code, Error, ResultExt, error_if, make_err};
use gargantua_resources::labels::SCHEDULED_EVENT;
use gargantua_resources::{
    AccessCode, Course, DynamicBindConfig, Environment, Progress, Resource, Scenario,
    ScheduledEvent, Session, User, VirtualMachine, VirtualMachineClaim, VirtualMachineSet,
    VirtualMachineTemplate,
};
use gargantua_scheduler::SchedulerContext;
use gargantua_scheduler::cost::cost_for_group;
use gargantua_scheduler::schedule::{environment_available, virtual_machines_used_during_period};
use gargantua_util::labels::LabelSelector;
use serde::{Deserialize, Serialize};

use crate::auth::Verb;
use crate::envelope::{ApiError, content};
use crate::gateway::{Caller, Gateway};
use crate::resource_service::{DeleteCollectionRequest, ListRequest, NameRequest};

/// A kind editable through the admin routes.
pub trait AdminResource: Resource {
    /// Objects that would dangle if `name` were deleted, as `<kind> <name>`.
    fn referenced_by(_ctx: &SchedulerContext, _name: &str) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }
}

fn live_events(ctx: &SchedulerContext) -> Result<Vec<Arc<ScheduledEvent>>, Error> {
    Ok(ctx
        .lister::<ScheduledEvent>()
        .list(&LabelSelector::everything())?
        .into_iter()
        .filter(|event| !event.status.finished)
        .collect())
}

fn describe<K: Resource>(name: &str) -> String {
    format!("{} {name}", K::KIND)
}

impl AdminResource for VirtualMachineTemplate {
    fn referenced_by(ctx: &SchedulerContext, name: &str) -> Result<Vec<String>, Error> {
        let environments = ctx
            .lister::<Environment>()
            .list(&LabelSelector::everything())?
            .into_iter()
            .filter(|env| env.spec.template_mapping.contains_key(name))
            .map(|env| describe::<Environment>(&env.metadata.name));
        let vm_sets = ctx
            .lister::<VirtualMachineSet>()
            .list(&LabelSelector::everything())?
            .into_iter()
            .filter(|vm_set| vm_set.spec.vm_template == name)
            .map(|vm_set| describe::<VirtualMachineSet>(&vm_set.metadata.name));
        Ok(environments.chain(vm_sets).collect())
    }
}

impl AdminResource for Environment {
    fn referenced_by(ctx: &SchedulerContext, name: &str) -> Result<Vec<String>, Error> {
        Ok(live_events(ctx)?
            .into_iter()
            .filter(|event| event.allows_environment(name))
            .map(|event| describe::<ScheduledEvent>(&event.metadata.name))
            .collect())
    }
}

impl AdminResource for Scenario {
    fn referenced_by(ctx: &SchedulerContext, name: &str) -> Result<Vec<String>, Error> {
        let courses = ctx
            .lister::<Course>()
            .list(&LabelSelector::everything())?
            .into_iter()
            .filter(|course| course.spec.scenarios.iter().any(|s| s == name))
            .map(|course| describe::<Course>(&course.metadata.name));
        let events = live_events(ctx)?
            .into_iter()
            .filter(|event| event.spec.scenarios.iter().any(|s| s == name))
            .map(|event| describe::<ScheduledEvent>(&event.metadata.name));
        Ok(courses.chain(events).collect())
    }
}

impl AdminResource for Course {
    fn referenced_by(ctx: &SchedulerContext, name: &str) -> Result<Vec<String>, Error> {
        Ok(live_events(ctx)?
            .into_iter()
            .filter(|event| event.spec.courses.iter().any(|c| c == name))
            .map(|event| describe::<ScheduledEvent>(&event.metadata.name))
            .collect())
    }
}

impl AdminResource for AccessCode {}
impl AdminResource for DynamicBindConfig {}
impl AdminResource for Progress {}
impl AdminResource for ScheduledEvent {}
impl AdminResource for Session {}
impl AdminResource for User {}
impl AdminResource for VirtualMachine {}
impl AdminResource for VirtualMachineClaim {}
impl AdminResource for VirtualMachineSet {}

/// Requests every admin kind's informer, so cached lists work once the
/// factory starts.
pub(crate) fn register_informers(ctx: &SchedulerContext) {
    let factory = ctx.factory();
    factory.informer::<AccessCode>();
    factory.informer::<Course>();
    factory.informer::<DynamicBindConfig>();
    factory.informer::<Environment>();
    factory.informer::<Progress>();
    factory.informer::<Scenario>();
    factory.informer::<ScheduledEvent>();
    factory.informer::<Session>();
    factory.informer::<User>();
    factory.informer::<VirtualMachine>();
    factory.informer::<VirtualMachineClaim>();
    factory.informer::<VirtualMachineSet>();
    factory.informer::<VirtualMachineTemplate>();
}

pub(crate) fn routes() -> Router<Gateway> {
    Router::new()
        .merge(resource_routes::<AccessCode>())
        .merge(resource_routes::<Course>())
        .merge(resource_routes::<DynamicBindConfig>())
        .merge(resource_routes::<Environment>())
        .merge(resource_routes::<Progress>())
        .merge(resource_routes::<Scenario>())
        .merge(resource_routes::<ScheduledEvent>())
        .merge(resource_routes::<Session>())
        .merge(resource_routes::<User>())
        .merge(resource_routes::<VirtualMachine>())
        .merge(resource_routes::<VirtualMachineClaim>())
        .merge(resource_routes::<VirtualMachineSet>())
        .merge(resource_routes::<VirtualMachineTemplate>())
        .route("/a/environments/{id}/available", post(available))
        .route("/a/scheduledevents/{id}/cost", get(event_cost))
}

fn resource_routes<K: AdminResource>() -> Router<Gateway> {
    let base = format!("/a/{}", K::PLURAL);
    Router::new()
        .route(
            &base,
            get(list::<K>).post(create::<K>).delete(delete_collection::<K>),
        )
        .route(
            &format!("{base}/{{id}}"),
            get(read::<K>).put(update::<K>).delete(delete::<K>),
        )
        .route(&format!("{base}/{{id}}/status"), put(update_status::<K>))
        .route(&format!("{base}/{{id}}/workqueue"), post(enqueue::<K>))
}

/// The path names the object; a body naming another one is refused.
fn named<K: Resource>(id: &str, mut object: K) -> Result<K, Error> {
    if object.meta().name.is_empty() {
        id.clone_into(&mut object.meta_mut().name);
    }
    error_if!(
        object.meta().name != id,
        "{} body names {}, path names {id}",
        K::KIND,
        object.meta().name
    );
    Ok(object)
}

async fn list<K: AdminResource>(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Query(request): Query<ListRequest>,
) -> Result<Response, ApiError> {
    gateway.authorize::<K>(&user, Verb::List).await?;
    let objects = gateway.service::<K>().list(&request).await?;
    content(StatusCode::OK, &objects)
}

async fn read<K: AdminResource>(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    gateway.authorize::<K>(&user, Verb::Get).await?;
    let object = gateway.service::<K>().get(&NameRequest { name }).await?;
    content(StatusCode::OK, &object)
}

async fn create<K: AdminResource>(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Json(object): Json<K>,
) -> Result<Response, ApiError> {
    gateway.authorize::<K>(&user, Verb::Create).await?;
    let created = gateway.service::<K>().create(&object).await?;
    content(StatusCode::CREATED, &created)
}

async fn update<K: AdminResource>(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(name): Path<String>,
    Json(object): Json<K>,
) -> Result<Response, ApiError> {
    gateway.authorize::<K>(&user, Verb::Update).await?;
    let object = named(&name, object)?;
    let updated = gateway.service::<K>().update(&object).await?;
    content(StatusCode::OK, &updated)
}

async fn update_status<K: AdminResource>(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(name): Path<String>,
    Json(object): Json<K>,
) -> Result<Response, ApiError> {
    gateway.authorize::<K>(&user, Verb::Update).await?;
    let object = named(&name, object)?;
    let updated = gateway.service::<K>().update_status(&object).await?;
    content(StatusCode::OK, &updated)
}

async fn delete<K: AdminResource>(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    gateway.authorize::<K>(&user, Verb::Delete).await?;
    let references = K::referenced_by(gateway.context(), &name)?;
    if !references.is_empty() {
        return Err(make_err!(
            Code::FailedPrecondition,
            "{} {name} is still referenced by {}",
            K::KIND,
            references.join(", ")
        )
        .into());
    }
    gateway.service::<K>().delete(&NameRequest { name: name.clone() }).await?;
    content(StatusCode::OK, &NameRequest { name })
}

async fn delete_collection<K: AdminResource>(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Query(request): Query<DeleteCollectionRequest>,
) -> Result<Response, ApiError> {
    gateway.authorize::<K>(&user, Verb::Delete).await?;
    let deleted = gateway.service::<K>().delete_collection(&request).await?;
    content(StatusCode::OK, &deleted)
}

async fn enqueue<K: AdminResource>(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    gateway.authorize::<K>(&user, Verb::Update).await?;
    let request = NameRequest { name };
    gateway.service::<K>().add_to_workqueue(&request).await?;
    content(StatusCode::OK, &request)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PeriodForm {
    start: String,
    end: String,
}

/// Capacity an environment has left over a period, next to the peak that
/// unfinished scheduled events hold of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityView {
    pub available: BTreeMap<String, u32>,
    pub max: BTreeMap<String, u32>,
}

async fn available(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(name): Path<String>,
    Form(period): Form<PeriodForm>,
) -> Result<Response, ApiError> {
    gateway.authorize::<Environment>(&user, Verb::Get).await?;
    gateway.authorize::<ScheduledEvent>(&user, Verb::List).await?;
    error_if!(
        period.start.is_empty() || period.end.is_empty(),
        "Availability needs a start and an end"
    );
    let ctx = gateway.context();
    let environment = ctx
        .lister::<Environment>()
        .get(&name)
        .err_tip(|| format!("Loading environment {name}"))?;
    let events = ctx.lister::<ScheduledEvent>().list(&LabelSelector::everything())?;
    let usage = virtual_machines_used_during_period(
        events.iter().map(|event| &**event),
        &name,
        &period.start,
        &period.end,
        ctx.now(),
    )?;
    let view = AvailabilityView {
        available: environment_available(&environment, &usage),
        max: usage.max,
    };
    content(StatusCode::OK, &view)
}

/// Cost per template of the VMs a scheduled event currently holds.
async fn event_cost(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    gateway.authorize::<ScheduledEvent>(&user, Verb::Get).await?;
    gateway.authorize::<VirtualMachine>(&user, Verb::List).await?;
    let ctx = gateway.context();
    ctx.lister::<ScheduledEvent>()
        .get(&name)
        .err_tip(|| format!("Loading scheduled event {name}"))?;
    let vms = ctx
        .lister::<VirtualMachine>()
        .list(&LabelSelector::everything().eq(SCHEDULED_EVENT, name.as_str()))?;
    let templates: BTreeMap<String, VirtualMachineTemplate> = ctx
        .lister::<VirtualMachineTemplate>()
        .list(&LabelSelector::everything())?
        .into_iter()
        .map(|template| (template.metadata.name.clone(), template.as_ref().clone()))
        .collect();
    let costs = cost_for_group(vms.iter().map(|vm| &**vm), &templates, ctx.now());
    content(StatusCode::OK, &costs)
}

#[cfg(test)]
mod tests {
    use gargantua_error::Code;
    use gargantua_resources::{Environment, ObjectMeta};

    use super::named;

    #[test]
    fn path_name_wins_over_empty_body_name() {
        let env = named("env1", Environment::default()).unwrap();
        assert_eq!(env.metadata.name, "env1");

        let other = Environment {
            metadata: ObjectMeta::named("env2"),
            ..Environment::default()
        };
        assert_eq!(named("env1", other).unwrap_err().code, Code::InvalidArgument);
    }
}
