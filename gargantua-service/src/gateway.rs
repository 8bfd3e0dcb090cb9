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

use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Form, Router};
use gargantua_error::{Code, Error, ResultExt, make_err};
use gargantua_resources::vm::BindMode;
use gargantua_resources::{
    Resource, Session, VirtualMachine, VirtualMachineClaim, VirtualMachineTemplate, VmStatus,
};
use gargantua_scheduler::{ControllerHandles, NewSession, SchedulerContext, SessionManager};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::admin::{self, AdminResource};
use crate::auth::{AuthN, AuthR, AuthenticatedUser, Permission, Verb, require};
use crate::envelope::{ApiError, content};
use crate::resource_service::ResourceService;

const WEB_INTERFACES_KEY: &str = "webinterfaces";

#[derive(Debug)]
struct GatewayInner {
    ctx: SchedulerContext,
    sessions: SessionManager,
    handles: ControllerHandles,
    authn: Arc<dyn AuthN>,
    authr: Arc<dyn AuthR>,
}

/// Shared state of the HTTP gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Must be built before the informer factory starts: it requests the
    /// informers the admin routes read from.
    pub fn new(
        ctx: SchedulerContext,
        handles: ControllerHandles,
        authn: Arc<dyn AuthN>,
        authr: Arc<dyn AuthR>,
    ) -> Self {
        admin::register_informers(&ctx);
        Self {
            inner: Arc::new(GatewayInner {
                sessions: SessionManager::new(ctx.clone()),
                ctx,
                handles,
                authn,
                authr,
            }),
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.inner.ctx
    }

    pub(crate) fn service<K: Resource>(&self) -> ResourceService<K> {
        ResourceService::new(&self.inner.ctx, self.inner.handles.clone())
    }

    pub(crate) async fn authorize<K: AdminResource>(
        &self,
        user: &AuthenticatedUser,
        verb: Verb,
    ) -> Result<(), Error> {
        require(
            self.inner.authr.as_ref(),
            user,
            &Permission::new(K::PLURAL, verb),
        )
        .await
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/session/new", post(new_session))
            .route("/session/{id}", get(get_session))
            .route("/session/{id}/finished", put(finish_session))
            .route("/session/{id}/keepalive", put(keepalive_session))
            .route("/session/{id}/pause", put(pause_session))
            .route("/session/{id}/resume", put(resume_session))
            .route("/vmclaim/{id}", get(get_vm_claim))
            .route("/vm/{id}", get(get_vm))
            .route("/vm/getwebinterfaces/{id}", get(get_web_interfaces))
            .merge(admin::routes())
            .with_state(self.clone())
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Caller(pub AuthenticatedUser);

impl FromRequestParts<Gateway> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, gateway: &Gateway) -> Result<Self, ApiError> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(Self(gateway.inner.authn.authenticate(&token).await?))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct NewSessionForm {
    scenario: String,
    course: String,
    access_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub scenario: String,
    pub course: String,
    pub keep_course_vm: bool,
    pub user: String,
    pub vm_claim: Vec<String>,
    pub access_code: String,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        Self {
            id: session.metadata.name,
            scenario: session.spec.scenario,
            course: session.spec.course,
            keep_course_vm: session.spec.keep_course_vm,
            user: session.spec.user,
            vm_claim: session.spec.vm_claim,
            access_code: session.spec.access_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedVm {
    pub template: String,
    pub vm_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmClaimView {
    pub id: String,
    pub user_id: String,
    pub restricted_bind: bool,
    pub restricted_bind_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_mode: Option<BindMode>,
    pub ready: bool,
    pub vm: BTreeMap<String, ClaimedVm>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmView {
    pub id: String,
    pub vm_template_id: String,
    pub ssh_username: String,
    pub protocol: String,
    pub secret_name: String,
    pub vm_claim_id: String,
    pub user: String,
    pub status: VmStatus,
    pub allocated: bool,
    pub tainted: bool,
    pub public_ip: String,
    pub private_ip: String,
    pub hostname: String,
    pub environment_id: String,
    pub ws_endpoint: String,
}

impl From<VirtualMachine> for VmView {
    fn from(vm: VirtualMachine) -> Self {
        Self {
            id: vm.metadata.name,
            vm_template_id: vm.spec.vm_template_id,
            ssh_username: vm.spec.ssh_username,
            protocol: vm.spec.protocol,
            secret_name: vm.spec.secret_name,
            vm_claim_id: vm.spec.vm_claim_id,
            user: vm.spec.user,
            status: vm.status.status,
            allocated: vm.status.allocated,
            tainted: vm.status.tainted,
            public_ip: vm.status.public_ip,
            private_ip: vm.status.private_ip,
            hostname: vm.status.hostname,
            environment_id: vm.status.environment_id,
            ws_endpoint: vm.status.ws_endpoint,
        }
    }
}

async fn new_session(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Form(form): Form<NewSessionForm>,
) -> Result<Response, ApiError> {
    let started = gateway
        .inner
        .sessions
        .new_session(NewSession {
            user: user.id,
            scenario: form.scenario,
            course: form.course,
            access_code: form.access_code,
        })
        .await?;
    let status = if started.created {
        info!(session = %started.session.metadata.name, "Started session");
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    content(status, &SessionView::from(started.session))
}

async fn get_session(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = gateway.inner.sessions.get(&id, &user.id).await?;
    content(StatusCode::OK, &SessionView::from(session))
}

async fn finish_session(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = gateway.inner.sessions.finish(&id, &user.id).await?;
    content(StatusCode::OK, &SessionView::from(session))
}

async fn keepalive_session(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = gateway.inner.sessions.keepalive(&id, &user.id).await?;
    content(StatusCode::OK, &SessionView::from(session))
}

async fn pause_session(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = gateway.inner.sessions.pause(&id, &user.id).await?;
    content(StatusCode::OK, &SessionView::from(session))
}

async fn resume_session(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = gateway.inner.sessions.resume(&id, &user.id).await?;
    content(StatusCode::OK, &SessionView::from(session))
}

/// Users only see their own claims and VMs; anything else is reported
/// as missing.
fn not_found<K: Resource>(id: &str) -> Error {
    make_err!(Code::NotFound, "{} {id} not found", K::KIND)
}

async fn get_vm_claim(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let claim = gateway
        .inner
        .ctx
        .api::<VirtualMachineClaim>()
        .get(&id)
        .await?;
    if claim.spec.user_id != user.id {
        return Err(not_found::<VirtualMachineClaim>(&id).into());
    }
    let view = VmClaimView {
        id: claim.metadata.name,
        user_id: claim.spec.user_id,
        restricted_bind: claim.spec.restricted_bind,
        restricted_bind_value: claim.spec.restricted_bind_value,
        bind_mode: claim.status.bind_mode,
        ready: claim.status.ready,
        vm: claim
            .spec
            .vms
            .into_iter()
            .map(|(local, slot)| {
                (
                    local,
                    ClaimedVm {
                        template: slot.template,
                        vm_id: slot.vm_id,
                    },
                )
            })
            .collect(),
    };
    content(StatusCode::OK, &view)
}

async fn owned_vm(gateway: &Gateway, user: &str, id: &str) -> Result<VirtualMachine, Error> {
    let vm = gateway.inner.ctx.api::<VirtualMachine>().get(id).await?;
    if vm.spec.user != user {
        return Err(not_found::<VirtualMachine>(id));
    }
    Ok(vm)
}

async fn get_vm(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let vm = owned_vm(&gateway, &user.id, &id).await?;
    content(StatusCode::OK, &VmView::from(vm))
}

/// The web interfaces declared in the VM's template, as the JSON the
/// template's config map holds. Templates without any yield `[]`.
async fn get_web_interfaces(
    State(gateway): State<Gateway>,
    Caller(user): Caller,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let vm = owned_vm(&gateway, &user.id, &id).await?;
    let template = gateway
        .inner
        .ctx
        .api::<VirtualMachineTemplate>()
        .get(&vm.spec.vm_template_id)
        .await
        .err_tip(|| format!("Loading template of vm {id}"))?;
    let interfaces = match template.spec.config_map.get(WEB_INTERFACES_KEY) {
        Some(raw) => serde_json::from_str(raw)
            .err_tip(|| format!("Decoding web interfaces of template {}", template.metadata.name))?,
        None => Value::Array(Vec::new()),
    };
    content(StatusCode::OK, &interfaces)
}
