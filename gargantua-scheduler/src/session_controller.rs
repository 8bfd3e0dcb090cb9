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

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gargantua_controller::{ControllerHandle, Reconciler};
use gargantua_error::{Code, Error, ResultExt};
use gargantua_resources::labels::{FINISHED, SESSION, bool_value};
use gargantua_resources::{Progress, Session, VirtualMachine, VirtualMachineClaim};
use gargantua_store::{Api, Lister};
use gargantua_util::clock::until;
use gargantua_util::labels::LabelSelector;
use tracing::{debug, info};

use crate::context::SchedulerContext;

fn ignore_not_found<T>(result: Result<T, Error>) -> Result<(), Error> {
    match result {
        Err(err) if err.code == Code::NotFound => Ok(()),
        result => result.map(|_| ()),
    }
}

fn unfinished_progress_of(session: &str) -> LabelSelector {
    LabelSelector::everything()
        .eq(SESSION, session)
        .eq(FINISHED, bool_value(false))
}

/// Marks every unfinished progress of `session` finished.
pub async fn finish_progress(
    ctx: &SchedulerContext,
    session: &str,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let progresses = ctx.api::<Progress>();
    for progress in progresses.list(&unfinished_progress_of(session)).await? {
        let result = progresses
            .update_with_retry(ctx.retrier(), &progress.metadata.name, |progress| {
                progress.spec.finished = true;
                progress.spec.last_update = Some(now);
                progress
                    .metadata
                    .labels
                    .insert(FINISHED.to_string(), bool_value(true).to_string());
                Ok(())
            })
            .await;
        ignore_not_found(result)
            .err_tip(|| format!("Finishing progress {}", progress.metadata.name))?;
    }
    Ok(())
}

/// Ends `session` right away: it stops being active, expires now, and its
/// unfinished progress is dropped. The session controller then tears down
/// its claims.
pub async fn taint_session(ctx: &SchedulerContext, session: &str) -> Result<(), Error> {
    let now = ctx.now();
    let result = ctx
        .api::<Session>()
        .update_status_with_retry(ctx.retrier(), session, |session| {
            if session.status.finished {
                return Ok(());
            }
            session.status.active = false;
            session.status.expiration_time = Some(now);
            Ok(())
        })
        .await;
    ignore_not_found(result).err_tip(|| format!("Tainting session {session}"))?;
    ctx.api::<Progress>()
        .delete_collection(&unfinished_progress_of(session))
        .await
        .err_tip(|| format!("Deleting progress of session {session}"))?;
    info!(session, "Session tainted");
    Ok(())
}

/// Taints `claim` and every VM bound to it.
pub async fn taint_claim(ctx: &SchedulerContext, claim: &str) -> Result<(), Error> {
    let claims = ctx.api::<VirtualMachineClaim>();
    let Some(current) = claims.get_opt(claim).await? else {
        return Ok(());
    };
    let vms = ctx.api::<VirtualMachine>();
    for slot in current.spec.vms.values() {
        if slot.vm_id.is_empty() {
            continue;
        }
        let result = vms
            .update_status_with_retry(ctx.retrier(), &slot.vm_id, |vm| {
                vm.status.tainted = true;
                Ok(())
            })
            .await;
        ignore_not_found(result).err_tip(|| format!("Tainting vm {}", slot.vm_id))?;
    }
    let result = claims
        .update_status_with_retry(ctx.retrier(), claim, |claim| {
            claim.status.tainted = true;
            Ok(())
        })
        .await;
    ignore_not_found(result).err_tip(|| format!("Tainting claim {claim}"))
}

/// Expires sessions whose keepalive ran out and reaps finished ones.
#[derive(Debug)]
pub struct SessionReconciler {
    ctx: SchedulerContext,
    sessions: Api<Session>,
    session_lister: Lister<Session>,
    handle: ControllerHandle,
}

impl SessionReconciler {
    pub fn new(ctx: SchedulerContext, handle: ControllerHandle) -> Self {
        Self {
            sessions: ctx.api(),
            session_lister: ctx.lister(),
            ctx,
            handle,
        }
    }

    async fn expire(&self, session: &Session) -> Result<(), Error> {
        let name = session.metadata.name.as_str();
        for claim in &session.spec.vm_claim {
            taint_claim(&self.ctx, claim).await?;
        }
        let result = self
            .sessions
            .update_status_with_retry(self.ctx.retrier(), name, |session| {
                session.status.finished = true;
                session.status.active = false;
                Ok(())
            })
            .await;
        ignore_not_found(result).err_tip(|| format!("Finishing session {name}"))?;
        info!(session = name, "Session expired");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for SessionReconciler {
    async fn reconcile(&self, name: &str) -> Result<(), Error> {
        let session = match self.session_lister.get(name) {
            Ok(session) => session,
            Err(err) if err.code == Code::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        let now = self.ctx.now();

        if session.status.finished {
            self.sessions.delete_ignore_missing(name).await?;
            finish_progress(&self.ctx, name, now).await?;
            debug!(session = name, "Deleted finished session");
            return Ok(());
        }

        let Some(expiration) = session.status.expiration_time else {
            return Ok(());
        };
        if expiration > now {
            self.handle.enqueue_after(name, until(now, expiration));
            return Ok(());
        }
        // A pause keeps an expired session alive until the pause runs out.
        if let Some(paused_until) = session
            .status
            .paused_time
            .filter(|paused_until| session.status.paused && *paused_until > now)
        {
            self.handle.enqueue_after(name, until(now, paused_until));
            return Ok(());
        }
        self.expire(&session).await
    }
}
