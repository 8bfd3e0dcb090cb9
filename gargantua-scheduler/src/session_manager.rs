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

//! User-facing session lifecycle: start, keepalive, pause, resume and
//! finish. The session controller does the reaping; this only moves the
//! timers it acts on.

use core::time::Duration;
use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use gargantua_error::{Code, Error, ResultExt, error_if, make_err};
use gargantua_resources::labels::{
    ACCESS_CODE, FINISHED, SCHEDULED_EVENT, SESSION, USER, bool_value,
};
use gargantua_resources::session::{ProgressSpec, SessionSpec, SessionStatus};
use gargantua_resources::time::parse_duration;
use gargantua_resources::vm::{VirtualMachineClaimSpec, VirtualMachineClaimVm};
use gargantua_resources::{
    AccessCode, Course, ObjectMeta, Progress, Scenario, ScheduledEvent, Session,
    VirtualMachineClaim,
};
use gargantua_store::Api;
use gargantua_util::labels::LabelSelector;
use gargantua_util::names::generate_name;
use tracing::info;

use crate::access_code::{resolve_access_code, scheduled_event_for};
use crate::context::SchedulerContext;
use crate::session_controller::finish_progress;

const SESSION_NAME_BASE: &str = "ss";
const CLAIM_NAME_BASE: &str = "vmc";
const PROGRESS_NAME_BASE: &str = "progress";

/// A request to start learning a scenario, or a course.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSession {
    pub user: String,
    /// Required unless `course` is set, in which case it picks the
    /// scenario within the course and defaults to the course's first.
    pub scenario: String,
    pub course: String,
    pub access_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub session: Session,
    /// False when a live session was reused.
    pub created: bool,
}

/// Timer durations that apply to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimers {
    pub keepalive: Duration,
    pub pause: Duration,
    pub pausable: bool,
}

impl SessionTimers {
    /// Keepalive is the longest of the course's and the scenario's; pause
    /// duration comes from the course if it sets one. Defaults apply when
    /// neither does.
    pub fn resolve(
        course: Option<&Course>,
        scenario: Option<&Scenario>,
        default_keepalive: Duration,
        default_pause: Duration,
    ) -> Result<Self, Error> {
        let mut keepalive = None;
        for value in course
            .map(|c| c.spec.keepalive_duration.as_str())
            .into_iter()
            .chain(scenario.map(|s| s.spec.keepalive_duration.as_str()))
        {
            keepalive = keepalive.max(parse_duration(value)?);
        }
        let course_pause = course
            .map(|c| parse_duration(&c.spec.pause_duration))
            .transpose()?
            .flatten();
        let scenario_pause = scenario
            .map(|s| parse_duration(&s.spec.pause_duration))
            .transpose()?
            .flatten();
        Ok(Self {
            keepalive: keepalive.unwrap_or(default_keepalive),
            pause: course_pause.or(scenario_pause).unwrap_or(default_pause),
            pausable: course.is_some_and(|c| c.spec.pausable)
                || scenario.is_some_and(|s| s.spec.pausable),
        })
    }
}

fn after(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, Error> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .err_tip_with_code(|_| {
            (
                Code::OutOfRange,
                format!("{duration:?} after {now} overflows"),
            )
        })
}

#[derive(Debug, Clone)]
pub struct SessionManager {
    ctx: SchedulerContext,
    sessions: Api<Session>,
    claims: Api<VirtualMachineClaim>,
    progresses: Api<Progress>,
}

impl SessionManager {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self {
            sessions: ctx.api(),
            claims: ctx.api(),
            progresses: ctx.api(),
            ctx,
        }
    }

    async fn timers(&self, session: &SessionSpec) -> Result<SessionTimers, Error> {
        let course = if session.course.is_empty() {
            None
        } else {
            self.ctx.api::<Course>().get_opt(&session.course).await?
        };
        let scenario = if session.scenario.is_empty() {
            None
        } else {
            self.ctx.api::<Scenario>().get_opt(&session.scenario).await?
        };
        let defaults = &self.ctx.config().controllers.session_timers;
        SessionTimers::resolve(
            course.as_ref(),
            scenario.as_ref(),
            Duration::from_secs(defaults.default_keepalive_seconds),
            Duration::from_secs(defaults.default_pause_seconds),
        )
    }

    /// Fetches `id` for `user`. Someone else's session is reported as
    /// missing.
    pub async fn get(&self, id: &str, user: &str) -> Result<Session, Error> {
        let session = self.sessions.get(id).await?;
        if session.spec.user != user {
            return Err(make_err!(Code::NotFound, "Session {id} not found"));
        }
        Ok(session)
    }

    async fn live_session(&self, id: &str, user: &str) -> Result<Session, Error> {
        let session = self.get(id, user).await?;
        if session.status.finished {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Session {id} has already finished"
            ));
        }
        Ok(session)
    }

    async fn create_progress(
        &self,
        session: &Session,
        scenario: &Scenario,
        now: DateTime<Utc>,
    ) -> Result<Progress, Error> {
        let session_name = session.metadata.name.as_str();
        let progress = Progress {
            metadata: ObjectMeta::named(generate_name(PROGRESS_NAME_BASE))
                .with_label(SESSION, session_name)
                .with_label(USER, session.spec.user.as_str())
                .with_label(FINISHED, bool_value(false)),
            spec: ProgressSpec {
                current_step: 0,
                max_step: 0,
                total_step: u32::try_from(scenario.spec.steps.len())?,
                course: session.spec.course.clone(),
                scenario: scenario.metadata.name.clone(),
                user: session.spec.user.clone(),
                session: session_name.to_string(),
                started: Some(now),
                last_update: Some(now),
                finished: false,
                steps: Vec::new(),
            },
        };
        self.progresses
            .create(&progress)
            .await
            .err_tip(|| format!("Creating progress for session {session_name}"))
    }

    /// Starts a session, or hands back the user's live session for the same
    /// course (or stand-alone scenario).
    pub async fn new_session(&self, request: NewSession) -> Result<StartedSession, Error> {
        error_if!(
            request.scenario.is_empty() && request.course.is_empty(),
            "A scenario or a course is required"
        );
        error_if!(request.user.is_empty(), "A user is required");
        let now = self.ctx.now();

        let access_code = resolve_access_code(
            &self.ctx.lister::<AccessCode>(),
            &request.access_code,
            now,
        )?;
        let event = scheduled_event_for(&self.ctx.lister::<ScheduledEvent>(), &access_code)?;
        let granted = if request.course.is_empty() {
            event.grants(&request.scenario, "")
        } else {
            event.grants("", &request.course)
        };
        if !granted {
            return Err(make_err!(
                Code::PermissionDenied,
                "Access code {} does not grant {}",
                request.access_code,
                if request.course.is_empty() {
                    &request.scenario
                } else {
                    &request.course
                }
            ));
        }

        let course = if request.course.is_empty() {
            None
        } else {
            Some(self.ctx.api::<Course>().get(&request.course).await?)
        };
        let scenario_id = match &course {
            Some(course) if request.scenario.is_empty() => course
                .spec
                .scenarios
                .first()
                .cloned()
                .ok_or_else(|| {
                    make_err!(
                        Code::FailedPrecondition,
                        "Course {} has no scenarios",
                        request.course
                    )
                })?,
            Some(course) => {
                error_if!(
                    !course.spec.scenarios.contains(&request.scenario),
                    "Scenario {} is not part of course {}",
                    request.scenario,
                    request.course
                );
                request.scenario.clone()
            }
            None => request.scenario.clone(),
        };
        let scenario = self.ctx.api::<Scenario>().get(&scenario_id).await?;
        let defaults = &self.ctx.config().controllers.session_timers;
        let timers = SessionTimers::resolve(
            course.as_ref(),
            Some(&scenario),
            Duration::from_secs(defaults.default_keepalive_seconds),
            Duration::from_secs(defaults.default_pause_seconds),
        )?;

        if let Some(existing) = self.find_live(&request).await? {
            return self
                .reuse(existing, &scenario, timers, now)
                .await
                .map(|session| StartedSession {
                    session,
                    created: false,
                });
        }

        let session_name = generate_name(SESSION_NAME_BASE);
        let (restricted_bind, restricted_bind_value) = event.bind_restriction();
        let vm_sets = course
            .as_ref()
            .map(|c| &c.spec)
            .filter(|spec| !spec.virtualmachines.is_empty())
            .map_or(&scenario.spec.virtualmachines, |spec| &spec.virtualmachines);
        let claims: Vec<VirtualMachineClaim> = vm_sets
            .iter()
            .map(|vms| VirtualMachineClaim {
                metadata: ObjectMeta::named(generate_name(CLAIM_NAME_BASE))
                    .with_label(ACCESS_CODE, request.access_code.as_str())
                    .with_label(USER, request.user.as_str())
                    .with_label(SCHEDULED_EVENT, event.metadata.name.as_str())
                    .with_label(SESSION, session_name.as_str()),
                spec: VirtualMachineClaimSpec {
                    user_id: request.user.clone(),
                    restricted_bind,
                    restricted_bind_value: restricted_bind_value.clone(),
                    base_name: self.ctx.config().global.dynamic_base_name_prefix.clone(),
                    dynamic_capable: true,
                    vms: vms
                        .iter()
                        .map(|(local, template)| {
                            (
                                local.clone(),
                                VirtualMachineClaimVm {
                                    template: template.clone(),
                                    vm_id: String::new(),
                                },
                            )
                        })
                        .collect::<BTreeMap<_, _>>(),
                },
                ..VirtualMachineClaim::default()
            })
            .collect();

        let session = self
            .sessions
            .create(&Session {
                metadata: ObjectMeta::named(session_name.as_str())
                    .with_label(USER, request.user.as_str())
                    .with_label(ACCESS_CODE, request.access_code.as_str()),
                spec: SessionSpec {
                    scenario: scenario.metadata.name.clone(),
                    course: request.course.clone(),
                    keep_course_vm: course.as_ref().is_some_and(|c| c.spec.keep_vm),
                    user: request.user.clone(),
                    vm_claim: claims.iter().map(|c| c.metadata.name.clone()).collect(),
                    access_code: request.access_code.clone(),
                },
                status: SessionStatus {
                    active: true,
                    finished: false,
                    paused: false,
                    paused_time: None,
                    start_time: Some(now),
                    expiration_time: Some(after(now, timers.keepalive)?),
                },
            })
            .await
            .err_tip(|| format!("Creating session for user {}", request.user))?;
        for claim in &claims {
            self.claims
                .create(claim)
                .await
                .err_tip(|| format!("Creating claim for session {session_name}"))?;
        }
        self.create_progress(&session, &scenario, now).await?;
        info!(
            session = %session_name,
            user = %request.user,
            claims = claims.len(),
            "Session started"
        );
        Ok(StartedSession {
            session,
            created: true,
        })
    }

    async fn find_live(&self, request: &NewSession) -> Result<Option<Session>, Error> {
        let sessions = self
            .sessions
            .list(&LabelSelector::everything().eq(USER, request.user.as_str()))
            .await?;
        Ok(sessions.into_iter().find(|session| {
            session.status.active
                && !session.status.finished
                && if request.course.is_empty() {
                    session.spec.course.is_empty() && session.spec.scenario == request.scenario
                } else {
                    session.spec.course == request.course
                }
        }))
    }

    /// A course session moving to another scenario closes the old
    /// scenario's progress and opens a fresh one. Either way the keepalive
    /// is refreshed.
    async fn reuse(
        &self,
        existing: Session,
        scenario: &Scenario,
        timers: SessionTimers,
        now: DateTime<Utc>,
    ) -> Result<Session, Error> {
        let name = existing.metadata.name.clone();
        let mut session = existing;
        if !session.spec.course.is_empty() && session.spec.scenario != scenario.metadata.name {
            session = self
                .sessions
                .update_with_retry(self.ctx.retrier(), &name, |session| {
                    session.spec.scenario.clone_from(&scenario.metadata.name);
                    Ok(())
                })
                .await
                .err_tip(|| format!("Switching scenario of session {name}"))?;
            finish_progress(&self.ctx, &name, now).await?;
            self.create_progress(&session, scenario, now).await?;
        }
        let expiration = after(now, timers.keepalive)?;
        self.sessions
            .update_status_with_retry(self.ctx.retrier(), &name, |session| {
                session.status.expiration_time = Some(expiration);
                Ok(())
            })
            .await
            .err_tip(|| format!("Extending session {name}"))
    }

    /// Pushes expiration out by the keepalive duration. Sessions whose
    /// access code no longer resolves, or that are paused, are left alone.
    pub async fn keepalive(&self, id: &str, user: &str) -> Result<Session, Error> {
        let session = self.live_session(id, user).await?;
        if session.status.paused {
            return Ok(session);
        }
        let now = self.ctx.now();
        if let Err(err) = resolve_access_code(
            &self.ctx.lister::<AccessCode>(),
            &session.spec.access_code,
            now,
        ) {
            info!(session = id, ?err, "Not extending session, access code is gone");
            return Ok(session);
        }
        let expiration = after(now, self.timers(&session.spec).await?.keepalive)?;
        self.sessions
            .update_status_with_retry(self.ctx.retrier(), id, |session| {
                session.status.expiration_time = Some(expiration);
                Ok(())
            })
            .await
    }

    pub async fn pause(&self, id: &str, user: &str) -> Result<Session, Error> {
        let session = self.live_session(id, user).await?;
        let timers = self.timers(&session.spec).await?;
        if !timers.pausable {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Session {id} cannot be paused"
            ));
        }
        let paused_until = after(self.ctx.now(), timers.pause)?;
        self.sessions
            .update_status_with_retry(self.ctx.retrier(), id, |session| {
                session.status.paused = true;
                session.status.paused_time = Some(paused_until);
                Ok(())
            })
            .await
    }

    pub async fn resume(&self, id: &str, user: &str) -> Result<Session, Error> {
        let session = self.live_session(id, user).await?;
        let expiration = after(self.ctx.now(), self.timers(&session.spec).await?.keepalive)?;
        self.sessions
            .update_status_with_retry(self.ctx.retrier(), id, |session| {
                session.status.paused = false;
                session.status.paused_time = None;
                session.status.expiration_time = Some(expiration);
                Ok(())
            })
            .await
    }

    /// Ends the session now; the session controller reaps it.
    pub async fn finish(&self, id: &str, user: &str) -> Result<Session, Error> {
        self.live_session(id, user).await?;
        let now = self.ctx.now();
        self.sessions
            .update_status_with_retry(self.ctx.retrier(), id, |session| {
                session.status.active = false;
                session.status.expiration_time = Some(now);
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use gargantua_resources::content::{CourseSpec, ScenarioSpec};
    use gargantua_resources::{Course, Scenario};
    use pretty_assertions::assert_eq;

    use super::SessionTimers;

    const KEEPALIVE: Duration = Duration::from_secs(300);
    const PAUSE: Duration = Duration::from_secs(7200);

    fn scenario(keepalive: &str, pause: &str, pausable: bool) -> Scenario {
        Scenario {
            spec: ScenarioSpec {
                keepalive_duration: keepalive.to_string(),
                pause_duration: pause.to_string(),
                pausable,
                ..ScenarioSpec::default()
            },
            ..Scenario::default()
        }
    }

    fn course(keepalive: &str, pause: &str, pausable: bool) -> Course {
        Course {
            spec: CourseSpec {
                keepalive_duration: keepalive.to_string(),
                pause_duration: pause.to_string(),
                pausable,
                ..CourseSpec::default()
            },
            ..Course::default()
        }
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let timers =
            SessionTimers::resolve(None, Some(&scenario("", "", false)), KEEPALIVE, PAUSE).unwrap();
        assert_eq!(
            timers,
            SessionTimers {
                keepalive: KEEPALIVE,
                pause: PAUSE,
                pausable: false,
            }
        );
    }

    #[test]
    fn longest_keepalive_and_course_pause_win() {
        let timers = SessionTimers::resolve(
            Some(&course("10m", "30m", false)),
            Some(&scenario("1h", "1h", true)),
            KEEPALIVE,
            PAUSE,
        )
        .unwrap();
        assert_eq!(timers.keepalive, Duration::from_secs(3600));
        assert_eq!(timers.pause, Duration::from_secs(1800));
        assert!(timers.pausable);
    }

    #[test]
    fn bad_duration_is_rejected() {
        assert!(
            SessionTimers::resolve(None, Some(&scenario("forever", "", false)), KEEPALIVE, PAUSE)
                .is_err()
        );
    }
}
