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

use core::future::Future;
use core::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use gargantua_error::{Code, Error};
use gargantua_resources::substrate::LeaseSpec;
use gargantua_resources::{Lease, ObjectMeta};
use gargantua_store::Api;
use gargantua_util::clock::ClockRef;
use gargantua_util::spawn;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease-based leader election. The holder renews every third of the
/// lease duration; anyone may take a lease over once it has gone a full
/// duration without renewal.
#[derive(Debug, Clone)]
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    clock: ClockRef,
}

impl LeaderElector {
    pub fn new(
        api: Api<Lease>,
        lease_name: impl Into<String>,
        identity: impl Into<String>,
        lease_duration: Duration,
        clock: ClockRef,
    ) -> Self {
        Self {
            api,
            lease_name: lease_name.into(),
            identity: identity.into(),
            lease_duration,
            clock,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn renew_interval(&self) -> Duration {
        self.lease_duration / 3
    }

    fn is_expired(&self, spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
        let Some(renewed) = spec.renew_time.or(spec.acquire_time) else {
            return true;
        };
        i64::try_from(spec.lease_duration_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|duration| renewed.checked_add_signed(duration))
            .is_some_and(|expiry| expiry < now)
    }

    /// Takes or renews the lease. Returns whether this identity holds it
    /// afterwards. Losing a write race is not an error.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let now = self.clock.now();
        let lease_duration_seconds = self.lease_duration.as_secs();
        let Some(mut lease) = self.api.get_opt(&self.lease_name).await? else {
            let lease = Lease {
                metadata: ObjectMeta::named(&self.lease_name),
                spec: LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds,
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    lease_transitions: 0,
                },
            };
            return match self.api.create(&lease).await {
                Ok(_) => Ok(true),
                Err(err) if err.code == Code::AlreadyExists => Ok(false),
                Err(err) => Err(err),
            };
        };

        let held_by_us = lease.spec.holder_identity.as_deref() == Some(self.identity.as_str());
        if held_by_us {
            lease.spec.renew_time = Some(now);
            lease.spec.lease_duration_seconds = lease_duration_seconds;
        } else if lease.spec.holder_identity.is_none() || self.is_expired(&lease.spec, now) {
            info!(
                lease = %self.lease_name,
                previous = ?lease.spec.holder_identity,
                identity = %self.identity,
                "Taking over lease"
            );
            lease.spec = LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: lease.spec.lease_transitions.saturating_add(1),
            };
        } else {
            return Ok(false);
        }
        match self.api.update(&lease).await {
            Ok(_) => Ok(true),
            Err(err) if err.code == Code::Aborted => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Gives the lease up if held, so another replica can take over
    /// without waiting for it to expire.
    pub async fn release(&self) -> Result<(), Error> {
        let Some(mut lease) = self.api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        if lease.spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        lease.spec.holder_identity = None;
        lease.spec.renew_time = None;
        match self.api.update(&lease).await {
            Err(err) if err.code != Code::Aborted => Err(err),
            _ => Ok(()),
        }
    }

    /// Campaigns until `shutdown` fires. Each time leadership is won,
    /// `lead` is started with a token that is cancelled as soon as a
    /// renewal fails or `shutdown` fires.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, lead: F) -> Result<(), Error>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let interval = self.renew_interval();
        loop {
            // Campaign.
            loop {
                match self.try_acquire_or_renew().await {
                    Ok(true) => break,
                    Ok(false) => debug!(lease = %self.lease_name, "Lease held elsewhere"),
                    Err(err) => warn!(lease = %self.lease_name, ?err, "Lease campaign failed"),
                }
                tokio::select! {
                    () = shutdown.cancelled() => return Ok(()),
                    () = tokio::time::sleep(interval) => {}
                }
            }

            info!(lease = %self.lease_name, identity = %self.identity, "Acquired leadership");
            let leading = shutdown.child_token();
            let task = spawn!("leader", lead(leading.clone()), lease = %self.lease_name);

            // Renew.
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        leading.cancel();
                        drop(task.await);
                        return self.release().await;
                    }
                    () = tokio::time::sleep(interval) => {}
                }
                match self.try_acquire_or_renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(lease = %self.lease_name, "Lost leadership");
                        break;
                    }
                    Err(err) => {
                        warn!(
                            lease = %self.lease_name,
                            ?err,
                            "Lease renewal failed, stepping down"
                        );
                        break;
                    }
                }
            }
            leading.cancel();
            drop(task.await);
        }
    }
}
