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

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gargantua_error::{Code, Error, ResultExt, make_err};
use gargantua_resources::labels::SCHEDULED_EVENT;
use gargantua_resources::session::AccessCodeSpec;
use gargantua_resources::time::{format_unix_date, parse_unix_date};
use gargantua_resources::{AccessCode, ObjectMeta, ScheduledEvent};
use gargantua_store::Lister;

/// True once `expiration` has passed. Codes without one never expire.
pub fn is_expired(code: &AccessCode, now: DateTime<Utc>) -> Result<bool, Error> {
    if code.spec.expiration.trim().is_empty() {
        return Ok(false);
    }
    let expiration = parse_unix_date(&code.spec.expiration)
        .err_tip(|| format!("Reading expiration of access code {}", code.metadata.name))?;
    Ok(expiration <= now)
}

/// Looks `code` up, refusing unknown and expired codes with
/// `PermissionDenied`.
pub fn resolve_access_code(
    codes: &Lister<AccessCode>,
    code: &str,
    now: DateTime<Utc>,
) -> Result<Arc<AccessCode>, Error> {
    let access_code = match codes.get(code) {
        Ok(access_code) => access_code,
        Err(err) if err.code == Code::NotFound => {
            return Err(make_err!(
                Code::PermissionDenied,
                "Access code {code} is not valid"
            ));
        }
        Err(err) => return Err(err),
    };
    if is_expired(&access_code, now)? {
        return Err(make_err!(
            Code::PermissionDenied,
            "Access code {code} has expired"
        ));
    }
    Ok(access_code)
}

/// The scheduled event `code` grants access to.
pub fn scheduled_event_for(
    events: &Lister<ScheduledEvent>,
    code: &AccessCode,
) -> Result<Arc<ScheduledEvent>, Error> {
    let event = code
        .metadata
        .label(SCHEDULED_EVENT)
        .filter(|event| !event.is_empty())
        .ok_or_else(|| {
            make_err!(
                Code::PermissionDenied,
                "Access code {} does not belong to a scheduled event",
                code.metadata.name
            )
        })?;
    match events.get(event) {
        Err(err) if err.code == Code::NotFound => Err(make_err!(
            Code::PermissionDenied,
            "Scheduled event {event} of access code {} no longer exists",
            code.metadata.name
        )),
        result => result,
    }
}

/// The access code `event` hands out: named after the code, expiring with
/// the event.
pub fn access_code_for_event(event: &ScheduledEvent) -> AccessCode {
    let (restricted_bind, restricted_bind_value) = event.bind_restriction();
    AccessCode {
        metadata: ObjectMeta::named(event.spec.access_code.as_str())
            .with_label(SCHEDULED_EVENT, event.metadata.name.as_str())
            .owned_by(event),
        spec: AccessCodeSpec {
            code: event.spec.access_code.clone(),
            description: event.spec.description.clone(),
            scenarios: event.spec.scenarios.clone(),
            courses: event.spec.courses.clone(),
            expiration: event.spec.end_time.clone(),
            restricted_bind,
            restricted_bind_value,
        },
    }
}

/// `expiration` value that expires a code at `now`.
pub fn expire_at(now: DateTime<Utc>) -> String {
    format_unix_date(now)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use gargantua_resources::AccessCode;
    use gargantua_resources::time::format_unix_date;

    use super::is_expired;

    #[test]
    fn expiry() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut code = AccessCode::default();
        assert!(!is_expired(&code, now).unwrap());

        code.spec.expiration = format_unix_date(now + chrono::TimeDelta::minutes(1));
        assert!(!is_expired(&code, now).unwrap());

        code.spec.expiration = format_unix_date(now);
        assert!(is_expired(&code, now).unwrap());

        code.spec.expiration = "next week".to_string();
        assert!(is_expired(&code, now).is_err());
    }
}
