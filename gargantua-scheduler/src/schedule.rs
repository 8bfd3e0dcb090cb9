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

//! How much of an environment scheduled events occupy over a period.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use gargantua_error::{Error, ResultExt};
use gargantua_resources::time::parse_unix_date;
use gargantua_resources::{Environment, ScheduledEvent};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodUsage {
    /// VMs held per template from each timestamp on, until the next one.
    pub timeline: BTreeMap<DateTime<Utc>, BTreeMap<String, u32>>,
    /// Peak per template across the whole period.
    pub max: BTreeMap<String, u32>,
}

struct Window<'a> {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    counts: &'a BTreeMap<String, u32>,
}

/// VMs that unfinished scheduled events require from `environment` between
/// `start` and `end` (unix dates). The period never starts in the past.
/// Events with unreadable times are skipped.
pub fn virtual_machines_used_during_period<'a>(
    events: impl IntoIterator<Item = &'a ScheduledEvent>,
    environment: &str,
    start: &str,
    end: &str,
    now: DateTime<Utc>,
) -> Result<PeriodUsage, Error> {
    let start = parse_unix_date(start)
        .err_tip(|| "Parsing period start")?
        .max(now);
    let end = parse_unix_date(end).err_tip(|| "Parsing period end")?;

    let mut windows = Vec::new();
    for event in events {
        if event.status.finished {
            continue;
        }
        let Some(counts) = event.spec.required_vms.get(environment) else {
            continue;
        };
        let parsed = parse_unix_date(&event.spec.start_time)
            .and_then(|s| Ok((s, parse_unix_date(&event.spec.end_time)?)));
        let (event_start, event_end) = match parsed {
            Ok(times) => times,
            Err(err) => {
                warn!(event = %event.metadata.name, ?err, "Skipping event with bad times");
                continue;
            }
        };
        if event_start <= end && event_end >= start {
            windows.push(Window {
                start: event_start,
                end: event_end,
                counts,
            });
        }
    }

    let changing: BTreeSet<DateTime<Utc>> = windows
        .iter()
        .flat_map(|window| [window.start, window.end])
        .collect();
    let mut usage = PeriodUsage::default();
    for timestamp in changing {
        let mut in_use: BTreeMap<String, u32> = BTreeMap::new();
        for window in windows
            .iter()
            .filter(|w| w.start <= timestamp && timestamp <= w.end)
        {
            for (template, count) in window.counts {
                *in_use.entry(template.clone()).or_default() += count;
            }
        }
        for (template, count) in &in_use {
            let peak = usage.max.entry(template.clone()).or_default();
            *peak = (*peak).max(*count);
        }
        usage.timeline.insert(timestamp, in_use);
    }
    Ok(usage)
}

/// Per-template capacity of `environment` left over after `usage`.
pub fn environment_available(
    environment: &Environment,
    usage: &PeriodUsage,
) -> BTreeMap<String, u32> {
    environment
        .spec
        .count_capacity
        .iter()
        .map(|(template, capacity)| {
            let used = usage.max.get(template).copied().unwrap_or(0);
            (template.clone(), capacity.saturating_sub(used))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, TimeZone, Utc};
    use gargantua_resources::environment::EnvironmentSpec;
    use gargantua_resources::session::ScheduledEventSpec;
    use gargantua_resources::time::format_unix_date;
    use gargantua_resources::{Environment, ObjectMeta, ScheduledEvent};
    use pretty_assertions::assert_eq;

    use super::{environment_available, virtual_machines_used_during_period};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
    }

    fn event(name: &str, from: u32, to: u32, count: u32) -> ScheduledEvent {
        ScheduledEvent {
            metadata: ObjectMeta::named(name),
            spec: ScheduledEventSpec {
                start_time: format_unix_date(at(from)),
                end_time: format_unix_date(at(to)),
                required_vms: BTreeMap::from([(
                    "env1".to_string(),
                    BTreeMap::from([("vmt1".to_string(), count)]),
                )]),
                ..ScheduledEventSpec::default()
            },
            ..ScheduledEvent::default()
        }
    }

    #[test]
    fn overlapping_events_add_up() {
        let events = [event("a", 1, 4, 2), event("b", 3, 6, 3), event("c", 10, 12, 9)];
        let usage = virtual_machines_used_during_period(
            &events,
            "env1",
            &format_unix_date(at(0)),
            &format_unix_date(at(8)),
            at(0),
        )
        .unwrap();
        assert_eq!(usage.max, BTreeMap::from([("vmt1".to_string(), 5)]));
        assert_eq!(usage.timeline.len(), 4);
        assert_eq!(usage.timeline[&at(6)]["vmt1"], 3);

        let environment = Environment {
            spec: EnvironmentSpec {
                count_capacity: BTreeMap::from([
                    ("vmt1".to_string(), 4),
                    ("vmt2".to_string(), 1),
                ]),
                ..EnvironmentSpec::default()
            },
            ..Environment::default()
        };
        assert_eq!(
            environment_available(&environment, &usage),
            BTreeMap::from([("vmt1".to_string(), 0), ("vmt2".to_string(), 1)])
        );
    }

    #[test]
    fn period_is_clamped_to_now() {
        let events = [event("past", 1, 2, 4)];
        let usage = virtual_machines_used_during_period(
            &events,
            "env1",
            &format_unix_date(at(0)),
            &format_unix_date(at(8)),
            at(3),
        )
        .unwrap();
        assert!(usage.max.is_empty());
    }
}
