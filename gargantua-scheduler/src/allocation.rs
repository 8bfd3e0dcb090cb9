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

//! Placement of on-demand VMs across the environments a scheduled event
//! may burst into.
//!
//! Two limits apply to every `(environment, template)`: the environment's
//! static `countCapacity`, shared by everybody, and the burst capacity the
//! event's bind config grants in that environment. A request first tries to
//! land entirely in one environment; failing that, VMs are placed one at a
//! time, reserving capacity as they go.

use std::collections::{BTreeMap, HashMap};

use gargantua_error::{Code, Error, make_err};

/// What one environment looks like to a single allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentCapacity {
    pub environment: String,
    /// Static capacity per template.
    pub capacity: BTreeMap<String, u32>,
    /// Live VMs per template, whoever they belong to.
    pub existing: BTreeMap<String, u32>,
    /// Live VMs per template belonging to the requesting event.
    pub existing_for_event: BTreeMap<String, u32>,
    /// Burst capacity per template, one entry per bind config of the event
    /// targeting this environment, keyed by the config's name.
    pub burst: Vec<(String, BTreeMap<String, u32>)>,
}

fn count(map: &BTreeMap<String, u32>, template: &str) -> i64 {
    i64::from(map.get(template).copied().unwrap_or(0))
}

/// Where one requested VM goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub environment: String,
    pub bind_config: String,
}

/// Places every `(slot, template)` of `requests`. Fails with
/// `ResourceExhausted` when some VM fits nowhere.
pub fn plan_dynamic(
    requests: &[(String, String)],
    environments: &[EnvironmentCapacity],
) -> Result<BTreeMap<String, Placement>, Error> {
    let mut required: BTreeMap<&str, i64> = BTreeMap::new();
    for (_, template) in requests {
        *required.entry(template.as_str()).or_default() += 1;
    }

    for env in environments {
        for (bind_config, burst) in &env.burst {
            let fits = required.iter().all(|(template, required)| {
                *required < count(burst, template) - count(&env.existing_for_event, template)
                    && *required < count(&env.capacity, template) - count(&env.existing, template)
            });
            if fits {
                let placement = Placement {
                    environment: env.environment.clone(),
                    bind_config: bind_config.clone(),
                };
                return Ok(requests
                    .iter()
                    .map(|(slot, _)| (slot.clone(), placement.clone()))
                    .collect());
            }
        }
    }

    let mut reserved: HashMap<(&str, &str), i64> = HashMap::new();
    let mut plan = BTreeMap::new();
    for (slot, template) in requests {
        let chosen = environments.iter().find_map(|env| {
            let reserved_here = reserved
                .get(&(env.environment.as_str(), template.as_str()))
                .copied()
                .unwrap_or(0);
            if count(&env.existing, template) + reserved_here >= count(&env.capacity, template) {
                return None;
            }
            env.burst
                .iter()
                .find(|(_, burst)| {
                    count(burst, template)
                        > count(&env.existing_for_event, template) + reserved_here
                })
                .map(|(bind_config, _)| (env, bind_config))
        });
        let Some((env, bind_config)) = chosen else {
            return Err(make_err!(
                Code::ResourceExhausted,
                "No environment has capacity for another vm of template {template}"
            ));
        };
        *reserved
            .entry((env.environment.as_str(), template.as_str()))
            .or_default() += 1;
        plan.insert(
            slot.clone(),
            Placement {
                environment: env.environment.clone(),
                bind_config: bind_config.clone(),
            },
        );
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use gargantua_error::Code;
    use pretty_assertions::assert_eq;

    use super::{EnvironmentCapacity, plan_dynamic};

    fn counts(template: &str, n: u32) -> BTreeMap<String, u32> {
        BTreeMap::from([(template.to_string(), n)])
    }

    fn env(name: &str, capacity: u32, burst: u32) -> EnvironmentCapacity {
        EnvironmentCapacity {
            environment: name.to_string(),
            capacity: counts("vmt1", capacity),
            burst: vec![(format!("se-{name}"), counts("vmt1", burst))],
            ..EnvironmentCapacity::default()
        }
    }

    fn requests(n: usize) -> Vec<(String, String)> {
        (0..n)
            .map(|i| (format!("vm{i}"), "vmt1".to_string()))
            .collect()
    }

    fn environments_of(plan: &BTreeMap<String, super::Placement>) -> Vec<&str> {
        plan.values().map(|p| p.environment.as_str()).collect()
    }

    #[test]
    fn fits_in_one_environment() {
        let plan = plan_dynamic(&requests(2), &[env("env2", 5, 5)]).unwrap();
        assert_eq!(environments_of(&plan), vec!["env2", "env2"]);
    }

    #[test]
    fn splits_when_no_environment_fits_everything() {
        let plan = plan_dynamic(&requests(2), &[env("env2", 1, 1), env("env3", 1, 1)]).unwrap();
        assert_eq!(environments_of(&plan), vec!["env2", "env3"]);
    }

    #[test]
    fn existing_vms_count_against_both_limits() {
        let mut busy = env("env2", 2, 5);
        busy.existing = counts("vmt1", 2);
        let mut bursting = env("env3", 5, 2);
        bursting.existing_for_event = counts("vmt1", 1);
        let plan = plan_dynamic(&requests(1), &[busy.clone(), bursting.clone()]).unwrap();
        assert_eq!(environments_of(&plan), vec!["env3"]);

        let err = plan_dynamic(&requests(2), &[busy, bursting]).unwrap_err();
        assert_eq!(err.code, Code::ResourceExhausted);
    }

    #[test]
    fn exact_fit_uses_the_fallback() {
        // The single-environment check is strict, so an exact fit is only
        // found one VM at a time.
        let plan = plan_dynamic(&requests(2), &[env("env2", 2, 2)]).unwrap();
        assert_eq!(environments_of(&plan), vec!["env2", "env2"]);
        assert!(plan_dynamic(&requests(3), &[env("env2", 2, 2)]).is_err());
    }
}
