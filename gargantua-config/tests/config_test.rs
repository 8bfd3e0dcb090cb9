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

use std::collections::HashMap;

use gargantua_config::controllers::ControllerConfig;
use gargantua_config::gargantua::{
    AuthConfig, GargantuaConfig, GlobalConfig, StaticUserConfig, StoreConfig,
};
use gargantua_config::queues::{RateLimiterConfig, Retry};
use pretty_assertions::assert_eq;

#[test]
fn empty_config_uses_defaults() {
    let config: GargantuaConfig = serde_json5::from_str("{}").unwrap();
    assert_eq!(config.global.namespace, "hobbyfarm");
    assert_eq!(config.global.dynamic_base_name_prefix, "vmc");
    assert_eq!(config.global.scheduled_base_name_prefix, "scheduled");
    assert_eq!(config.retry, Retry::default());
    assert_eq!(config.retry.max_retries, 4);
    assert_eq!(config.rate_limiter, RateLimiterConfig::default());
    assert_eq!(config.rate_limiter.burst, 100);
    assert_eq!(config.leader_election.lease_duration_seconds, 15);
    assert_eq!(config.controllers.vm, ControllerConfig::default());
    assert_eq!(config.controllers.session_timers.default_keepalive_seconds, 300);
    assert_eq!(config.controllers.session_timers.default_pause_seconds, 7200);
    assert_eq!(config.gateway.auth, AuthConfig::AllowAll);
    assert_eq!(config.store, StoreConfig::Kubernetes);
}

#[test]
fn memory_store_is_selectable() {
    let config: GargantuaConfig = serde_json5::from_str(r#"{ store: "memory" }"#).unwrap();
    assert_eq!(config.store, StoreConfig::Memory);
    assert!(serde_json5::from_str::<GargantuaConfig>(r#"{ store: "etcd" }"#).is_err());
}

#[test]
fn json5_with_comments_and_shellexpand_defaults() {
    let config: GargantuaConfig = serde_json5::from_str(
        r#"{
            // Shell defaults apply when the variable is unset.
            global: {
                namespace: "${GARGANTUA_TEST_UNSET_NS:-labs}",
            },
            controllers: {
                vm: { workers: "${GARGANTUA_TEST_UNSET_WORKERS:-4}", sharded: true },
            },
            rate_limiter: { qps: "2.5", burst: 7 },
            gateway: {
                listen_address: "127.0.0.1:9000",
                auth: { static_tokens: [{ token: "t0k", user_id: "u1", admin: true }] },
            },
        }"#,
    )
    .unwrap();
    assert_eq!(config.global.namespace, "labs");
    assert_eq!(config.controllers.vm.workers, 4);
    assert!(config.controllers.vm.sharded);
    assert!(!config.controllers.session.sharded);
    assert!((config.rate_limiter.qps - 2.5).abs() < f64::EPSILON);
    assert_eq!(config.rate_limiter.burst, 7);
    assert_eq!(
        config.gateway.auth,
        AuthConfig::StaticTokens(vec![StaticUserConfig {
            token: "t0k".to_string(),
            user_id: "u1".to_string(),
            admin: true,
        }])
    );
}

#[test]
fn unknown_fields_are_rejected() {
    let result = serde_json5::from_str::<GargantuaConfig>("{ global: { namespcae: \"x\" } }");
    assert!(result.is_err(), "typo in field name must not be ignored");
}

#[test]
fn env_overlay_overrides_file_values() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("HF_NAMESPACE", "prod"),
        ("STATEFULSET_NAME", "gargantua"),
        ("POD_IDENTITY", "gargantua-2"),
        ("HOSTNAME", "ignored-host"),
        ("HF_BASENAME_DYNAMIC_PREFIX", "dyn"),
        ("HF_BASENAME_SCHEDULED_PREFIX", ""),
    ]);
    let mut global = GlobalConfig::default();
    global.apply_env_overlay(|key| env.get(key).map(ToString::to_string));
    assert_eq!(
        global,
        GlobalConfig {
            namespace: "prod".to_string(),
            statefulset_name: Some("gargantua".to_string()),
            pod_identity: Some("gargantua-2".to_string()),
            dynamic_base_name_prefix: "dyn".to_string(),
            scheduled_base_name_prefix: "scheduled".to_string(),
        }
    );
}

#[test]
fn pod_identity_falls_back_to_hostname() {
    let mut global = GlobalConfig::default();
    global.apply_env_overlay(|key| (key == "HOSTNAME").then(|| "gargantua-0".to_string()));
    assert_eq!(global.pod_identity.as_deref(), Some("gargantua-0"));
    assert_eq!(global.namespace, "hobbyfarm");
}

#[test]
fn bundled_example_parses() {
    let config: GargantuaConfig =
        serde_json5::from_str(include_str!("../examples/gargantua.json5")).unwrap();
    assert_eq!(config.controllers.vm.workers, 4);
    assert!(config.leader_election.enabled);
    assert_eq!(config.store, StoreConfig::Kubernetes);
    let AuthConfig::StaticTokens(users) = &config.gateway.auth else {
        panic!("expected static tokens, got {:?}", config.gateway.auth);
    };
    assert_eq!(users.len(), 2);
    assert!(users[0].admin);
    assert!(!users[1].admin);
}
