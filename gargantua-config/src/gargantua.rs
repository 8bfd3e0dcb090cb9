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

use serde::{Deserialize, Serialize};

use crate::controllers::ControllersConfig;
use crate::queues::{RateLimiterConfig, Retry};
use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_string_with_shellexpand,
    convert_string_with_shellexpand,
};

pub const DEFAULT_NAMESPACE: &str = "hobbyfarm";
pub const DEFAULT_DYNAMIC_BASE_NAME_PREFIX: &str = "vmc";
pub const DEFAULT_SCHEDULED_BASE_NAME_PREFIX: &str = "scheduled";
pub const DEFAULT_LEASE_NAME: &str = "gargantua-controllers";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";

/// Process-wide settings that every controller needs to agree on.
/// Resolved once at startup and never mutated afterwards.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Logical namespace every object lives in.
    ///
    /// Default: "hobbyfarm"
    #[serde(
        default = "default_namespace",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub namespace: String,

    /// Name of the StatefulSet this process is a replica of. Only needed
    /// when at least one controller runs sharded.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub statefulset_name: Option<String>,

    /// Identity of this replica, usually `<statefulset>-<ordinal>`. Used as
    /// the lease holder identity and for shard assignment.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub pod_identity: Option<String>,

    /// Prefix for names of VMs created on demand.
    ///
    /// Default: "vmc"
    #[serde(
        default = "default_dynamic_prefix",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub dynamic_base_name_prefix: String,

    /// Prefix for names of VM sets created for scheduled events.
    ///
    /// Default: "scheduled"
    #[serde(
        default = "default_scheduled_prefix",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub scheduled_base_name_prefix: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_dynamic_prefix() -> String {
    DEFAULT_DYNAMIC_BASE_NAME_PREFIX.to_string()
}

fn default_scheduled_prefix() -> String {
    DEFAULT_SCHEDULED_BASE_NAME_PREFIX.to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            statefulset_name: None,
            pod_identity: None,
            dynamic_base_name_prefix: default_dynamic_prefix(),
            scheduled_base_name_prefix: default_scheduled_prefix(),
        }
    }
}

impl GlobalConfig {
    /// Applies the deployment environment on top of the file configuration.
    /// Variables that are unset or empty leave the file value in place.
    /// `POD_IDENTITY` falls back to `HOSTNAME`.
    pub fn apply_env_overlay<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.is_empty());
        if let Some(namespace) = lookup("HF_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Some(statefulset_name) = lookup("STATEFULSET_NAME") {
            self.statefulset_name = Some(statefulset_name);
        }
        if let Some(identity) = lookup("POD_IDENTITY").or_else(|| {
            self.pod_identity
                .is_none()
                .then(|| lookup("HOSTNAME"))
                .flatten()
        }) {
            self.pod_identity = Some(identity);
        }
        if let Some(prefix) = lookup("HF_BASENAME_DYNAMIC_PREFIX") {
            self.dynamic_base_name_prefix = prefix;
        }
        if let Some(prefix) = lookup("HF_BASENAME_SCHEDULED_PREFIX") {
            self.scheduled_base_name_prefix = prefix;
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LeaderElectionConfig {
    /// Controllers that are not sharded only run on the replica holding
    /// this lease.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default: "gargantua-controllers"
    #[serde(
        default = "default_lease_name",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub lease_name: String,

    /// Seconds a lease stays valid without renewal. Renewals happen every
    /// third of this.
    ///
    /// Default: 15
    #[serde(
        default = "default_lease_duration_seconds",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub lease_duration_seconds: u64,
}

const fn default_true() -> bool {
    true
}

fn default_lease_name() -> String {
    DEFAULT_LEASE_NAME.to_string()
}

const fn default_lease_duration_seconds() -> u64 {
    15
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_name: default_lease_name(),
            lease_duration_seconds: default_lease_duration_seconds(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StaticUserConfig {
    /// Bearer token presented by the client.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub token: String,

    /// Id of the user the token authenticates as.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub user_id: String,

    /// Admins pass every RBAC check on the `/a/*` routes.
    #[serde(default)]
    pub admin: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthConfig {
    /// Every request is authenticated as an admin. Development only.
    #[default]
    AllowAll,

    /// A fixed table of bearer tokens.
    StaticTokens(Vec<StaticUserConfig>),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Address the HTTP gateway binds to. Leave empty to disable it.
    ///
    /// Default: "0.0.0.0:8080"
    #[serde(
        default = "default_listen_address",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub listen_address: String,

    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            auth: AuthConfig::default(),
        }
    }
}

/// Backend holding every object.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    /// The Kubernetes API server, found through the in-cluster service
    /// account or the local kubeconfig.
    #[default]
    Kubernetes,

    /// Objects live in process memory and are gone on restart. Sharded
    /// controllers cannot run on it, since it holds no StatefulSet.
    Memory,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GargantuaConfig {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub controllers: ControllersConfig,

    /// Retry policy for fetch-mutate-update loops hitting version conflicts.
    #[serde(default)]
    pub retry: Retry,

    /// Backoff applied when a reconcile fails and its key is requeued.
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default)]
    pub leader_election: LeaderElectionConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Default: kubernetes
    #[serde(default)]
    pub store: StoreConfig,
}
