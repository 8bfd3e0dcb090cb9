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

use core::fmt::Debug;

use gargantua_error::{Error, ResultExt};
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub mod content;
pub mod conversion;
pub mod environment;
pub mod labels;
pub mod meta;
pub mod session;
pub mod substrate;
pub mod terraform;
pub mod time;
pub mod vm;

pub use content::{Course, Scenario, User};
pub use environment::{Environment, VirtualMachineTemplate};
pub use meta::{ObjectMeta, OwnerReference};
pub use session::{AccessCode, DynamicBindConfig, Progress, ScheduledEvent, Session};
pub use substrate::{ConfigMap, Lease, Secret, StatefulSet};
pub use terraform::{TfExecution, TfState};
pub use vm::{VirtualMachine, VirtualMachineClaim, VirtualMachineSet, VmStatus};

pub const GROUP: &str = "hobbyfarm.io";
pub const TERRAFORM_GROUP: &str = "terraformcontroller.cattle.io";

/// A persisted kind. Every resource is a JSON document with a `metadata`
/// section; kinds with a `status` section have it written separately from
/// the rest of the document.
pub trait Resource:
    Clone
    + Debug
    + Default
    + PartialEq
    + Serialize
    + DeserializeOwned
    + JsonSchema
    + Send
    + Sync
    + 'static
{
    const KIND: &'static str;
    /// Empty for the core group.
    const GROUP: &'static str;
    const VERSION: &'static str;
    const PLURAL: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn api_version() -> String {
        if Self::GROUP.is_empty() {
            Self::VERSION.to_string()
        } else {
            format!("{}/{}", Self::GROUP, Self::VERSION)
        }
    }

    fn name(&self) -> &str {
        &self.meta().name
    }
}

macro_rules! resource {
    ($ty:ty, $group:expr, $version:literal, $kind:literal, $plural:literal) => {
        impl Resource for $ty {
            const KIND: &'static str = $kind;
            const GROUP: &'static str = $group;
            const VERSION: &'static str = $version;
            const PLURAL: &'static str = $plural;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

resource!(Environment, GROUP, "v1", "Environment", "environments");
resource!(
    VirtualMachineTemplate,
    GROUP,
    "v1",
    "VirtualMachineTemplate",
    "virtualmachinetemplates"
);
resource!(VirtualMachine, GROUP, "v1", "VirtualMachine", "virtualmachines");
resource!(VirtualMachineSet, GROUP, "v1", "VirtualMachineSet", "virtualmachinesets");
resource!(
    VirtualMachineClaim,
    GROUP,
    "v1",
    "VirtualMachineClaim",
    "virtualmachineclaims"
);
resource!(Session, GROUP, "v1", "Session", "sessions");
resource!(Progress, GROUP, "v1", "Progress", "progresses");
resource!(AccessCode, GROUP, "v1", "AccessCode", "accesscodes");
resource!(ScheduledEvent, GROUP, "v1", "ScheduledEvent", "scheduledevents");
resource!(DynamicBindConfig, GROUP, "v1", "DynamicBindConfig", "dynamicbindconfigs");
resource!(Course, GROUP, "v1", "Course", "courses");
resource!(Scenario, GROUP, "v2", "Scenario", "scenarios");
resource!(User, GROUP, "v2", "User", "users");
resource!(TfState, TERRAFORM_GROUP, "v1", "State", "states");
resource!(TfExecution, TERRAFORM_GROUP, "v1", "Execution", "executions");
resource!(ConfigMap, "", "v1", "ConfigMap", "configmaps");
resource!(Secret, "", "v1", "Secret", "secrets");
resource!(StatefulSet, "apps", "v1", "StatefulSet", "statefulsets");
resource!(Lease, "coordination.k8s.io", "v1", "Lease", "leases");

/// JSON schema of `K`'s document.
pub fn schema_of<K: Resource>() -> Result<serde_json::Value, Error> {
    serde_json::to_value(schemars::schema_for!(K))
        .err_tip(|| format!("serializing schema of {}", K::KIND))
}

/// Schema files for every kind in the `hobbyfarm.io` group, keyed by file
/// name (`<plural>.hobbyfarm.io.json`).
pub fn hobbyfarm_schemas() -> Result<Vec<(String, serde_json::Value)>, Error> {
    fn entry<K: Resource>() -> Result<(String, serde_json::Value), Error> {
        Ok((format!("{}.{}.json", K::PLURAL, K::GROUP), schema_of::<K>()?))
    }
    Ok(vec![
        entry::<AccessCode>()?,
        entry::<Course>()?,
        entry::<DynamicBindConfig>()?,
        entry::<Environment>()?,
        entry::<Progress>()?,
        entry::<Scenario>()?,
        entry::<ScheduledEvent>()?,
        entry::<Session>()?,
        entry::<User>()?,
        entry::<VirtualMachine>()?,
        entry::<VirtualMachineClaim>()?,
        entry::<VirtualMachineSet>()?,
        entry::<VirtualMachineTemplate>()?,
    ])
}

/// Where a kind lives on the API server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindInfo {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl KindInfo {
    pub const fn of<K: Resource>() -> Self {
        Self {
            group: K::GROUP,
            version: K::VERSION,
            kind: K::KIND,
            plural: K::PLURAL,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Every kind the controllers and the gateway read or write.
pub const ALL_KINDS: [KindInfo; 19] = [
    KindInfo::of::<AccessCode>(),
    KindInfo::of::<ConfigMap>(),
    KindInfo::of::<Course>(),
    KindInfo::of::<DynamicBindConfig>(),
    KindInfo::of::<Environment>(),
    KindInfo::of::<Lease>(),
    KindInfo::of::<Progress>(),
    KindInfo::of::<Scenario>(),
    KindInfo::of::<ScheduledEvent>(),
    KindInfo::of::<Secret>(),
    KindInfo::of::<Session>(),
    KindInfo::of::<StatefulSet>(),
    KindInfo::of::<TfExecution>(),
    KindInfo::of::<TfState>(),
    KindInfo::of::<User>(),
    KindInfo::of::<VirtualMachine>(),
    KindInfo::of::<VirtualMachineClaim>(),
    KindInfo::of::<VirtualMachineSet>(),
    KindInfo::of::<VirtualMachineTemplate>(),
];

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;

    use super::{ALL_KINDS, KindInfo, Lease, Secret, TfState};

    #[test]
    fn plurals_are_unique() {
        let plurals: BTreeSet<&str> = ALL_KINDS.iter().map(|info| info.plural).collect();
        assert_eq!(plurals.len(), ALL_KINDS.len());
    }

    #[test]
    fn core_kinds_have_a_bare_version() {
        assert_eq!(KindInfo::of::<Secret>().api_version(), "v1");
        assert_eq!(KindInfo::of::<Lease>().api_version(), "coordination.k8s.io/v1");
        assert_eq!(
            KindInfo::of::<TfState>().api_version(),
            "terraformcontroller.cattle.io/v1"
        );
    }
}
