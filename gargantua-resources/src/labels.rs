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

//! Label, annotation and finalizer keys shared by the controllers.

pub const ACCESS_CODE: &str = "accesscode";
pub const BOUND: &str = "bound";
pub const DYNAMIC: &str = "dynamic";
pub const ENVIRONMENT: &str = "environment";
pub const FINISHED: &str = "finished";
pub const RESTRICTED_BIND: &str = "restrictedbind";
pub const RESTRICTED_BIND_VALUE: &str = "restrictedbindvalue";
pub const SCHEDULED_EVENT: &str = "scheduledevent";
pub const SESSION: &str = "session";
pub const TEMPLATE: &str = "template";
pub const TF_STATE: &str = "state";
pub const USER: &str = "user";
pub const VM_CLAIM: &str = "vmc";
pub const VM_SET: &str = "vmset";

/// Label on VMs, annotation on environments. When set, an external
/// provisioner owns the VM's infrastructure.
pub const PROVISIONER: &str = "hobbyfarm.io/provisioner";

pub const VM_CONTROLLER_FINALIZER: &str = "vm.controllers.hobbyfarm.io";
pub const VM_SET_FINALIZER: &str = "vmset.controllers.hobbyfarm.io";

/// Label values are strings; booleans are spelled like this.
pub const fn bool_value(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}
