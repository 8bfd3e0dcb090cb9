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

//! The VM lab scheduler: reconcilers for VMs, VM sets, claims, sessions and
//! scheduled events, plus the session manager the gateway drives.

pub mod access_code;
pub mod allocation;
pub mod context;
pub mod cost;
pub mod keypair;
pub mod manager;
pub mod schedule;
pub mod scheduled_event_controller;
pub mod session_controller;
pub mod session_manager;
pub mod terraform;
pub mod vm_claim_controller;
pub mod vm_controller;
pub mod vm_factory;
pub mod vm_set_controller;

pub use context::SchedulerContext;
pub use keypair::{KeyPair, KeyPairGenerator, RsaKeyPairGenerator};
pub use manager::{ControllerHandles, Scheduler};
pub use session_manager::{NewSession, SessionManager, StartedSession};
