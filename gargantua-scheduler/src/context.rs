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
use gargantua_config::gargantua::GargantuaConfig;
use gargantua_resources::{
    AccessCode, Course, DynamicBindConfig, Environment, Resource, Scenario, ScheduledEvent,
    Session, TfExecution, TfState, VirtualMachine, VirtualMachineClaim, VirtualMachineSet,
    VirtualMachineTemplate,
};
use gargantua_store::{Api, InformerFactory, Lister};
use gargantua_util::clock::ClockRef;
use gargantua_util::retry::Retrier;

/// Shared by every reconciler and the session manager: the informer caches,
/// the resolved configuration, the conflict retrier and the clock.
#[derive(Clone, Debug)]
pub struct SchedulerContext {
    factory: Arc<InformerFactory>,
    config: Arc<GargantuaConfig>,
    retrier: Retrier,
    clock: ClockRef,
}

impl SchedulerContext {
    /// Registers an informer for every kind the scheduler reads from cache.
    /// Informers requested after `InformerFactory::start` never run, so this
    /// must happen first.
    pub fn new(
        factory: Arc<InformerFactory>,
        config: Arc<GargantuaConfig>,
        clock: ClockRef,
    ) -> Self {
        factory.informer::<AccessCode>();
        factory.informer::<Course>();
        factory.informer::<DynamicBindConfig>();
        factory.informer::<Environment>();
        factory.informer::<Scenario>();
        factory.informer::<ScheduledEvent>();
        factory.informer::<Session>();
        factory.informer::<TfExecution>();
        factory.informer::<TfState>();
        factory.informer::<VirtualMachine>();
        factory.informer::<VirtualMachineClaim>();
        factory.informer::<VirtualMachineSet>();
        factory.informer::<VirtualMachineTemplate>();
        let retrier = Retrier::from_config(config.retry.clone());
        Self {
            factory,
            config,
            retrier,
            clock,
        }
    }

    pub const fn factory(&self) -> &Arc<InformerFactory> {
        &self.factory
    }

    pub fn config(&self) -> &GargantuaConfig {
        &self.config
    }

    pub const fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    pub fn clock(&self) -> &ClockRef {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn namespace(&self) -> &str {
        self.factory.store().namespace()
    }

    pub fn api<K: Resource>(&self) -> Api<K> {
        self.factory.api()
    }

    pub fn lister<K: Resource>(&self) -> Lister<K> {
        self.factory.lister()
    }
}
