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

use core::time::Duration;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use gargantua_controller::{
    LeaderElector, ShardFilter, fnv32a, parse_ordinal, shard_filter, watch_replicas,
};
use gargantua_error::{Code, Error};
use gargantua_macro::gargantua_test;
use gargantua_resources::substrate::StatefulSetSpec;
use gargantua_resources::{Lease, ObjectMeta, StatefulSet};
use gargantua_store::{Api, MemoryObjectStore, ObjectStore};
use gargantua_util::clock::{ClockRef, MockClock};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

#[test]
fn fnv32a_matches_reference_values() {
    assert_eq!(fnv32a(b""), 0x811c_9dc5);
    assert_eq!(fnv32a(b"a"), 0xe40c_292c);
    assert_eq!(fnv32a(b"foobar"), 0xbf9c_f968);
}

#[test]
fn ordinal_comes_from_identity_suffix() {
    assert_eq!(parse_ordinal("gargantua-2", "gargantua").unwrap(), 2);
    assert_eq!(
        parse_ordinal("other-2", "gargantua").unwrap_err().code,
        Code::InvalidArgument
    );
    assert_eq!(
        parse_ordinal("gargantua-x", "gargantua").unwrap_err().code,
        Code::InvalidArgument
    );
}

#[test]
fn every_key_has_exactly_one_owner() {
    let replicas: Vec<ShardFilter> = (0..3).map(|ordinal| ShardFilter::new(ordinal, 3)).collect();
    for i in 0..200 {
        let key = format!("hobbyfarm/vm-{i}");
        let owners = replicas.iter().filter(|shard| shard.owns(&key)).count();
        assert_eq!(owners, 1, "{key}");
    }
}

#[test]
fn ordinals_past_the_replica_count_own_nothing() {
    let shard = ShardFilter::new(2, 3);
    assert!((0..50).any(|i| shard.owns(&format!("hobbyfarm/vm-{i}"))));
    shard.set_replicas(2);
    assert!(!(0..50).any(|i| shard.owns(&format!("hobbyfarm/vm-{i}"))));
}

#[gargantua_test]
async fn replica_count_follows_the_statefulset() -> Result<(), Error> {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new("hobbyfarm"));
    let api: Api<StatefulSet> = Api::new(store);
    let set = api
        .create(&StatefulSet {
            metadata: ObjectMeta::named("gargantua"),
            spec: StatefulSetSpec { replicas: 2 },
        })
        .await?;

    let filter = shard_filter(&api, "gargantua", "gargantua-1").await?;
    assert_eq!(filter.replicas(), 2);

    let shutdown = CancellationToken::new();
    let watcher = tokio::spawn(watch_replicas(
        api.clone(),
        "gargantua".to_string(),
        filter.clone(),
        shutdown.clone(),
    ));
    let mut scaled = set;
    scaled.spec.replicas = 4;
    api.update(&scaled).await?;
    for _ in 0..100 {
        if filter.replicas() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(filter.replicas(), 4);

    shutdown.cancel();
    watcher.await??;
    Ok(())
}

#[gargantua_test]
async fn lease_is_exclusive_until_it_expires() -> Result<(), Error> {
    MockClock::set(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    let clock: ClockRef = Arc::new(MockClock);
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new("hobbyfarm"));
    let api: Api<Lease> = Api::new(store);
    let ttl = Duration::from_secs(15);
    let first = LeaderElector::new(api.clone(), "controllers", "gargantua-0", ttl, clock.clone());
    let second = LeaderElector::new(api.clone(), "controllers", "gargantua-1", ttl, clock);

    assert!(first.try_acquire_or_renew().await?);
    assert!(!second.try_acquire_or_renew().await?);

    MockClock::advance(Duration::from_secs(10));
    assert!(first.try_acquire_or_renew().await?);
    MockClock::advance(Duration::from_secs(10));
    assert!(!second.try_acquire_or_renew().await?, "renewed 10s ago");

    MockClock::advance(Duration::from_secs(16));
    assert!(second.try_acquire_or_renew().await?);
    assert!(!first.try_acquire_or_renew().await?);

    let lease = api.get("controllers").await?;
    assert_eq!(lease.spec.holder_identity.as_deref(), Some("gargantua-1"));
    assert_eq!(lease.spec.lease_transitions, 1);

    second.release().await?;
    assert!(first.try_acquire_or_renew().await?);
    Ok(())
}
