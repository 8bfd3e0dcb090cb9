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

//! Spreads controller keys over the replicas of a StatefulSet.
//!
//! Replica `i` of `R` owns the keys whose FNV-1a hash is `i` modulo `R`.
//! Every replica watches the StatefulSet and follows changes to `R`; a
//! replica whose ordinal is not below `R` owns nothing.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gargantua_error::{Code, Error, ResultExt, make_input_err};
use gargantua_resources::StatefulSet;
use gargantua_store::{Api, FieldSelector, WatchEvent};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::EnqueueFilter;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv32a(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Ordinal of `identity` (`<statefulset>-<i>`) within `statefulset`.
pub fn parse_ordinal(identity: &str, statefulset: &str) -> Result<u32, Error> {
    identity
        .strip_prefix(statefulset)
        .and_then(|rest| rest.strip_prefix('-'))
        .ok_or_else(|| {
            make_input_err!("Identity '{identity}' is not a member of statefulset '{statefulset}'")
        })?
        .parse::<u32>()
        .err_tip(|| format!("Parsing ordinal of identity '{identity}'"))
}

/// Accepts the keys this replica owns for the current replica count.
#[derive(Debug)]
pub struct ShardFilter {
    ordinal: u32,
    replicas: AtomicU32,
}

impl ShardFilter {
    pub const fn new(ordinal: u32, replicas: u32) -> Self {
        Self {
            ordinal,
            replicas: AtomicU32::new(replicas),
        }
    }

    pub const fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn replicas(&self) -> u32 {
        self.replicas.load(Ordering::Acquire)
    }

    /// Returns the previous replica count.
    pub fn set_replicas(&self, replicas: u32) -> u32 {
        self.replicas.swap(replicas, Ordering::AcqRel)
    }

    pub fn owns(&self, key: &str) -> bool {
        let replicas = self.replicas();
        if self.ordinal >= replicas {
            return false;
        }
        fnv32a(key.as_bytes()) % replicas == self.ordinal
    }
}

impl EnqueueFilter for ShardFilter {
    fn accepts(&self, key: &str) -> bool {
        self.owns(key)
    }
}

/// Reads the StatefulSet once and returns a filter for `identity`.
pub async fn shard_filter(
    api: &Api<StatefulSet>,
    statefulset: &str,
    identity: &str,
) -> Result<Arc<ShardFilter>, Error> {
    let ordinal = parse_ordinal(identity, statefulset)?;
    let set = api
        .get(statefulset)
        .await
        .err_tip(|| format!("Reading statefulset {statefulset} for sharding"))?;
    info!(
        statefulset,
        ordinal,
        replicas = set.spec.replicas,
        "Sharding controllers"
    );
    Ok(Arc::new(ShardFilter::new(ordinal, set.spec.replicas)))
}

/// Keeps `filter` in step with the StatefulSet's replica count until
/// `shutdown` fires. Keys that move between replicas are picked up by the
/// next informer resync.
pub async fn watch_replicas(
    api: Api<StatefulSet>,
    statefulset: String,
    filter: Arc<ShardFilter>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    loop {
        let mut watcher = api.watch(FieldSelector::name(&statefulset));
        // Catch changes made before the watch started.
        if let Some(set) = api.get_opt(&statefulset).await? {
            apply_replicas(&filter, &statefulset, set.spec.replicas);
        }
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                event = watcher.next() => event,
            };
            match event {
                Some(Ok(WatchEvent::Added(set) | WatchEvent::Modified(set))) => {
                    apply_replicas(&filter, &statefulset, set.spec.replicas);
                }
                Some(Ok(WatchEvent::Deleted(_))) => {
                    warn!(%statefulset, "Statefulset deleted, keeping last replica count");
                }
                Some(Err(err)) if err.code == Code::OutOfRange => {
                    warn!(%statefulset, ?err, "Replica watch fell behind, restarting");
                    break;
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            }
        }
    }
}

fn apply_replicas(filter: &ShardFilter, statefulset: &str, replicas: u32) {
    let previous = filter.set_replicas(replicas);
    if previous != replicas {
        info!(
            statefulset,
            ordinal = filter.ordinal(),
            previous,
            replicas,
            "Replica count changed"
        );
    }
}
