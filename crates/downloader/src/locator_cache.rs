// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Per-worker cache of resolved [`ResourceLocator`]s.
//!
//! A locator is only valid for the worker that resolved it, so entries are
//! keyed by `(worker, source)`. The cache holds at most `capacity` entries,
//! evicting the least recently used one, and drops entries idle for longer
//! than `ttl`. A background task runs the cache's pending maintenance every
//! `sweep_interval` so idle entries are released even without traffic.

use std::{sync::Arc, time::Duration};

use moka::{future::Cache, notification::RemovalCause, policy::EvictionPolicy};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    backend::{BlobBackend, ResourceLocator, SourceRef, Worker, WorkerId, WorkerIdentity},
    config::{LocatorCacheConfig, std_duration},
    error::RetryError,
    retry::RetryPolicy,
};

type Key = (WorkerId, SourceRef);

pub struct LocatorCache<B: BlobBackend> {
    backend: Arc<B>,
    policy:  RetryPolicy,
    cache:   Cache<Key, Arc<ResourceLocator>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<B: BlobBackend> LocatorCache<B> {
    /// Build a cache. The sweep is spawned on the current tokio runtime, if
    /// there is one, and stops when the cache is dropped.
    pub fn new(backend: Arc<B>, config: &LocatorCacheConfig, policy: RetryPolicy) -> Self {
        let cache = Cache::builder()
            .max_capacity(u64::try_from(config.capacity.max(1)).unwrap_or(u64::MAX))
            .eviction_policy(EvictionPolicy::lru())
            .time_to_idle(std_duration(config.ttl))
            .eviction_listener(|key: Arc<Key>, _, cause| {
                if cause != RemovalCause::Explicit {
                    debug!(worker = %key.0, source = %key.1, ?cause, "locator evicted");
                }
            })
            .build();

        let period = std_duration(config.sweep_interval).max(Duration::from_millis(1));
        let sweeper = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(sweep_loop(cache.clone(), period)));

        Self {
            backend,
            policy,
            cache,
            sweeper,
        }
    }

    /// Resolve `source` for `worker`, performing the backend lookup only on
    /// the first call per key. Concurrent first calls share one lookup, and a
    /// failed lookup leaves nothing behind.
    pub async fn resolve(
        &self,
        worker: &Worker,
        source: &SourceRef,
    ) -> Result<Arc<ResourceLocator>, RetryError> {
        self.cache
            .try_get_with((worker.id(), source.clone()), async {
                debug!(worker = %worker.id(), %source, "resolving locator");
                self.policy
                    .run(|| self.backend.resolve_locator(worker, source))
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(Arc::unwrap_or_clone)
    }

    pub async fn invalidate(&self, worker: WorkerId, source: &SourceRef) -> bool {
        self.cache.remove(&(worker, source.clone())).await.is_some()
    }

    /// Apply pending evictions now instead of waiting for the next sweep.
    pub async fn run_pending_tasks(&self) { self.cache.run_pending_tasks().await; }

    /// Number of cached locators as of the last maintenance run.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn len(&self) -> usize { self.cache.entry_count() as usize }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    #[must_use]
    pub fn contains(&self, worker: WorkerId, source: &SourceRef) -> bool {
        self.cache.contains_key(&(worker, source.clone()))
    }
}

impl<B: BlobBackend> Drop for LocatorCache<B> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

async fn sweep_loop(cache: Cache<Key, Arc<ResourceLocator>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        cache.run_pending_tasks().await;
    }
}
