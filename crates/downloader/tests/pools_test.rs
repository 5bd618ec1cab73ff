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

mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{FakeBackend, fast_config, files_in, reference, workers};
use jiff::SignedDuration;
use shardfetch_downloader::{
    BackendError, DatacenterId, DownloadError, DownloadOutcome, DownloadRequest, Downloader, LocatorCacheConfig,
    SessionError, SourceRef, Stage, Worker, WorkerId, WorkerIdentity, locator_cache::LocatorCache, retry::RetryPolicy,
    session_pool::SessionPool,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const HOME: DatacenterId = DatacenterId(1);
const BLOB_DC: DatacenterId = DatacenterId(4);

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts:      3,
        backoff_step:      Duration::from_millis(1),
        timeout:           Duration::from_secs(5),
        rate_limit_margin: Duration::ZERO,
    }
}

fn cache(backend: Arc<FakeBackend>, capacity: usize) -> LocatorCache<FakeBackend> {
    let config = LocatorCacheConfig {
        capacity,
        ttl: SignedDuration::from_mins(2),
        sweep_interval: SignedDuration::from_mins(1),
    };
    LocatorCache::new(backend, &config, policy())
}

#[tokio::test]
async fn test_locator_cache_returns_shared_value() {
    let backend = Arc::new(FakeBackend::new(10, BLOB_DC).with_resolve_delay(Duration::from_millis(20)));
    let cache = Arc::new(cache(backend.clone(), 10));
    let worker = Worker::new(WorkerId(0), "bot0", HOME);
    let source = SourceRef::from("dc4/a");

    let (a, b) = tokio::join!(cache.resolve(&worker, &source), cache.resolve(&worker, &source));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.datacenter, BLOB_DC);
    assert_eq!(FakeBackend::count(&backend.resolve_calls), 1);

    // another worker gets its own locator
    let other = Worker::new(WorkerId(1), "bot1", HOME);
    let c = cache.resolve(&other, &source).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(FakeBackend::count(&backend.resolve_calls), 2);
}

#[tokio::test]
async fn test_locator_cache_evicts_least_recently_used() {
    let backend = Arc::new(FakeBackend::new(10, BLOB_DC));
    let cache = cache(backend.clone(), 2);
    let worker = Worker::new(WorkerId(0), "bot0", HOME);
    let (a, b, c) = (SourceRef::from("a"), SourceRef::from("b"), SourceRef::from("c"));

    for source in [&a, &b, &a, &c] {
        // touching `a` again leaves `b` as the least recently used
        cache.resolve(&worker, source).await.unwrap();
        cache.run_pending_tasks().await;
    }

    assert_eq!(cache.len(), 2);
    assert!(cache.contains(worker.id(), &a));
    assert!(!cache.contains(worker.id(), &b));
    assert!(cache.contains(worker.id(), &c));
    assert_eq!(FakeBackend::count(&backend.resolve_calls), 3);
}

#[tokio::test]
async fn test_locator_cache_sweeps_idle_entries() {
    let backend = Arc::new(FakeBackend::new(10, BLOB_DC));
    let config = LocatorCacheConfig {
        capacity:       10,
        ttl:            SignedDuration::from_millis(300),
        sweep_interval: SignedDuration::from_millis(20),
    };
    let cache = LocatorCache::new(backend.clone(), &config, policy());
    let worker = Worker::new(WorkerId(0), "bot0", HOME);
    let source = SourceRef::from("a");

    cache.resolve(&worker, &source).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.resolve(&worker, &source).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.resolve(&worker, &source).await.unwrap();
    assert_eq!(FakeBackend::count(&backend.resolve_calls), 1);

    // no explicit maintenance: the background sweep releases the idle entry
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!cache.contains(worker.id(), &source));
    assert!(cache.is_empty());

    cache.resolve(&worker, &source).await.unwrap();
    assert_eq!(FakeBackend::count(&backend.resolve_calls), 2);
}

#[tokio::test]
async fn test_locator_cache_keeps_nothing_on_failure() {
    let backend = Arc::new(FakeBackend::new(10, BLOB_DC).with_resolve_errors(vec![
        BackendError::transient("reset"),
        BackendError::transient("reset"),
        BackendError::transient("reset"),
    ]));
    let cache = cache(backend.clone(), 10);
    let worker = Worker::new(WorkerId(0), "bot0", HOME);
    let source = SourceRef::from("a");

    let err = cache.resolve(&worker, &source).await.unwrap_err();
    assert_eq!(err.attempts, 3);
    cache.run_pending_tasks().await;
    assert!(cache.is_empty());

    cache.resolve(&worker, &source).await.unwrap();
    assert_eq!(FakeBackend::count(&backend.resolve_calls), 4);
}

#[tokio::test]
async fn test_locator_cache_invalidate() {
    let backend = Arc::new(FakeBackend::new(10, BLOB_DC));
    let cache = cache(backend.clone(), 10);
    let worker = Worker::new(WorkerId(3), "bot3", HOME);
    let source = SourceRef::from("a");

    cache.resolve(&worker, &source).await.unwrap();
    assert!(cache.invalidate(worker.id(), &source).await);
    assert!(!cache.invalidate(worker.id(), &source).await);
    cache.resolve(&worker, &source).await.unwrap();
    assert_eq!(FakeBackend::count(&backend.resolve_calls), 2);
}

#[tokio::test]
async fn test_session_pool_reuses_sessions() {
    let backend = Arc::new(FakeBackend::new(10, HOME));
    let pool = SessionPool::new(backend.clone(), &fast_config(1));
    let worker = Worker::new(WorkerId(0), "bot0", HOME);

    let (a, b) = tokio::join!(pool.acquire(&worker, HOME), pool.acquire(&worker, HOME));
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(FakeBackend::count(&backend.open_calls), 1);
    assert_eq!(pool.len(), 1);

    pool.invalidate(worker.id(), HOME).await;
    assert!(pool.is_empty());
    assert_eq!(FakeBackend::count(&backend.close_calls), 1);

    pool.acquire(&worker, HOME).await.unwrap();
    assert_eq!(FakeBackend::count(&backend.open_calls), 2);

    pool.close_all().await;
    assert!(pool.is_empty());
    assert_eq!(FakeBackend::count(&backend.close_calls), 2);
}

#[tokio::test]
async fn test_foreign_datacenter_handshake_retries() {
    let backend = Arc::new(FakeBackend::new(10, BLOB_DC).with_import_failures(3));
    let pool = SessionPool::new(backend.clone(), &fast_config(1));
    let worker = Worker::new(WorkerId(0), "bot0", HOME);

    pool.acquire(&worker, BLOB_DC).await.unwrap();

    assert_eq!(FakeBackend::count(&backend.fresh_opens), 1);
    assert_eq!(FakeBackend::count(&backend.export_calls), 4);
    assert_eq!(FakeBackend::count(&backend.import_calls), 4);
    assert_eq!(FakeBackend::count(&backend.close_calls), 0);
}

#[tokio::test]
async fn test_handshake_exhaustion_closes_session() {
    let backend = Arc::new(FakeBackend::new(10, BLOB_DC).with_import_failures(100));
    let pool = SessionPool::new(backend.clone(), &fast_config(1));
    let worker = Worker::new(WorkerId(0), "bot0", HOME);

    let err = pool.acquire(&worker, BLOB_DC).await.unwrap_err();

    assert!(matches!(err, SessionError::Handshake { attempts: 6, .. }), "{err}");
    assert_eq!(FakeBackend::count(&backend.import_calls), 6);
    assert_eq!(FakeBackend::count(&backend.close_calls), 1);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_abandoned_handshake_closes_session() {
    let backend = Arc::new(FakeBackend::new(10, BLOB_DC).with_import_delay(Duration::from_millis(200)));
    let pool = SessionPool::new(backend.clone(), &fast_config(1));
    let worker = Worker::new(WorkerId(0), "bot0", HOME);

    let acquire = pool.acquire(&worker, BLOB_DC);
    assert!(tokio::time::timeout(Duration::from_millis(50), acquire).await.is_err());
    assert_eq!(FakeBackend::count(&backend.import_calls), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(FakeBackend::count(&backend.close_calls), 1);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_handshake_waits_out_rate_limit() {
    let backend = Arc::new(
        FakeBackend::new(10, BLOB_DC).with_import_errors(vec![BackendError::rate_limited(Duration::from_millis(150))]),
    );
    let pool = SessionPool::new(backend.clone(), &fast_config(1));
    let worker = Worker::new(WorkerId(0), "bot0", HOME);

    let started = Instant::now();
    pool.acquire(&worker, BLOB_DC).await.unwrap();

    // requested wait plus the 10ms margin, not the 10ms handshake delay
    assert!(started.elapsed() >= Duration::from_millis(160), "{:?}", started.elapsed());
    assert_eq!(FakeBackend::count(&backend.import_calls), 2);
    assert_eq!(FakeBackend::count(&backend.close_calls), 0);
}

#[tokio::test]
async fn test_download_from_foreign_datacenter() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::new(64, BLOB_DC).with_import_failures(1));
    let downloader = Downloader::new(backend.clone(), workers(2, HOME), fast_config(4));
    let request = DownloadRequest::builder()
        .source("dc4/blob")
        .total_size(64)
        .chunk_size(8)
        .destination_dir(dir.path())
        .destination_name("out")
        .build();

    let outcome = downloader
        .download(request, (), &CancellationToken::new())
        .await
        .unwrap();
    let DownloadOutcome::Completed(result) = outcome else {
        panic!("download was cancelled");
    };

    assert_eq!(std::fs::read(result.path).unwrap(), reference(64));
    // one handshake per worker, plus the rejected import
    assert_eq!(FakeBackend::count(&backend.fresh_opens), 2);
    assert_eq!(FakeBackend::count(&backend.import_calls), 3);
    assert_eq!(downloader.sessions().len(), 2);
}

#[tokio::test]
async fn test_invalid_session_is_dropped_from_pool() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(
        FakeBackend::new(20, HOME).with_chunk_errors(10, vec![BackendError::session_invalid("revoked")]),
    );
    let downloader = Downloader::new(backend.clone(), workers(1, HOME), fast_config(1));
    let request = DownloadRequest::builder()
        .source("dc1/blob")
        .total_size(20)
        .chunk_size(10)
        .destination_dir(dir.path())
        .destination_name("out")
        .build();

    let err = downloader
        .download(request, (), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::ChunkFetch { offset: 10, .. }), "{err}");
    assert_eq!(err.stage(), Stage::ChunkFetch);
    assert!(downloader.sessions().is_empty());
    assert_eq!(FakeBackend::count(&backend.close_calls), 1);
    assert!(files_in(dir.path()).is_empty());
}
