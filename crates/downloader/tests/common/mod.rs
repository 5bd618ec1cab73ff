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

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use jiff::SignedDuration;
use shardfetch_base::readable_size::ReadableSize;
use shardfetch_downloader::{
    BackendError, BlobBackend, DatacenterId, DownloaderConfig, ExportedAuth, ResourceLocator, RetryConfig,
    SessionAuth, SourceRef, Worker, WorkerId, WorkerIdentity,
};
use tokio::sync::watch;

/// Byte stored at position `p` of every fake blob.
#[allow(clippy::cast_possible_truncation)]
pub fn byte_at(p: u64) -> u8 { (p % 251) as u8 }

pub fn reference(len: u64) -> Vec<u8> { (0..len).map(byte_at).collect() }

pub fn workers(n: u32, home: DatacenterId) -> Vec<Worker> {
    (0..n).map(|i| Worker::new(WorkerId(i), format!("bot{i}"), home)).collect()
}

fn fast_retry(max_attempts: usize) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff_step: SignedDuration::from_millis(10),
        timeout: SignedDuration::from_secs(5),
    }
}

/// Downloader config with short delays and no minimum part size.
pub fn fast_config(num_parts: usize) -> DownloaderConfig {
    DownloaderConfig::builder()
        .num_parts(num_parts)
        .min_part_size(ReadableSize::b(1))
        .chunk_retry(fast_retry(3))
        .locator_retry(fast_retry(3))
        .session_retry(fast_retry(3))
        .rate_limit_margin(SignedDuration::from_millis(10))
        .handshake_delay(SignedDuration::from_millis(10))
        .progress_interval(SignedDuration::from_millis(20))
        .build()
}

/// Names of the files left in `dir`, sorted.
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[derive(Debug)]
pub struct FakeSession {
    pub worker:     WorkerId,
    pub datacenter: DatacenterId,
    authorized:     AtomicBool,
}

/// In-memory blob store serving `byte_at(p)` for every position below
/// `stored_len`.
pub struct FakeBackend {
    stored_len: u64,
    datacenter: DatacenterId,

    chunk_errors:    Mutex<HashMap<u64, VecDeque<BackendError>>>,
    resolve_errors:  Mutex<VecDeque<BackendError>>,
    import_failures: AtomicUsize,
    import_errors:   Mutex<VecDeque<BackendError>>,
    import_delay:    Duration,
    resolve_delay:   Duration,
    gate:            watch::Sender<bool>,
    gate_from:       u64,

    pub resolve_calls: AtomicUsize,
    pub open_calls:    AtomicUsize,
    pub fresh_opens:   AtomicUsize,
    pub export_calls:  AtomicUsize,
    pub import_calls:  AtomicUsize,
    pub chunk_calls:   AtomicUsize,
    pub close_calls:   AtomicUsize,
    pub waiting:       AtomicUsize,
    pub served:        Mutex<Vec<(WorkerId, u64)>>,
}

impl FakeBackend {
    pub fn new(stored_len: u64, datacenter: DatacenterId) -> Self {
        Self {
            stored_len,
            datacenter,
            chunk_errors: Mutex::default(),
            resolve_errors: Mutex::default(),
            import_failures: AtomicUsize::new(0),
            import_errors: Mutex::default(),
            import_delay: Duration::ZERO,
            resolve_delay: Duration::ZERO,
            gate: watch::Sender::new(true),
            gate_from: 0,
            resolve_calls: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
            fresh_opens: AtomicUsize::new(0),
            export_calls: AtomicUsize::new(0),
            import_calls: AtomicUsize::new(0),
            chunk_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            served: Mutex::default(),
        }
    }

    /// Fail the next calls at `offset` with `errors`, in order.
    #[must_use]
    pub fn with_chunk_errors(self, offset: u64, errors: Vec<BackendError>) -> Self {
        self.chunk_errors.lock().unwrap().insert(offset, errors.into());
        self
    }

    #[must_use]
    pub fn with_resolve_errors(self, errors: Vec<BackendError>) -> Self {
        *self.resolve_errors.lock().unwrap() = errors.into();
        self
    }

    /// Reject the first `n` authorization imports.
    #[must_use]
    pub fn with_import_failures(self, n: usize) -> Self {
        self.import_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next authorization imports with `errors`, in order.
    #[must_use]
    pub fn with_import_errors(self, errors: Vec<BackendError>) -> Self {
        *self.import_errors.lock().unwrap() = errors.into();
        self
    }

    #[must_use]
    pub fn with_import_delay(mut self, delay: Duration) -> Self {
        self.import_delay = delay;
        self
    }

    #[must_use]
    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = delay;
        self
    }

    /// Hold every chunk request until [`open_gate`](Self::open_gate).
    #[must_use]
    pub fn gated(self) -> Self {
        self.gate.send_replace(false);
        self
    }

    /// Like [`gated`](Self::gated), but chunks below `offset` are served
    /// right away.
    #[must_use]
    pub fn gated_from(mut self, offset: u64) -> Self {
        self.gate_from = offset;
        self.gated()
    }

    pub fn open_gate(&self) { self.gate.send_replace(true); }

    /// Wait until `n` chunk requests are parked at the gate.
    pub async fn wait_for_waiting(&self, n: usize) {
        while self.waiting.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize { counter.load(Ordering::SeqCst) }
}

#[async_trait]
impl BlobBackend for FakeBackend {
    type Session = FakeSession;

    async fn resolve_locator(&self, worker: &Worker, source: &SourceRef) -> Result<ResourceLocator, BackendError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if !self.resolve_delay.is_zero() {
            tokio::time::sleep(self.resolve_delay).await;
        }
        if let Some(err) = self.resolve_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(ResourceLocator {
            datacenter: self.datacenter,
            payload:    Bytes::from(format!("{}:{source}", worker.id())),
        })
    }

    async fn open_session(
        &self,
        worker: &Worker,
        datacenter: DatacenterId,
        auth: SessionAuth,
    ) -> Result<FakeSession, BackendError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if auth == SessionAuth::Fresh {
            self.fresh_opens.fetch_add(1, Ordering::SeqCst);
        }
        Ok(FakeSession {
            worker: worker.id(),
            datacenter,
            authorized: AtomicBool::new(auth == SessionAuth::Home),
        })
    }

    async fn export_auth(&self, worker: &Worker, datacenter: DatacenterId) -> Result<ExportedAuth, BackendError> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExportedAuth {
            id:    i64::from(worker.id().0),
            bytes: Bytes::from(format!("{datacenter}")),
        })
    }

    async fn import_auth(&self, session: &FakeSession, _auth: ExportedAuth) -> Result<(), BackendError> {
        self.import_calls.fetch_add(1, Ordering::SeqCst);
        if !self.import_delay.is_zero() {
            tokio::time::sleep(self.import_delay).await;
        }
        if let Some(err) = self.import_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let remaining = self.import_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.import_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::session_invalid("auth bytes invalid"));
        }
        session.authorized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_chunk(
        &self,
        session: &FakeSession,
        locator: &ResourceLocator,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, BackendError> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(locator.datacenter, session.datacenter, "session on the wrong datacenter");
        assert!(
            locator.payload.starts_with(session.worker.to_string().as_bytes()),
            "locator used by a worker that did not resolve it"
        );

        let mut gate = self.gate.subscribe();
        let held = offset >= self.gate_from && !*gate.borrow();
        if held {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _ = gate.wait_for(|open| *open).await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }

        if !session.authorized.load(Ordering::SeqCst) {
            return Err(BackendError::session_invalid("session not authorized"));
        }
        let scripted = self.chunk_errors.lock().unwrap().get_mut(&offset).and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        self.served.lock().unwrap().push((session.worker, offset));
        let end = (offset + limit).min(self.stored_len);
        if offset >= end {
            return Ok(Bytes::new());
        }
        Ok((offset..end).map(byte_at).collect::<Vec<u8>>().into())
    }

    async fn close_session(&self, _session: &FakeSession) { self.close_calls.fetch_add(1, Ordering::SeqCst); }
}
