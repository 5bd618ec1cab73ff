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

//! The boundary between the downloader and the blob store it reads from.
//!
//! A [`BlobBackend`] knows how to address a blob for a given worker, how to
//! open authenticated sessions against a datacenter, and how to read one
//! chunk through such a session. Everything else (pooling, retrying,
//! splitting, assembling) lives in this crate.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Identity of one authenticated client in the worker pool.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[display("worker-{_0}")]
pub struct WorkerId(pub u32);

/// One shard of the backend storage cluster.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[display("dc{_0}")]
pub struct DatacenterId(pub u32);

/// Opaque upstream reference to a blob, as handed over by the caller.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display, derive_more::From,
)]
#[display("{_0}")]
pub struct SourceRef(pub String);

impl SourceRef {
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for SourceRef {
    fn from(value: &str) -> Self { Self(value.to_string()) }
}

/// Decoded addressing data for a blob, valid for the worker that resolved it.
///
/// Read-only once resolved; shared between parts behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocator {
    /// Datacenter that stores the blob.
    pub datacenter: DatacenterId,
    /// Backend-specific location and access credential.
    pub payload:    Bytes,
}

/// Capability every worker client exposes to the pool.
pub trait WorkerIdentity {
    fn id(&self) -> WorkerId;

    /// Datacenter the worker's default credential belongs to.
    fn home_datacenter(&self) -> DatacenterId;

    /// Human readable name for logs.
    fn label(&self) -> &str;
}

/// A worker identity captured when the pool is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    id:              WorkerId,
    label:           String,
    home_datacenter: DatacenterId,
}

impl Worker {
    pub fn new(id: WorkerId, label: impl Into<String>, home_datacenter: DatacenterId) -> Self {
        Self {
            id,
            label: label.into(),
            home_datacenter,
        }
    }

    pub fn from_identity<I: WorkerIdentity + ?Sized>(identity: &I) -> Self {
        Self::new(identity.id(), identity.label(), identity.home_datacenter())
    }
}

impl WorkerIdentity for Worker {
    fn id(&self) -> WorkerId { self.id }

    fn home_datacenter(&self) -> DatacenterId { self.home_datacenter }

    fn label(&self) -> &str { &self.label }
}

/// How a new session authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionAuth {
    /// Reuse the worker's default credential (target is the home datacenter).
    Home,
    /// Start unauthorised; an exported authorization must be imported before
    /// the session can read chunks.
    Fresh,
}

/// Authorization exported by a worker for use on another datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedAuth {
    pub id:    i64,
    pub bytes: Bytes,
}

/// Operations the downloader needs from a blob store.
///
/// Every method may perform network I/O. Implementations classify failures
/// with [`BackendError`] so the downloader can decide between retrying,
/// waiting out a rate limit and giving up.
#[async_trait]
pub trait BlobBackend: Send + Sync + 'static {
    /// Authenticated channel to one datacenter for one worker.
    type Session: Send + Sync + 'static;

    async fn resolve_locator(
        &self,
        worker: &Worker,
        source: &SourceRef,
    ) -> Result<ResourceLocator, BackendError>;

    async fn open_session(
        &self,
        worker: &Worker,
        datacenter: DatacenterId,
        auth: SessionAuth,
    ) -> Result<Self::Session, BackendError>;

    async fn export_auth(
        &self,
        worker: &Worker,
        datacenter: DatacenterId,
    ) -> Result<ExportedAuth, BackendError>;

    async fn import_auth(
        &self,
        session: &Self::Session,
        auth: ExportedAuth,
    ) -> Result<(), BackendError>;

    /// Read up to `limit` bytes at `offset`. An empty result means the
    /// offset is at or past the end of the blob.
    async fn get_chunk(
        &self,
        session: &Self::Session,
        locator: &ResourceLocator,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, BackendError>;

    /// Release a session the pool no longer wants.
    async fn close_session(&self, _session: &Self::Session) {}
}
