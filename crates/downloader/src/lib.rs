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

//! Parallel chunked downloads of one blob over a pool of authenticated
//! workers.
//!
//! A [`Downloader`] splits a blob into contiguous parts, fetches each part
//! through the least loaded worker on a session to the datacenter holding
//! the blob, and concatenates the parts into the destination file.

mod assembler;
pub mod backend;
pub mod cancel;
pub mod chunk_math;
mod config;
mod downloader;
mod error;
mod fetcher;
pub mod locator_cache;
pub mod naming;
mod part;
mod progress;
pub mod retry;
pub mod session_pool;
mod types;
pub mod worker_pool;

pub use backend::{
    BlobBackend, DatacenterId, ExportedAuth, ResourceLocator, SessionAuth, SourceRef, Worker, WorkerId,
    WorkerIdentity,
};
pub use cancel::Cancellable;
pub use chunk_math::{ChunkPlan, PartSpec};
pub use config::{ConfigError, DownloaderConfig, LocatorCacheConfig, RetryConfig};
pub use downloader::Downloader;
pub use error::{BackendError, DownloadError, RetryError, SessionError, Stage};
pub use fetcher::{ChunkFetcher, ChunkStream, StreamError};
pub use naming::MediaKind;
pub use part::PartState;
pub use progress::ProgressSink;
pub use types::{DEFAULT_CHUNK_SIZE, DownloadOutcome, DownloadPlan, DownloadRequest, DownloadResult};
pub use worker_pool::{WorkerLease, WorkerPool};
