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

use std::{path::PathBuf, time::Duration};

use snafu::Snafu;
use strum_macros::{Display, EnumString};

use crate::backend::{DatacenterId, WorkerId};

/// Failure reported by a [`BlobBackend`](crate::BlobBackend) call.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum BackendError {
    /// Timeouts, resets and similar; worth retrying after a backoff.
    #[snafu(display("transient backend failure: {message}"))]
    Transient { message: String },

    /// The backend asked the caller to wait before the next call.
    #[snafu(display("rate limited by backend, retry after {wait:?}"))]
    RateLimited { wait: Duration },

    /// The session can no longer be used and must be discarded.
    #[snafu(display("session rejected by backend: {message}"))]
    SessionInvalid { message: String },

    /// A response of an unexpected shape. Never retried.
    #[snafu(display("unexpected backend response: {message}"))]
    Unexpected { message: String },
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn rate_limited(wait: Duration) -> Self { Self::RateLimited { wait } }

    pub fn session_invalid(message: impl Into<String>) -> Self {
        Self::SessionInvalid {
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool { matches!(self, Self::Transient { .. }) }
}

/// A backend call that kept failing until its retry budget ran out, or failed
/// with an error that is never retried.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)), display("gave up after {attempts} attempt(s): {source}"))]
pub struct RetryError {
    pub attempts: usize,
    pub source:   BackendError,
}

/// Failure to obtain a session from the pool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("failed to open session: {source}"))]
    Open { source: RetryError },

    #[snafu(display("authorization import failed after {attempts} attempt(s): {source}"))]
    Handshake {
        attempts: usize,
        source:   BackendError,
    },
}

/// Stage of a download an error originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Planning,
    LocatorResolution,
    SessionHandshake,
    ChunkFetch,
    PartWrite,
    Assembly,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DownloadError {
    #[snafu(display("no workers are configured"))]
    NoWorkers,

    #[snafu(display("object is empty, nothing to download"))]
    EmptyObject,

    #[snafu(display("chunk size must be greater than zero"))]
    InvalidChunkSize,

    #[snafu(display("failed to create destination directory {}: {source}", path.display()))]
    DestinationDir {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("part {part}: {worker} could not resolve the locator: {source}"))]
    LocatorResolution {
        part:   usize,
        worker: WorkerId,
        source: RetryError,
    },

    #[snafu(display("part {part}: {worker} has no session to {datacenter}: {source}"))]
    Session {
        part:       usize,
        worker:     WorkerId,
        datacenter: DatacenterId,
        source:     SessionError,
    },

    #[snafu(display("part {part}: {worker} failed to fetch offset {offset}: {source}"))]
    ChunkFetch {
        part:   usize,
        worker: WorkerId,
        offset: u64,
        source: RetryError,
    },

    #[snafu(display("part {part}: {worker} got an unexpected response at offset {offset}: {source}"))]
    UnexpectedResponse {
        part:   usize,
        worker: WorkerId,
        offset: u64,
        source: BackendError,
    },

    #[snafu(display("part {part}: {worker} received {received} of {expected} chunks"))]
    IncompletePart {
        part:     usize,
        worker:   WorkerId,
        received: u64,
        expected: u64,
    },

    #[snafu(display("part {part}: failed to write {}: {source}", path.display()))]
    PartFile {
        part:   usize,
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to assemble {}: {source}", path.display()))]
    Assembly {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("assembled {actual} bytes, expected {expected}"))]
    SizeMismatch { expected: u64, actual: u64 },

    #[snafu(display("download task panicked: {message}"))]
    TaskPanic { message: String },
}

impl DownloadError {
    /// Stage of the download the error comes from.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::NoWorkers | Self::EmptyObject | Self::InvalidChunkSize | Self::DestinationDir { .. } => {
                Stage::Planning
            }
            Self::LocatorResolution { .. } => Stage::LocatorResolution,
            Self::Session { .. } => Stage::SessionHandshake,
            Self::ChunkFetch { .. } | Self::UnexpectedResponse { .. } | Self::IncompletePart { .. } => {
                Stage::ChunkFetch
            }
            Self::PartFile { .. } | Self::TaskPanic { .. } => Stage::PartWrite,
            Self::Assembly { .. } | Self::SizeMismatch { .. } => Stage::Assembly,
        }
    }

    /// Index of the part the error was raised in, if any.
    #[must_use]
    pub const fn part(&self) -> Option<usize> {
        match self {
            Self::LocatorResolution { part, .. }
            | Self::Session { part, .. }
            | Self::ChunkFetch { part, .. }
            | Self::UnexpectedResponse { part, .. }
            | Self::IncompletePart { part, .. }
            | Self::PartFile { part, .. } => Some(*part),
            _ => None,
        }
    }

    /// Worker the failing part was assigned to, if any.
    #[must_use]
    pub const fn worker(&self) -> Option<WorkerId> {
        match self {
            Self::LocatorResolution { worker, .. }
            | Self::Session { worker, .. }
            | Self::ChunkFetch { worker, .. }
            | Self::UnexpectedResponse { worker, .. }
            | Self::IncompletePart { worker, .. } => Some(*worker),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_and_origin() {
        let err = DownloadError::IncompletePart {
            part:     2,
            worker:   WorkerId(7),
            received: 3,
            expected: 5,
        };
        assert_eq!(err.stage(), Stage::ChunkFetch);
        assert_eq!(err.part(), Some(2));
        assert_eq!(err.worker(), Some(WorkerId(7)));
        assert_eq!(err.to_string(), "part 2: worker-7 received 3 of 5 chunks");
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::SessionHandshake.to_string(), "session_handshake");
        assert_eq!("assembly".parse::<Stage>().unwrap(), Stage::Assembly);
        assert_eq!(DownloadError::NoWorkers.stage(), Stage::Planning);
    }
}
