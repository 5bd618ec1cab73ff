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

use std::path::PathBuf;

use bon::Builder;
use jiff::SignedDuration;
use serde::{Deserialize, Serialize};

use crate::{
    backend::SourceRef,
    chunk_math::{self, PartSpec},
    naming::MediaKind,
};

/// Default size of one backend chunk (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// A request to download one blob
#[derive(Debug, Clone, Builder)]
pub struct DownloadRequest {
    /// Upstream reference the locator is resolved from
    #[builder(into)]
    pub source:           SourceRef,
    /// Total size of the blob in bytes
    pub total_size:       u64,
    /// Size of one backend chunk
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size:       u64,
    /// Directory the final file is written to
    #[builder(into)]
    pub destination_dir:  PathBuf,
    /// File name inside `destination_dir`; a timestamped fallback is used when
    /// absent
    #[builder(into)]
    pub destination_name: Option<String>,
    /// Used to pick an extension for the fallback name
    #[builder(default)]
    pub media_kind:       MediaKind,
    #[builder(into)]
    pub mime_type:        Option<String>,
}

/// How a download is split into parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPlan {
    pub total_size: u64,
    pub parts:      Vec<PartSpec>,
}

impl DownloadPlan {
    #[must_use]
    pub fn new(total_size: u64, requested_parts: usize, min_part_size: u64) -> Self {
        let num_parts = chunk_math::plan_part_count(total_size, requested_parts, min_part_size);
        Self {
            total_size,
            parts: chunk_math::partition(total_size, num_parts),
        }
    }

    #[must_use]
    pub fn num_parts(&self) -> usize { self.parts.len() }
}

/// Result of a successful download
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// Path where the file was saved
    pub path:     PathBuf,
    /// Size of the downloaded file in bytes
    pub size:     u64,
    /// Number of parts fetched concurrently
    pub parts:    usize,
    /// Total duration of the download operation
    pub duration: SignedDuration,
}

/// How a download ended when it did not fail.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    Completed(DownloadResult),
    /// Cancelled by the caller; every temporary file has been removed.
    Cancelled,
}

impl DownloadOutcome {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }

    #[must_use]
    pub fn into_result(self) -> Option<DownloadResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Cancelled => None,
        }
    }
}
