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

use std::sync::Arc;

use bytes::Bytes;
use snafu::{ResultExt, Snafu};
use tracing::trace;

use crate::{
    backend::{BlobBackend, ResourceLocator},
    chunk_math::ChunkPlan,
    error::RetryError,
    retry::RetryPolicy,
};

/// Reads chunks through a session, applying the chunk retry policy.
pub struct ChunkFetcher<B: BlobBackend> {
    backend: Arc<B>,
    policy:  RetryPolicy,
}

impl<B: BlobBackend> ChunkFetcher<B> {
    pub const fn new(backend: Arc<B>, policy: RetryPolicy) -> Self { Self { backend, policy } }

    pub async fn fetch(
        &self,
        session: &B::Session,
        locator: &ResourceLocator,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, RetryError> {
        self.policy
            .run(|| self.backend.get_chunk(session, locator, offset, limit))
            .await
    }

    /// Stream the chunks covering `plan`, trimmed to the planned range.
    pub fn stream(
        &self,
        session: Arc<B::Session>,
        locator: Arc<ResourceLocator>,
        plan: ChunkPlan,
    ) -> ChunkStream<'_, B> {
        ChunkStream {
            fetcher: self,
            session,
            locator,
            plan,
            next: 0,
            exhausted: false,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("chunk at offset {offset}: {source}"))]
pub struct StreamError {
    pub offset: u64,
    pub source: RetryError,
}

/// Pull-based sequence of the chunks of one part.
///
/// Each call to [`next`](Self::next) issues at most one backend request, so
/// the next chunk is only requested once the caller is done with the previous
/// one. An empty response ends the stream early; compare
/// [`received`](Self::received) with [`expected`](Self::expected) to detect
/// a short read.
pub struct ChunkStream<'a, B: BlobBackend> {
    fetcher:   &'a ChunkFetcher<B>,
    session:   Arc<B::Session>,
    locator:   Arc<ResourceLocator>,
    plan:      ChunkPlan,
    next:      u64,
    exhausted: bool,
}

impl<B: BlobBackend> ChunkStream<'_, B> {
    pub async fn next(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.exhausted || self.next >= self.plan.chunk_count {
            return Ok(None);
        }

        let offset = self.offset();
        let chunk = self
            .fetcher
            .fetch(&self.session, &self.locator, offset, self.plan.chunk_size())
            .await
            .context(StreamSnafu { offset })?;

        if chunk.is_empty() {
            trace!(offset, "empty chunk, end of blob");
            self.exhausted = true;
            return Ok(None);
        }

        let range = self.plan.trim_range(self.next, chunk.len());
        self.next += 1;
        Ok(Some(chunk.slice(range)))
    }

    /// Backend offset of the next chunk to request.
    #[must_use]
    pub const fn offset(&self) -> u64 { self.plan.offset_of(self.next) }

    /// Chunks received so far.
    #[must_use]
    pub const fn received(&self) -> u64 { self.next }

    /// Chunks the part is made of.
    #[must_use]
    pub const fn expected(&self) -> u64 { self.plan.chunk_count }
}
