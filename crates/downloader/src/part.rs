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

use std::{path::PathBuf, sync::Arc};

use snafu::{IntoError, OptionExt, ResultExt, ensure};
use strum_macros::Display;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    assembler::Layout,
    backend::{BlobBackend, DatacenterId, SourceRef, Worker, WorkerIdentity},
    cancel::{Cancellable, cancellable},
    chunk_math::{ChunkPlan, PartSpec},
    error::{
        BackendError, ChunkFetchSnafu, DownloadError, IncompletePartSnafu, LocatorResolutionSnafu, NoWorkersSnafu,
        PartFileSnafu, SessionSnafu, UnexpectedResponseSnafu,
    },
    fetcher::{ChunkFetcher, StreamError},
    locator_cache::LocatorCache,
    progress::ProgressCounter,
    session_pool::SessionPool,
    worker_pool::WorkerPool,
};

const WRITE_BUFFER_SIZE: usize = 512 * 1024;

/// Lifecycle of one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PartState {
    Pending,
    WorkerSelected,
    SessionAcquired,
    Fetching,
    Writing,
    Done,
    Failed,
    Cancelled,
}

/// Everything the parts of one download share.
pub(crate) struct PartContext<B: BlobBackend> {
    pub(crate) workers:    Arc<WorkerPool>,
    pub(crate) locators:   Arc<LocatorCache<B>>,
    pub(crate) sessions:   Arc<SessionPool<B>>,
    pub(crate) fetcher:    Arc<ChunkFetcher<B>>,
    pub(crate) source:     SourceRef,
    pub(crate) chunk_size: u64,
    pub(crate) layout:     Layout,
    pub(crate) progress:   ProgressCounter,
    pub(crate) cancel:     CancellationToken,
}

/// Download one part into its part file.
pub(crate) async fn download_part<B: BlobBackend>(
    ctx: Arc<PartContext<B>>,
    spec: PartSpec,
) -> Result<Cancellable<PathBuf>, DownloadError> {
    let span = info_span!("part", part = spec.index, start = spec.start, end = spec.end);
    async move {
        let mut state = PartState::Pending;
        let result = run(&ctx, spec, &mut state).await;
        let terminal = match &result {
            Ok(Cancellable::Done(_)) => PartState::Done,
            Ok(Cancellable::Cancelled) => PartState::Cancelled,
            Err(err) => {
                warn!(from = %state, error = %err, "part failed");
                PartState::Failed
            }
        };
        debug!(from = %state, to = %terminal, "part finished");
        result
    }
    .instrument(span)
    .await
}

fn advance(state: &mut PartState, next: PartState) {
    debug!(from = %state, to = %next, "part state");
    *state = next;
}

async fn run<B: BlobBackend>(
    ctx: &PartContext<B>,
    spec: PartSpec,
    state: &mut PartState,
) -> Result<Cancellable<PathBuf>, DownloadError> {
    let part = spec.index;

    let lease = ctx.workers.select().context(NoWorkersSnafu)?;
    let worker = lease.worker();
    advance(state, PartState::WorkerSelected);
    debug!(worker = %worker.id(), label = worker.label(), "worker selected");

    let locator = cancellable!(&ctx.cancel, ctx.locators.resolve(worker, &ctx.source)).context(
        LocatorResolutionSnafu {
            part,
            worker: worker.id(),
        },
    )?;
    let datacenter = locator.datacenter;

    let session = cancellable!(&ctx.cancel, ctx.sessions.acquire(worker, datacenter)).context(SessionSnafu {
        part,
        worker: worker.id(),
        datacenter,
    })?;
    advance(state, PartState::SessionAcquired);

    let path = ctx.layout.part(part);
    let file = cancellable!(&ctx.cancel, File::create(&path)).context(PartFileSnafu { part, path: &path })?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

    let plan = ChunkPlan::for_part(ctx.chunk_size, &spec);
    let mut stream = ctx.fetcher.stream(session, locator, plan);
    advance(state, PartState::Fetching);

    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(Cancellable::Cancelled);
        }
        let chunk = match cancellable!(&ctx.cancel, stream.next()) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => return Err(fetch_failure(ctx, part, lease.worker(), datacenter, err).await),
        };
        cancellable!(&ctx.cancel, writer.write_all(&chunk)).context(PartFileSnafu { part, path: &path })?;
        ctx.progress.add(chunk.len() as u64);
    }

    ensure!(stream.received() == stream.expected(), IncompletePartSnafu {
        part,
        worker: worker.id(),
        received: stream.received(),
        expected: stream.expected(),
    });

    advance(state, PartState::Writing);
    cancellable!(&ctx.cancel, writer.flush()).context(PartFileSnafu { part, path: &path })?;
    cancellable!(&ctx.cancel, writer.get_mut().sync_all()).context(PartFileSnafu { part, path: &path })?;

    Ok(Cancellable::Done(path))
}

/// Turn a failed chunk into the part's error. A rejected session is dropped
/// from the pool so later parts open a new one.
async fn fetch_failure<B: BlobBackend>(
    ctx: &PartContext<B>,
    part: usize,
    worker: &Worker,
    datacenter: DatacenterId,
    err: StreamError,
) -> DownloadError {
    let StreamError { offset, source } = err;
    let worker = worker.id();
    match &source.source {
        BackendError::Unexpected { .. } => {
            UnexpectedResponseSnafu { part, worker, offset }.into_error(source.source)
        }
        BackendError::SessionInvalid { .. } => {
            ctx.sessions.invalidate(worker, datacenter).await;
            ChunkFetchSnafu { part, worker, offset }.into_error(source)
        }
        _ => ChunkFetchSnafu { part, worker, offset }.into_error(source),
    }
}
