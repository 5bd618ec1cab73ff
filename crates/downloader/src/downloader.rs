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

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use jiff::{Timestamp, Zoned};
use snafu::{ResultExt, ensure};
use tokio::{
    fs,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    assembler::{self, Layout},
    backend::{BlobBackend, Worker},
    cancel::{Cancellable, or_cancel},
    config::{DownloaderConfig, std_duration},
    error::{
        AssemblySnafu, DestinationDirSnafu, DownloadError, EmptyObjectSnafu, InvalidChunkSizeSnafu, NoWorkersSnafu,
        SizeMismatchSnafu,
    },
    fetcher::ChunkFetcher,
    locator_cache::LocatorCache,
    naming,
    part::{PartContext, download_part},
    progress::{self, ProgressCounter, ProgressSink},
    session_pool::SessionPool,
    types::{DownloadOutcome, DownloadPlan, DownloadRequest, DownloadResult},
    worker_pool::WorkerPool,
};

/// Parallel chunked downloader.
///
/// Components, each shared by every download this instance runs:
/// - `WorkerPool`: spreads parts over the least loaded workers
/// - `LocatorCache`: resolves a source once per worker
/// - `SessionPool`: opens and authorises one session per worker and datacenter
/// - `ChunkFetcher`: reads chunks with retry and rate-limit handling
pub struct Downloader<B: BlobBackend> {
    config:   DownloaderConfig,
    workers:  Arc<WorkerPool>,
    locators: Arc<LocatorCache<B>>,
    sessions: Arc<SessionPool<B>>,
    fetcher:  Arc<ChunkFetcher<B>>,
    next_id:  AtomicU64,
}

impl<B: BlobBackend> Downloader<B> {
    /// Create a downloader over `workers`.
    ///
    /// Must be called inside a tokio runtime for the locator cache to run its
    /// idle sweep.
    pub fn new(backend: Arc<B>, workers: impl IntoIterator<Item = Worker>, config: DownloaderConfig) -> Self {
        let workers = Arc::new(WorkerPool::new(workers));
        let locators = Arc::new(LocatorCache::new(
            Arc::clone(&backend),
            &config.locator_cache,
            config.locator_policy(),
        ));
        let sessions = Arc::new(SessionPool::new(Arc::clone(&backend), &config));
        let fetcher = Arc::new(ChunkFetcher::new(backend, config.chunk_policy()));
        let seed = u64::try_from(Timestamp::now().as_millisecond()).unwrap_or_default();

        Self {
            config,
            workers,
            locators,
            sessions,
            fetcher,
            next_id: AtomicU64::new(seed),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &DownloaderConfig { &self.config }

    #[must_use]
    pub const fn workers(&self) -> &Arc<WorkerPool> { &self.workers }

    #[must_use]
    pub const fn locators(&self) -> &Arc<LocatorCache<B>> { &self.locators }

    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionPool<B>> { &self.sessions }

    /// Whether a blob is worth splitting: more than one worker and more than
    /// one chunk of data.
    #[must_use]
    pub fn should_accelerate(&self, total_size: u64, chunk_size: u64) -> bool {
        self.workers.len() > 1 && total_size > chunk_size
    }

    #[must_use]
    pub fn plan(&self, total_size: u64) -> DownloadPlan {
        DownloadPlan::new(
            total_size,
            self.config.parts_for(self.workers.len()),
            self.config.min_part_size.as_bytes(),
        )
    }

    /// Close every pooled session.
    pub async fn shutdown(&self) { self.sessions.close_all().await; }

    /// Download `request` into `request.destination_dir`.
    ///
    /// This method will:
    /// 1. Validate the request and create the destination directory
    /// 2. Split the blob into parts and fetch them concurrently
    /// 3. Report progress to `on_progress` until the parts are done
    /// 4. Concatenate the parts in index order and verify the size
    /// 5. Rename the result into place
    ///
    /// Temporary files are removed on failure and on cancellation.
    /// Cancelling `cancel` yields `Ok(DownloadOutcome::Cancelled)`.
    #[instrument(skip_all, fields(source = %request.source, size = request.total_size))]
    pub async fn download<P: ProgressSink>(
        &self,
        request: DownloadRequest,
        on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError> {
        ensure!(request.total_size > 0, EmptyObjectSnafu);
        ensure!(request.chunk_size > 0, InvalidChunkSizeSnafu);
        ensure!(!self.workers.is_empty(), NoWorkersSnafu);

        let started = Timestamp::now();
        let token = cancel.child_token();
        let total = request.total_size;

        let dir = request.destination_dir.clone();
        match or_cancel(&token, fs::create_dir_all(&dir)).await {
            Cancellable::Done(created) => created.context(DestinationDirSnafu { path: &dir })?,
            Cancellable::Cancelled => return Ok(DownloadOutcome::Cancelled),
        }

        let name = request.destination_name.clone().unwrap_or_else(|| {
            naming::fallback_name(
                request.media_kind,
                request.mime_type.as_deref(),
                Zoned::now().datetime(),
                self.next_id.fetch_add(1, Ordering::Relaxed),
            )
        });
        let layout = Layout::new(&dir, name);
        let plan = self.plan(total);
        let num_parts = plan.num_parts();
        info!(parts = num_parts, chunk_size = request.chunk_size, "starting download");

        let mut teardown = Teardown {
            cancel: token.clone(),
            layout: layout.clone(),
            num_parts,
            tasks: JoinSet::new(),
            reporter: None,
            armed: true,
        };

        let counter = ProgressCounter::default();
        let sink = Arc::new(on_progress);
        let stop_reporter = token.child_token();
        let period = std_duration(self.config.progress_interval).max(Duration::from_millis(1));
        teardown.reporter = Some(tokio::spawn(progress::report(
            Arc::clone(&sink),
            counter.clone(),
            total,
            period,
            stop_reporter.clone(),
        )));

        let ctx = Arc::new(PartContext {
            workers: Arc::clone(&self.workers),
            locators: Arc::clone(&self.locators),
            sessions: Arc::clone(&self.sessions),
            fetcher: Arc::clone(&self.fetcher),
            source: request.source.clone(),
            chunk_size: request.chunk_size,
            layout: layout.clone(),
            progress: counter,
            cancel: token.clone(),
        });
        let parts = run_parts(&mut teardown.tasks, &ctx, &plan).await;

        stop_reporter.cancel();
        if let Some(reporter) = teardown.reporter.take() {
            // A failed reporter never fails the download.
            let _ = reporter.await;
        }

        let finished = match parts {
            Ok(Cancellable::Done(())) => finish(&layout, num_parts, total, &token).await,
            Ok(Cancellable::Cancelled) => Ok(Cancellable::Cancelled),
            Err(err) => Err(err),
        };

        let outcome = match finished {
            Ok(Cancellable::Done(path)) => {
                sink.on_progress(total, total);
                let duration = Timestamp::now().duration_since(started);
                info!(path = %path.display(), ?duration, "download complete");
                Ok(DownloadOutcome::Completed(DownloadResult {
                    path,
                    size: total,
                    parts: num_parts,
                    duration,
                }))
            }
            Ok(Cancellable::Cancelled) => {
                info!("download cancelled, removing temporary files");
                layout.cleanup(num_parts).await;
                Ok(DownloadOutcome::Cancelled)
            }
            Err(err) => {
                warn!(error = %err, stage = %err.stage(), "download failed, removing temporary files");
                layout.cleanup(num_parts).await;
                Err(err)
            }
        };
        teardown.armed = false;
        outcome
    }
}

type PartOutcome = Result<Cancellable<PathBuf>, DownloadError>;

/// Stops a download whose future was dropped before it returned: cancels
/// the parts, stops the reporter and removes the temporary files once every
/// part has stopped.
struct Teardown {
    cancel:    CancellationToken,
    layout:    Layout,
    num_parts: usize,
    tasks:     JoinSet<PartOutcome>,
    reporter:  Option<JoinHandle<()>>,
    armed:     bool,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }

        let mut tasks = std::mem::take(&mut self.tasks);
        let layout = self.layout.clone();
        let num_parts = self.num_parts;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("download dropped before completion, removing temporary files");
                handle.spawn(async move {
                    while tasks.join_next().await.is_some() {}
                    layout.cleanup(num_parts).await;
                });
            }
            Err(_) => tasks.abort_all(),
        }
    }
}

/// Run every part concurrently. The first failure cancels the remaining
/// parts and is returned once they have all stopped.
async fn run_parts<B: BlobBackend>(
    tasks: &mut JoinSet<PartOutcome>,
    ctx: &Arc<PartContext<B>>,
    plan: &DownloadPlan,
) -> Result<Cancellable<()>, DownloadError> {
    for spec in &plan.parts {
        tasks.spawn(download_part(Arc::clone(ctx), *spec));
    }

    let mut first_error = None;
    let mut cancelled = false;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|err| {
            Err(DownloadError::TaskPanic {
                message: err.to_string(),
            })
        });
        match outcome {
            Ok(Cancellable::Done(path)) => debug!(path = %path.display(), "part done"),
            Ok(Cancellable::Cancelled) => cancelled = true,
            Err(err) => {
                if first_error.is_none() {
                    ctx.cancel.cancel();
                    first_error = Some(err);
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None if cancelled => Ok(Cancellable::Cancelled),
        None => Ok(Cancellable::Done(())),
    }
}

/// Assemble the part files, verify the size and move the result into
/// place.
async fn finish(
    layout: &Layout,
    num_parts: usize,
    total: u64,
    token: &CancellationToken,
) -> Result<Cancellable<PathBuf>, DownloadError> {
    let size = match assembler::assemble(layout, num_parts, token).await? {
        Cancellable::Done(size) => size,
        Cancellable::Cancelled => return Ok(Cancellable::Cancelled),
    };
    ensure!(size == total, SizeMismatchSnafu {
        expected: total,
        actual:   size,
    });
    if token.is_cancelled() {
        return Ok(Cancellable::Cancelled);
    }

    let destination = layout.destination();
    fs::rename(layout.assembly(), &destination)
        .await
        .context(AssemblySnafu { path: &destination })?;
    Ok(Cancellable::Done(destination))
}
