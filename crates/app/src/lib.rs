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

mod config;
mod store;

use std::{path::PathBuf, sync::Arc};

use bon::Builder;
pub use config::{AppConfig, ENV_PREFIX, LoadConfigError, StoreConfig, WorkerConfig};
use shardfetch_downloader::{DownloadOutcome, DownloadRequest, Downloader, SourceRef};
use snafu::{ResultExt, Whatever};
pub use store::{BlobInfo, LocalBlobStore, LocalSession};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One `fetch` invocation.
#[derive(Debug, Clone, Builder)]
pub struct FetchOptions {
    #[builder(into)]
    pub source:     SourceRef,
    #[builder(into)]
    pub output_dir: PathBuf,
    #[builder(into)]
    pub name:       Option<String>,
    /// Overrides `downloader.num_parts`
    pub parts:      Option<usize>,
}

/// The application: configuration plus the token that stops it.
pub struct App {
    pub config:             AppConfig,
    pub cancellation_token: CancellationToken,
}

impl AppConfig {
    #[must_use]
    pub fn open(self) -> App {
        App {
            config:             self,
            cancellation_token: CancellationToken::new(),
        }
    }
}

impl App {
    fn store(&self) -> Arc<LocalBlobStore> { Arc::new(LocalBlobStore::new(&self.config.store.root)) }

    /// Size and datacenter of a stored blob.
    pub async fn inspect(&self, source: &SourceRef) -> Result<BlobInfo, Whatever> {
        self.store()
            .stat(source)
            .await
            .with_whatever_context(|_| format!("cannot inspect {source}"))
    }

    /// Download one blob, logging progress, until it completes or the
    /// application token is cancelled.
    pub async fn fetch(&self, options: FetchOptions) -> Result<DownloadOutcome, Whatever> {
        self.fetch_until(options, &self.cancellation_token).await
    }

    async fn fetch_until(
        &self,
        options: FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, Whatever> {
        let store = self.store();
        let info = store
            .stat(&options.source)
            .await
            .with_whatever_context(|_| format!("cannot inspect {}", options.source))?;

        let mut config = self.config.downloader.clone();
        if options.parts.is_some() {
            config.num_parts = options.parts;
        }
        config
            .validate()
            .whatever_context("invalid downloader configuration")?;

        let downloader = Downloader::new(store, self.config.store.workers(), config);
        info!(
            source = %options.source,
            size = info.size,
            datacenter = %info.datacenter,
            workers = downloader.workers().len(),
            accelerate = downloader.should_accelerate(info.size, shardfetch_downloader::DEFAULT_CHUNK_SIZE),
            "fetching blob"
        );

        let request = DownloadRequest::builder()
            .source(options.source.clone())
            .total_size(info.size)
            .destination_dir(options.output_dir)
            .maybe_destination_name(options.name)
            .build();

        let outcome = downloader
            .download(request, log_progress, cancel)
            .await
            .with_whatever_context(|err| format!("download of {} failed at {}", options.source, err.stage()));
        downloader.shutdown().await;
        outcome
    }

    /// Run `fetch` and cancel it on Ctrl+C or SIGTERM. A signal only stops
    /// this fetch; the application token stays usable.
    pub async fn run_fetch(&self, options: FetchOptions) -> Result<DownloadOutcome, Whatever> {
        let run = self.cancellation_token.child_token();
        let signals = {
            let run = run.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = shutdown_signal() => run.cancel(),
                    () = run.cancelled() => {}
                }
            })
        };

        let outcome = self.fetch_until(options, &run).await;
        // stop the signal listener once the download is over
        run.cancel();
        let _ = signals.await;
        outcome
    }
}

#[allow(clippy::cast_precision_loss)]
fn log_progress(processed: u64, total: u64) {
    let percent = if total == 0 {
        100.0
    } else {
        processed as f64 * 100.0 / total as f64
    };
    info!(processed, total, "progress {percent:.1}%");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C signal, cancelling download"); },
        () = terminate => { info!("Received terminate signal, cancelling download"); },
    }
}
