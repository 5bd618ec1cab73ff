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

//! A [`BlobBackend`] over a local directory tree.
//!
//! Blobs live at `<root>/dc<N>/<path>` and are addressed by source refs of
//! the form `dc<N>/<path>`. A session on a datacenter other than the
//! worker's home one starts unauthorised and only serves chunks once a
//! credential exported for that datacenter has been imported.

use std::{
    io::{ErrorKind, SeekFrom},
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use shardfetch_downloader::{
    BackendError, BlobBackend, DatacenterId, ExportedAuth, ResourceLocator, SessionAuth, SourceRef, Worker,
    WorkerId, WorkerIdentity,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::debug;

/// Size and location of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub datacenter: DatacenterId,
    pub path:       PathBuf,
    pub size:       u64,
}

#[derive(Debug)]
pub struct LocalSession {
    worker:     WorkerId,
    datacenter: DatacenterId,
    authorized: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    #[must_use]
    pub fn root(&self) -> &Path { &self.root }

    fn datacenter_dir(&self, datacenter: DatacenterId) -> PathBuf { self.root.join(datacenter.to_string()) }

    /// Size and datacenter of the blob behind `source`.
    pub async fn stat(&self, source: &SourceRef) -> Result<BlobInfo, BackendError> {
        let (datacenter, relative) = parse_source(source)?;
        let path = self.datacenter_dir(datacenter).join(relative);
        let metadata = tokio::fs::metadata(&path).await.map_err(|err| io_error(&path, &err))?;
        if !metadata.is_file() {
            return Err(BackendError::unexpected(format!("{} is not a file", path.display())));
        }
        Ok(BlobInfo {
            datacenter,
            path,
            size: metadata.len(),
        })
    }

    fn credential(worker: WorkerId, datacenter: DatacenterId) -> Bytes { Bytes::from(format!("{worker}@{datacenter}")) }
}

/// Split `dc<N>/<path>` into its datacenter and a relative path that stays
/// inside the datacenter directory.
fn parse_source(source: &SourceRef) -> Result<(DatacenterId, PathBuf), BackendError> {
    let invalid = || BackendError::unexpected(format!("malformed source ref {source:?}, expected dc<N>/<path>"));

    let (dc, rest) = source.as_str().split_once('/').ok_or_else(invalid)?;
    let id = dc
        .strip_prefix("dc")
        .and_then(|n| n.parse::<u32>().ok())
        .ok_or_else(invalid)?;

    let relative = PathBuf::from(rest);
    let contained = relative.components().count() > 0
        && relative.components().all(|c| matches!(c, Component::Normal(_)));
    if !contained {
        return Err(invalid());
    }
    Ok((DatacenterId(id), relative))
}

fn io_error(path: &Path, err: &std::io::Error) -> BackendError {
    let message = format!("{}: {err}", path.display());
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
            BackendError::unexpected(message)
        }
        _ => BackendError::transient(message),
    }
}

#[async_trait]
impl BlobBackend for LocalBlobStore {
    type Session = LocalSession;

    async fn resolve_locator(&self, worker: &Worker, source: &SourceRef) -> Result<ResourceLocator, BackendError> {
        let info = self.stat(source).await?;
        debug!(worker = %worker.id(), %source, datacenter = %info.datacenter, size = info.size, "resolved blob");
        let (_, relative) = parse_source(source)?;
        Ok(ResourceLocator {
            datacenter: info.datacenter,
            payload:    Bytes::from(relative.to_string_lossy().into_owned()),
        })
    }

    async fn open_session(
        &self,
        worker: &Worker,
        datacenter: DatacenterId,
        auth: SessionAuth,
    ) -> Result<LocalSession, BackendError> {
        let dir = self.datacenter_dir(datacenter);
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(BackendError::unexpected(format!("unknown datacenter {datacenter}")));
        }
        Ok(LocalSession {
            worker: worker.id(),
            datacenter,
            authorized: AtomicBool::new(auth == SessionAuth::Home),
        })
    }

    async fn export_auth(&self, worker: &Worker, datacenter: DatacenterId) -> Result<ExportedAuth, BackendError> {
        Ok(ExportedAuth {
            id:    i64::from(worker.id().0),
            bytes: Self::credential(worker.id(), datacenter),
        })
    }

    async fn import_auth(&self, session: &LocalSession, auth: ExportedAuth) -> Result<(), BackendError> {
        if auth.bytes != Self::credential(session.worker, session.datacenter) {
            return Err(BackendError::session_invalid("authorization bytes invalid"));
        }
        session.authorized.store(true, Ordering::Release);
        Ok(())
    }

    async fn get_chunk(
        &self,
        session: &LocalSession,
        locator: &ResourceLocator,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, BackendError> {
        if !session.authorized.load(Ordering::Acquire) {
            return Err(BackendError::session_invalid(format!(
                "{} is not authorized on {}",
                session.worker, session.datacenter
            )));
        }
        if locator.datacenter != session.datacenter {
            return Err(BackendError::unexpected(format!(
                "blob lives on {}, session is on {}",
                locator.datacenter, session.datacenter
            )));
        }

        let relative = std::str::from_utf8(&locator.payload)
            .map_err(|_| BackendError::unexpected("locator payload is not a path"))?;
        let path = self.datacenter_dir(locator.datacenter).join(relative);
        let mut file = File::open(&path).await.map_err(|err| io_error(&path, &err))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| io_error(&path, &err))?;

        let limit = usize::try_from(limit).map_err(|_| BackendError::unexpected("chunk limit too large"))?;
        let mut buf = BytesMut::zeroed(limit);
        let mut filled = 0;
        while filled < limit {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|err| io_error(&path, &err))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }
}
