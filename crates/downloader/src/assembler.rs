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

use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufReader, BufWriter},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cancel::{Cancellable, cancellable},
    error::{AssemblySnafu, DownloadError},
};

const BUFFER_SIZE: usize = 512 * 1024;

/// File layout of one download inside its destination directory.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    dir:  PathBuf,
    name: String,
}

impl Layout {
    pub(crate) fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir:  dir.into(),
            name: name.into(),
        }
    }

    pub(crate) fn part(&self, index: usize) -> PathBuf { self.dir.join(format!("{}.temp.{index:02}", self.name)) }

    pub(crate) fn assembly(&self) -> PathBuf { self.dir.join(format!("{}.temp", self.name)) }

    pub(crate) fn destination(&self) -> PathBuf { self.dir.join(&self.name) }

    /// Remove every part file and the assembly file, ignoring missing ones.
    pub(crate) async fn cleanup(&self, num_parts: usize) {
        for index in 0..num_parts {
            remove_if_exists(&self.part(index)).await;
        }
        remove_if_exists(&self.assembly()).await;
    }
}

async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed temporary file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temporary file"),
    }
}

/// Concatenate `num_parts` part files in index order into the assembly
/// file, deleting each part once it has been copied. Returns the assembled
/// size.
pub(crate) async fn assemble(
    layout: &Layout,
    num_parts: usize,
    cancel: &CancellationToken,
) -> Result<Cancellable<u64>, DownloadError> {
    let target = layout.assembly();
    let file = cancellable!(cancel, File::create(&target)).context(AssemblySnafu { path: &target })?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
    let mut size = 0u64;

    for index in 0..num_parts {
        let path = layout.part(index);
        let part = cancellable!(cancel, File::open(&path)).context(AssemblySnafu { path: &path })?;
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, part);
        let copied =
            cancellable!(cancel, tokio::io::copy_buf(&mut reader, &mut writer)).context(AssemblySnafu { path: &target })?;
        size += copied;
        debug!(part = index, bytes = copied, "folded part into assembly");
        remove_if_exists(&path).await;
    }

    cancellable!(cancel, writer.flush()).context(AssemblySnafu { path: &target })?;
    cancellable!(cancel, writer.get_mut().sync_all()).context(AssemblySnafu { path: &target })?;

    Ok(Cancellable::Done(size))
}
