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

use shadow_rs::shadow;

shadow!(build);

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");

/// `SHARDFETCH_RELEASE` is set by the release pipeline only.
const RELEASE: bool = option_env!("SHARDFETCH_RELEASE").is_some();

const DIRTY: &str = if build::GIT_CLEAN { "" } else { "-dirty" };

/// `0.1.0` for releases, `0.1.0-dev+abc1234[-dirty]` otherwise.
#[allow(clippy::const_is_empty)]
pub const VERSION: &str = if RELEASE {
    build::PKG_VERSION
} else if build::SHORT_COMMIT.is_empty() {
    shadow_rs::formatcp!("{}-dev", build::PKG_VERSION)
} else {
    shadow_rs::formatcp!("{}-dev+{}{}", build::PKG_VERSION, build::SHORT_COMMIT, DIRTY)
};

/// Shown by `--version` together with the toolchain and target.
pub const LONG_VERSION: &str = shadow_rs::formatcp!(
    "{}\nbranch: {}\ncommit date: {}\nrustc: {}\ntarget: {}",
    VERSION,
    build::BRANCH,
    build::COMMIT_DATE,
    build::RUST_VERSION,
    build::BUILD_TARGET,
);
