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

use serde::{Deserialize, Serialize};
use shardfetch_common_telemetry::LoggingOptions;
use shardfetch_downloader::{DatacenterId, DownloaderConfig, Worker, WorkerId};
use smart_default::SmartDefault;
use snafu::{ResultExt, Snafu, ensure};

/// Prefix of environment variables overriding the configuration, e.g.
/// `SHARDFETCH__DOWNLOADER__NUM_PARTS=4`.
pub const ENV_PREFIX: &str = "SHARDFETCH";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LoadConfigError {
    #[snafu(display("config file {} does not exist", path.display()))]
    MissingFile { path: PathBuf },

    #[snafu(display("failed to load configuration: {source}"))]
    Load { source: config::ConfigError },

    #[snafu(display("invalid downloader configuration: {source}"))]
    InvalidDownloader {
        source: shardfetch_downloader::ConfigError,
    },

    #[snafu(display("store.workers must list at least one worker"))]
    NoWorkers,
}

/// One worker identity of the filesystem store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name:            String,
    /// Datacenter the worker's default credential is valid for
    pub home_datacenter: u32,
}

/// Filesystem blob store layout: `<root>/dc<N>/<blob>`.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[default(PathBuf::from("data"))]
    pub root:    PathBuf,
    #[default(vec![WorkerConfig { name: "default".to_string(), home_datacenter: 1 }])]
    pub workers: Vec<WorkerConfig>,
}

impl StoreConfig {
    /// Workers numbered in configuration order.
    #[must_use]
    pub fn workers(&self) -> Vec<Worker> {
        (0u32..)
            .zip(&self.workers)
            .map(|(id, w)| Worker::new(WorkerId(id), w.name.clone(), DatacenterId(w.home_datacenter)))
            .collect()
    }
}

/// Configuration for the application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging:    LoggingOptions,
    pub downloader: DownloaderConfig,
    pub store:      StoreConfig,
}

impl AppConfig {
    /// Load from an optional TOML file, then apply `SHARDFETCH__` prefixed
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, LoadConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            ensure!(path.exists(), MissingFileSnafu { path });
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        Self::from_builder(builder)
    }

    /// Parse a TOML document, then apply environment overrides.
    pub fn from_toml(content: &str) -> Result<Self, LoadConfigError> {
        Self::from_builder(
            config::Config::builder().add_source(config::File::from_str(content, config::FileFormat::Toml)),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, LoadConfigError> {
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context(LoadSnafu)?
            .try_deserialize()
            .context(LoadSnafu)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoadConfigError> {
        self.downloader.validate().context(InvalidDownloaderSnafu)?;
        ensure!(!self.store.workers.is_empty(), NoWorkersSnafu);
        Ok(())
    }
}
