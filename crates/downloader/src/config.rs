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

use std::time::Duration;

use bon::Builder;
use jiff::SignedDuration;
use serde::{Deserialize, Serialize};
use shardfetch_base::readable_size::ReadableSize;
use smart_default::SmartDefault;
use snafu::{Snafu, ensure};

use crate::retry::RetryPolicy;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("{field} must be greater than zero"))]
    Zero { field: &'static str },

    #[snafu(display("{field} must not be negative"))]
    Negative { field: &'static str },
}

/// Retry budget for one kind of backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before giving up on transient errors
    pub max_attempts: usize,
    /// Sleep after the n-th failed attempt is `n * backoff_step`
    pub backoff_step: SignedDuration,
    /// Upper bound for a single call; expiry counts as a transient error
    pub timeout:      SignedDuration,
}

impl RetryConfig {
    fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        ensure!(self.max_attempts > 0, ZeroSnafu { field: name });
        ensure!(!self.backoff_step.is_negative(), NegativeSnafu { field: name });
        ensure!(self.timeout.is_positive(), ZeroSnafu { field: name });
        Ok(())
    }
}

/// Locator cache bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorCacheConfig {
    /// Maximum number of cached locators (default: 100)
    #[default = 100]
    pub capacity:       usize,
    /// Entries idle for longer than this are evicted (default: 45m)
    #[default(SignedDuration::from_mins(45))]
    pub ttl:            SignedDuration,
    /// How often the background sweep runs (default: 15m)
    #[default(SignedDuration::from_mins(15))]
    pub sweep_interval: SignedDuration,
}

/// Configuration for the downloader
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Number of parts per download; `max(8, workers)` when unset
    pub num_parts: Option<usize>,

    /// Objects smaller than this are fetched as one part (default: 10MiB)
    #[builder(default = ReadableSize::mb(10))]
    pub min_part_size: ReadableSize,

    #[builder(default)]
    pub locator_cache: LocatorCacheConfig,

    /// Chunk fetch retries (default: 5 attempts, 2s step, 60s per call)
    #[builder(default = RetryConfig {
        max_attempts: 5,
        backoff_step: SignedDuration::from_secs(2),
        timeout:      SignedDuration::from_secs(60),
    })]
    pub chunk_retry: RetryConfig,

    /// Locator lookup retries (default: 3 attempts, 1s step, 30s per call)
    #[builder(default = RetryConfig {
        max_attempts: 3,
        backoff_step: SignedDuration::from_secs(1),
        timeout:      SignedDuration::from_secs(30),
    })]
    pub locator_retry: RetryConfig,

    /// Session open retries (default: 3 attempts, 1s step, 30s per call)
    #[builder(default = RetryConfig {
        max_attempts: 3,
        backoff_step: SignedDuration::from_secs(1),
        timeout:      SignedDuration::from_secs(30),
    })]
    pub session_retry: RetryConfig,

    /// Added on top of the wait a rate-limited response asks for
    #[builder(default = SignedDuration::from_secs(1))]
    pub rate_limit_margin: SignedDuration,

    /// Authorization import attempts on a foreign datacenter
    #[builder(default = 6)]
    pub handshake_attempts: usize,

    #[builder(default = SignedDuration::from_secs(1))]
    pub handshake_delay: SignedDuration,

    /// Interval between progress callbacks
    #[builder(default = SignedDuration::from_secs(1))]
    pub progress_interval: SignedDuration,
}

impl Default for DownloaderConfig {
    fn default() -> Self { Self::builder().build() }
}

impl DownloaderConfig {
    /// Number of parts to request for a pool of `workers` workers.
    #[must_use]
    pub fn parts_for(&self, workers: usize) -> usize { self.num_parts.unwrap_or_else(|| workers.max(8)) }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(parts) = self.num_parts {
            ensure!(parts > 0, ZeroSnafu { field: "num_parts" });
        }
        ensure!(self.locator_cache.capacity > 0, ZeroSnafu {
            field: "locator_cache.capacity",
        });
        ensure!(self.locator_cache.ttl.is_positive(), ZeroSnafu {
            field: "locator_cache.ttl",
        });
        ensure!(self.locator_cache.sweep_interval.is_positive(), ZeroSnafu {
            field: "locator_cache.sweep_interval",
        });
        self.chunk_retry.validate("chunk_retry")?;
        self.locator_retry.validate("locator_retry")?;
        self.session_retry.validate("session_retry")?;
        ensure!(!self.rate_limit_margin.is_negative(), NegativeSnafu {
            field: "rate_limit_margin",
        });
        ensure!(self.handshake_attempts > 0, ZeroSnafu {
            field: "handshake_attempts",
        });
        ensure!(!self.handshake_delay.is_negative(), NegativeSnafu {
            field: "handshake_delay",
        });
        ensure!(self.progress_interval.is_positive(), ZeroSnafu {
            field: "progress_interval",
        });
        Ok(())
    }

    pub(crate) fn chunk_policy(&self) -> RetryPolicy { self.policy(self.chunk_retry) }

    pub(crate) fn locator_policy(&self) -> RetryPolicy { self.policy(self.locator_retry) }

    pub(crate) fn session_policy(&self) -> RetryPolicy { self.policy(self.session_retry) }

    fn policy(&self, retry: RetryConfig) -> RetryPolicy {
        RetryPolicy {
            max_attempts:      retry.max_attempts,
            backoff_step:      std_duration(retry.backoff_step),
            timeout:           std_duration(retry.timeout),
            rate_limit_margin: std_duration(self.rate_limit_margin),
        }
    }
}

/// Negative durations are rejected by `validate`; they clamp to zero here.
pub(crate) fn std_duration(d: SignedDuration) -> Duration {
    if d.is_negative() { Duration::ZERO } else { d.unsigned_abs() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DownloaderConfig::default();
        assert_eq!(config.num_parts, None);
        assert_eq!(config.min_part_size, ReadableSize::mb(10));
        assert_eq!(config.locator_cache.capacity, 100);
        assert_eq!(config.locator_cache.ttl, SignedDuration::from_mins(45));
        assert_eq!(config.chunk_retry.max_attempts, 5);
        assert_eq!(config.handshake_attempts, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parts_for_pool_size() {
        let config = DownloaderConfig::default();
        assert_eq!(config.parts_for(3), 8);
        assert_eq!(config.parts_for(12), 12);
        let fixed = DownloaderConfig::builder().num_parts(4).build();
        assert_eq!(fixed.parts_for(12), 4);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = DownloaderConfig::builder().num_parts(0).build();
        assert!(matches!(config.validate(), Err(ConfigError::Zero { field: "num_parts" })));

        let config = DownloaderConfig::builder()
            .chunk_retry(RetryConfig {
                max_attempts: 0,
                backoff_step: SignedDuration::ZERO,
                timeout:      SignedDuration::from_secs(1),
            })
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: DownloaderConfig = serde_json::from_str(
            r#"{"num_parts": 4, "min_part_size": "1MiB", "locator_cache": {"capacity": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.num_parts, Some(4));
        assert_eq!(config.min_part_size, ReadableSize::mb(1));
        assert_eq!(config.locator_cache.capacity, 10);
        assert_eq!(config.locator_cache.sweep_interval, SignedDuration::from_mins(15));
        assert_eq!(config.chunk_retry.max_attempts, 5);
    }

    #[test]
    fn test_policy_conversion() {
        let policy = DownloaderConfig::default().chunk_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_step, Duration::from_secs(2));
        assert_eq!(policy.timeout, Duration::from_secs(60));
        assert_eq!(policy.rate_limit_margin, Duration::from_secs(1));
    }
}
