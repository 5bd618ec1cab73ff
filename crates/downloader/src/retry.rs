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

use std::{future::Future, time::Duration};

use snafu::IntoError;
use tracing::{debug, warn};

use crate::error::{BackendError, RetryError, RetrySnafu};

/// Linear-backoff retry loop shared by chunk fetches, locator lookups and
/// session opens.
///
/// * transient errors (and per-call timeouts) are retried up to
///   `max_attempts` calls, sleeping `n * backoff_step` after the n-th failure;
/// * `RateLimited { wait }` sleeps `wait + rate_limit_margin` and retries
///   without consuming an attempt;
/// * every other error is returned at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts:      usize,
    pub backoff_step:      Duration,
    pub timeout:           Duration,
    pub rate_limit_margin: Duration,
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut failures: usize = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::transient(format!(
                    "call timed out after {:?}",
                    self.timeout
                ))),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err {
                BackendError::RateLimited { wait } => {
                    let delay = wait.saturating_add(self.rate_limit_margin);
                    warn!(?delay, "rate limited, waiting before retrying");
                    tokio::time::sleep(delay).await;
                }
                err if err.is_transient() => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        return Err(RetrySnafu { attempts: failures }.into_error(err));
                    }
                    let delay = self.backoff_step.saturating_mul(u32::try_from(failures).unwrap_or(u32::MAX));
                    debug!(attempt = failures, ?delay, error = %err, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                err => {
                    return Err(RetrySnafu {
                        attempts: failures + 1,
                    }
                    .into_error(err));
                }
            }
        }
    }
}
