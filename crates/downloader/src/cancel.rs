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

//! Cooperative cancellation for one download.
//!
//! Each download runs under a child of the caller's [`CancellationToken`].
//! Every suspension point is raced against that token, so a cancelled
//! download stops at its next `.await` instead of finishing the current
//! chunk.

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Outcome of work that may be interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Cancellable<T> {
    Done(T),
    Cancelled,
}

impl<T> Cancellable<T> {
    pub const fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Cancellable<U> {
        match self {
            Self::Done(value) => Cancellable::Done(f(value)),
            Self::Cancelled => Cancellable::Cancelled,
        }
    }

    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(value) => Some(value),
            Self::Cancelled => None,
        }
    }
}

/// Run `fut` unless `token` fires first. Cancellation wins ties.
pub async fn or_cancel<F: Future>(token: &CancellationToken, fut: F) -> Cancellable<F::Output> {
    tokio::select! {
        biased;
        () = token.cancelled() => Cancellable::Cancelled,
        output = fut => Cancellable::Done(output),
    }
}

/// Unwrap a [`Cancellable`] inside a function returning
/// `Result<Cancellable<_>, _>`, returning early on cancellation.
macro_rules! cancellable {
    ($token:expr, $fut:expr) => {
        match $crate::cancel::or_cancel($token, $fut).await {
            $crate::cancel::Cancellable::Done(value) => value,
            $crate::cancel::Cancellable::Cancelled => {
                return Ok($crate::cancel::Cancellable::Cancelled);
            }
        }
    };
}

pub(crate) use cancellable;
