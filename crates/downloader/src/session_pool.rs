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
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use backon::{ConstantBuilder, Retryable};
use snafu::ResultExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    backend::{BlobBackend, DatacenterId, SessionAuth, Worker, WorkerId, WorkerIdentity},
    config::{DownloaderConfig, std_duration},
    error::{BackendError, OpenSnafu, SessionError},
    retry::RetryPolicy,
};

type Key = (WorkerId, DatacenterId);
type Slot<S> = Arc<OnceCell<Arc<S>>>;

/// Authenticated sessions keyed by `(worker, datacenter)`.
///
/// A session is created on first use and reused by every later part that
/// needs the same worker on the same datacenter. Sessions on a datacenter
/// other than the worker's home one are authorised by exporting the worker's
/// credential and importing it into the new session.
pub struct SessionPool<B: BlobBackend> {
    backend:            Arc<B>,
    open_policy:        RetryPolicy,
    handshake_attempts: usize,
    handshake_delay:    Duration,
    rate_limit_margin:  Duration,
    sessions:           Mutex<HashMap<Key, Slot<B::Session>>>,
}

impl<B: BlobBackend> SessionPool<B> {
    pub fn new(backend: Arc<B>, config: &DownloaderConfig) -> Self {
        Self {
            backend,
            open_policy: config.session_policy(),
            handshake_attempts: config.handshake_attempts.max(1),
            handshake_delay: std_duration(config.handshake_delay),
            rate_limit_margin: std_duration(config.rate_limit_margin),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for `(worker, datacenter)`, creating it if
    /// needed. Concurrent callers for the same key wait on one creation.
    pub async fn acquire(
        &self,
        worker: &Worker,
        datacenter: DatacenterId,
    ) -> Result<Arc<B::Session>, SessionError> {
        let key = (worker.id(), datacenter);
        let slot = Arc::clone(self.lock().entry(key).or_default());

        match slot.get_or_try_init(|| self.create(worker, datacenter)).await {
            Ok(session) => Ok(Arc::clone(session)),
            Err(err) => {
                let mut sessions = self.lock();
                if sessions
                    .get(&key)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized())
                {
                    sessions.remove(&key);
                }
                Err(err)
            }
        }
    }

    /// Close and forget the session for `(worker, datacenter)`. The next
    /// `acquire` opens a new one.
    pub async fn invalidate(&self, worker: WorkerId, datacenter: DatacenterId) {
        let removed = self.lock().remove(&(worker, datacenter));
        if let Some(session) = removed.and_then(|slot| slot.get().cloned()) {
            info!(%worker, %datacenter, "dropping invalidated session");
            self.backend.close_session(&session).await;
        }
    }

    /// Close every pooled session.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for ((worker, datacenter), slot) in drained {
            if let Some(session) = slot.get() {
                debug!(%worker, %datacenter, "closing session");
                self.backend.close_session(session).await;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize { self.lock().values().filter(|slot| slot.initialized()).count() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Slot<B::Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn create(&self, worker: &Worker, datacenter: DatacenterId) -> Result<Arc<B::Session>, SessionError> {
        let auth = if datacenter == worker.home_datacenter() {
            SessionAuth::Home
        } else {
            SessionAuth::Fresh
        };
        info!(worker = %worker.id(), %datacenter, %auth, "opening session");

        let session = self
            .open_policy
            .run(|| self.backend.open_session(worker, datacenter, auth))
            .await
            .context(OpenSnafu)?;

        let session = Arc::new(session);
        if auth == SessionAuth::Fresh {
            let guard = CloseOnDrop::new(&self.backend, &session);
            let handshake = self.handshake(worker, datacenter, &session).await;
            guard.disarm();
            if let Err(err) = handshake {
                self.backend.close_session(&session).await;
                return Err(err);
            }
        }

        Ok(session)
    }

    /// Export the worker's authorization and import it into `session`,
    /// retrying with a fixed delay, or the requested wait when rate limited.
    async fn handshake(
        &self,
        worker: &Worker,
        datacenter: DatacenterId,
        session: &B::Session,
    ) -> Result<(), SessionError> {
        let attempts = AtomicUsize::new(0);
        let backoff = ConstantBuilder::default()
            .with_delay(self.handshake_delay)
            .with_max_times(self.handshake_attempts - 1);

        let attempts = &attempts;
        (|| async move {
            attempts.fetch_add(1, Ordering::Relaxed);
            let exported = self.backend.export_auth(worker, datacenter).await?;
            self.backend.import_auth(session, exported).await
        })
        .retry(backoff)
        .when(|err| !matches!(err, BackendError::Unexpected { .. }))
        .adjust(|err, delay| match err {
            BackendError::RateLimited { wait } => delay.map(|_| *wait + self.rate_limit_margin),
            _ => delay,
        })
        .notify(|err, delay| {
            warn!(worker = %worker.id(), %datacenter, error = %err, ?delay, "authorization import failed, retrying");
        })
        .await
        .map_err(|source| SessionError::Handshake {
            attempts: attempts.load(Ordering::Relaxed),
            source,
        })
    }
}

/// Closes a session in the background if the future authorising it is
/// dropped before it finishes.
struct CloseOnDrop<B: BlobBackend> {
    backend: Arc<B>,
    session: Option<Arc<B::Session>>,
}

impl<B: BlobBackend> CloseOnDrop<B> {
    fn new(backend: &Arc<B>, session: &Arc<B::Session>) -> Self {
        Self {
            backend: Arc::clone(backend),
            session: Some(Arc::clone(session)),
        }
    }

    fn disarm(mut self) { self.session = None; }
}

impl<B: BlobBackend> Drop for CloseOnDrop<B> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            debug!("session creation abandoned, closing the half-open session");
            let backend = Arc::clone(&self.backend);
            handle.spawn(async move { backend.close_session(&session).await });
        }
    }
}
