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
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Receives `(processed, total)` byte counts while a download runs.
///
/// Called from the progress reporter task, never from a part. A slow sink
/// delays the next report but not the download.
pub trait ProgressSink: Send + Sync + 'static {
    fn on_progress(&self, processed: u64, total: u64);
}

impl ProgressSink for () {
    fn on_progress(&self, _processed: u64, _total: u64) {}
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync + 'static,
{
    fn on_progress(&self, processed: u64, total: u64) { self(processed, total) }
}

/// Byte counter shared by all parts of one download.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProgressCounter(Arc<AtomicU64>);

impl ProgressCounter {
    pub(crate) fn add(&self, bytes: u64) { self.0.fetch_add(bytes, Ordering::Relaxed); }

    pub(crate) fn get(&self) -> u64 { self.0.load(Ordering::Relaxed) }
}

/// Report the counter every `period` until `stop` fires.
pub(crate) async fn report<S: ProgressSink>(
    sink: Arc<S>,
    counter: ProgressCounter,
    total: u64,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => sink.on_progress(counter.get().min(total), total),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reports_until_stopped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |processed: u64, total: u64| seen.lock().unwrap().push((processed, total))
        };
        let counter = ProgressCounter::default();
        let stop = CancellationToken::new();
        let reporter = tokio::spawn(report(
            Arc::new(sink),
            counter.clone(),
            100,
            Duration::from_secs(1),
            stop.clone(),
        ));

        counter.add(40);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        counter.add(80);
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.cancel();
        reporter.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(40, 100), (100, 100)]);
    }
}
