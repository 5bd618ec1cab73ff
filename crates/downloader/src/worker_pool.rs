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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{Worker, WorkerId, WorkerIdentity};

/// Fixed set of workers with an in-flight workload counter each.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
    loads:   Mutex<Vec<usize>>,
}

impl WorkerPool {
    pub fn new(workers: impl IntoIterator<Item = Worker>) -> Self {
        let workers: Vec<Worker> = workers.into_iter().collect();
        let loads = Mutex::new(vec![0; workers.len()]);
        Self { workers, loads }
    }

    pub fn from_identities<'a, I>(identities: impl IntoIterator<Item = &'a I>) -> Self
    where
        I: WorkerIdentity + ?Sized + 'a,
    {
        Self::new(identities.into_iter().map(Worker::from_identity))
    }

    #[must_use]
    pub fn len(&self) -> usize { self.workers.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.workers.is_empty() }

    #[must_use]
    pub fn workers(&self) -> &[Worker] { &self.workers }

    /// Lease the least loaded worker; ties go to the lowest index.
    ///
    /// Returns `None` when the pool is empty.
    #[must_use]
    pub fn select(self: &Arc<Self>) -> Option<WorkerLease> {
        let mut loads = self.lock();
        let (index, _) = loads.iter().enumerate().min_by_key(|&(i, load)| (*load, i))?;
        loads[index] += 1;
        drop(loads);

        Some(WorkerLease {
            pool: Arc::clone(self),
            index,
        })
    }

    /// Snapshot of current loads, in pool order.
    #[must_use]
    pub fn loads(&self) -> Vec<(WorkerId, usize)> {
        let loads = self.lock();
        self.workers.iter().map(Worker::id).zip(loads.iter().copied()).collect()
    }

    #[must_use]
    pub fn load_of(&self, id: WorkerId) -> Option<usize> {
        let index = self.workers.iter().position(|w| w.id() == id)?;
        Some(self.lock()[index])
    }

    fn release(&self, index: usize) {
        let mut loads = self.lock();
        loads[index] = loads[index].saturating_sub(1);
    }

    // Counters stay consistent even if a holder panicked mid-update.
    fn lock(&self) -> MutexGuard<'_, Vec<usize>> { self.loads.lock().unwrap_or_else(PoisonError::into_inner) }
}

/// A worker checked out of a [`WorkerPool`]. Dropping it releases the load.
#[derive(Debug)]
pub struct WorkerLease {
    pool:  Arc<WorkerPool>,
    index: usize,
}

impl WorkerLease {
    #[must_use]
    pub fn worker(&self) -> &Worker { &self.pool.workers[self.index] }

    #[must_use]
    pub fn id(&self) -> WorkerId { self.worker().id() }
}

impl Drop for WorkerLease {
    fn drop(&mut self) { self.pool.release(self.index); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DatacenterId;

    fn pool(n: u32) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            (0..n).map(|i| Worker::new(WorkerId(i), format!("w{i}"), DatacenterId(1))),
        ))
    }

    #[test]
    fn test_select_spreads_evenly() {
        let pool = pool(3);
        let leases: Vec<_> = (0..7).filter_map(|_| pool.select()).collect();
        let ids: Vec<u32> = leases.iter().map(|l| l.id().0).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2, 0]);

        let loads: Vec<usize> = pool.loads().into_iter().map(|(_, load)| load).collect();
        assert_eq!(loads, vec![3, 2, 2]);
        let spread = loads.iter().max().unwrap() - loads.iter().min().unwrap();
        assert!(spread <= 1);
    }

    #[test]
    fn test_release_on_drop() {
        let pool = pool(2);
        let a = pool.select().unwrap();
        let b = pool.select().unwrap();
        assert_eq!(pool.load_of(WorkerId(0)), Some(1));
        drop(a);
        assert_eq!(pool.load_of(WorkerId(0)), Some(0));
        // freed worker is preferred again
        let c = pool.select().unwrap();
        assert_eq!(c.id(), WorkerId(0));
        drop(b);
        drop(c);
        assert!(pool.loads().iter().all(|(_, load)| *load == 0));
    }

    #[test]
    fn test_release_on_panic() {
        let pool = pool(1);
        let p = Arc::clone(&pool);
        let result = std::thread::spawn(move || {
            let _lease = p.select().unwrap();
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(pool.load_of(WorkerId(0)), Some(0));
    }

    #[test]
    fn test_empty_pool() {
        let pool = pool(0);
        assert!(pool.select().is_none());
        assert!(pool.is_empty());
    }
}
