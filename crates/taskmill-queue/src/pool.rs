//! Worker pool
//!
//! Bounded-capacity pool of queue workers. Idle workers are reused in FIFO
//! order and reaped after an idle timeout; acquiring an idle worker cancels
//! its reaper. Shutdown is non-preemptive: busy workers are never
//! interrupted, callers await graceful completion.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use taskmill_storage::TaskStore;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::functions::FunctionRegistry;
use crate::hooks::HookRegistry;
use crate::worker::QueueWorker;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub total_workers: usize,
    pub pending_timeouts: usize,
}

struct PoolState {
    idle: VecDeque<Arc<QueueWorker>>,
    busy: HashMap<String, Arc<QueueWorker>>,
    idle_timers: HashMap<String, JoinHandle<()>>,
}

struct PoolInner {
    max_workers: usize,
    idle_timeout: Duration,
    store: Arc<dyn TaskStore>,
    hooks: Arc<HookRegistry>,
    functions: Arc<FunctionRegistry>,
    state: Mutex<PoolState>,
}

/// Pool of queue workers with idle-timeout reaping.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        max_workers: usize,
        idle_timeout: Duration,
        store: Arc<dyn TaskStore>,
        hooks: Arc<HookRegistry>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        info!(max_workers, "worker pool initialized");
        Self {
            inner: Arc::new(PoolInner {
                max_workers: max_workers.max(1),
                idle_timeout,
                store,
                hooks,
                functions,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    busy: HashMap::new(),
                    idle_timers: HashMap::new(),
                }),
            }),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Get a worker, preferring an idle one; create a new worker while
    /// under capacity; `None` when the pool is saturated.
    pub fn get_available_worker(&self) -> Option<Arc<QueueWorker>> {
        let mut state = self.inner.state.lock();

        if let Some(worker) = state.idle.pop_front() {
            if let Some(timer) = state.idle_timers.remove(worker.worker_id()) {
                timer.abort();
            }
            debug!(worker_id = %worker.worker_id(), "reusing idle worker");
            state.busy.insert(worker.worker_id().to_string(), Arc::clone(&worker));
            return Some(worker);
        }

        let total = state.busy.len() + state.idle.len();
        if total < self.inner.max_workers {
            let worker_id = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
            let worker = Arc::new(QueueWorker::new(
                worker_id.clone(),
                Arc::clone(&self.inner.store),
                Arc::clone(&self.inner.hooks),
                Arc::clone(&self.inner.functions),
            ));
            state.busy.insert(worker_id.clone(), Arc::clone(&worker));
            info!(
                worker_id = %worker_id,
                total = total + 1,
                max = self.inner.max_workers,
                "created new worker"
            );
            return Some(worker);
        }

        debug!(max = self.inner.max_workers, "worker pool saturated");
        None
    }

    /// Return a worker to the idle pool and arm its idle timeout.
    pub fn return_worker(&self, worker: Arc<QueueWorker>) {
        let worker_id = worker.worker_id().to_string();
        let mut state = self.inner.state.lock();
        state.busy.remove(&worker_id);
        state.idle.push_back(worker);

        let weak = Arc::downgrade(&self.inner);
        let timer_id = worker_id.clone();
        let timeout = self.inner.idle_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                if state.idle_timers.remove(&timer_id).is_some() {
                    state.idle.retain(|w| w.worker_id() != timer_id);
                    info!(worker_id = %timer_id, "worker removed after idle timeout");
                }
            }
        });
        state.idle_timers.insert(worker_id.clone(), handle);

        debug!(
            worker_id = %worker_id,
            timeout_s = self.inner.idle_timeout.as_secs(),
            "worker returned to idle pool"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            max_workers: self.inner.max_workers,
            busy_workers: state.busy.len(),
            idle_workers: state.idle.len(),
            total_workers: state.busy.len() + state.idle.len(),
            pending_timeouts: state.idle_timers.len(),
        }
    }

    /// Cancel every idle timeout and drain both collections. Busy workers
    /// keep their own handles and finish on their own.
    pub fn shutdown(&self) {
        info!("shutting down worker pool");
        let mut state = self.inner.state.lock();
        for (_, timer) in state.idle_timers.drain() {
            timer.abort();
        }
        state.idle.clear();
        state.busy.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_workers: usize, idle_timeout: Duration) -> WorkerPool {
        WorkerPool::new(
            max_workers,
            idle_timeout,
            Arc::new(taskmill_storage::InMemoryTaskStore::new()) as Arc<dyn TaskStore>,
            Arc::new(HookRegistry::new()),
            Arc::new(FunctionRegistry::new()),
        )
    }

    #[tokio::test]
    async fn creates_up_to_capacity_then_saturates() {
        let pool = pool(2, Duration::from_secs(60));

        let a = pool.get_available_worker().unwrap();
        let b = pool.get_available_worker().unwrap();
        assert_ne!(a.worker_id(), b.worker_id());
        assert!(pool.get_available_worker().is_none());

        let stats = pool.stats();
        assert_eq!(stats.busy_workers, 2);
        assert_eq!(stats.idle_workers, 0);
        assert_eq!(stats.total_workers, 2);
    }

    #[tokio::test]
    async fn returned_worker_is_reused() {
        let pool = pool(1, Duration::from_secs(60));

        let worker = pool.get_available_worker().unwrap();
        let id = worker.worker_id().to_string();
        pool.return_worker(worker);

        let stats = pool.stats();
        assert_eq!(stats.idle_workers, 1);
        assert_eq!(stats.pending_timeouts, 1);

        let again = pool.get_available_worker().unwrap();
        assert_eq!(again.worker_id(), id);
        assert_eq!(pool.stats().pending_timeouts, 0);
    }

    #[tokio::test]
    async fn idle_timeout_reaps_worker() {
        let pool = pool(1, Duration::from_millis(30));

        let worker = pool.get_available_worker().unwrap();
        pool.return_worker(worker);
        assert_eq!(pool.stats().idle_workers, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let stats = pool.stats();
        assert_eq!(stats.idle_workers, 0);
        assert_eq!(stats.total_workers, 0);
        assert_eq!(stats.pending_timeouts, 0);

        // The pool can grow again after the reap.
        assert!(pool.get_available_worker().is_some());
    }

    #[tokio::test]
    async fn reacquire_cancels_idle_timeout() {
        let pool = pool(1, Duration::from_millis(30));

        let worker = pool.get_available_worker().unwrap();
        pool.return_worker(worker);
        let worker = pool.get_available_worker().unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Still busy; the reaper must not have removed it.
        assert_eq!(pool.stats().busy_workers, 1);
        pool.return_worker(worker);
    }

    #[tokio::test]
    async fn shutdown_drains_collections() {
        let pool = pool(3, Duration::from_secs(60));

        let a = pool.get_available_worker().unwrap();
        let b = pool.get_available_worker().unwrap();
        pool.return_worker(a);
        drop(b);

        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.total_workers, 0);
        assert_eq!(stats.pending_timeouts, 0);
    }
}
