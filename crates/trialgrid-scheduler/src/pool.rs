//! Worker pools — bounded execution of dispatched transitions.
//!
//! A pool is a semaphore in front of `tokio::spawn`. Every submitted task
//! becomes its own tokio task, but only `limit` of them run at once; the
//! rest wait for a permit in FIFO order. Delayed submissions sleep before
//! they queue for a permit, so a pending warm-up window never holds a
//! worker.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use trialgrid_core::{PoolSizeConfig, TrialId};

use crate::error::{TrialError, TrialResult};

/// Handle to a submitted task's eventual result.
pub type TaskHandle = JoinHandle<TrialResult<TrialId>>;

/// Core and maximum size of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    pub core: usize,
    pub max: usize,
}

impl PoolSize {
    /// Number of tasks allowed to run concurrently.
    pub fn limit(&self) -> usize {
        self.core.min(self.max).max(1)
    }
}

impl From<&PoolSizeConfig> for PoolSize {
    fn from(cfg: &PoolSizeConfig) -> Self {
        Self {
            core: cfg.core_size,
            max: cfg.max_size,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Tasks currently holding a worker.
    pub active: usize,
    /// Tasks waiting for a worker or for their delay to elapse.
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub limit: usize,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

/// A bounded, resizable pool of workers.
pub struct WorkerPool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    size: Mutex<PoolSize>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: PoolSize) -> Self {
        info!(pool = name, core = size.core, max = size.max, "worker pool created");
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(size.limit())),
            size: Mutex::new(size),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> PoolSize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the core size. Applies to work submitted from now on;
    /// running tasks are never interrupted.
    pub fn set_core_pool_size(&self, core: usize) {
        self.resize(|size| size.core = core);
    }

    /// Change the maximum size. Same semantics as `set_core_pool_size`.
    pub fn set_max_pool_size(&self, max: usize) {
        self.resize(|size| size.max = max);
    }

    fn resize(&self, change: impl FnOnce(&mut PoolSize)) {
        let (old, new) = {
            let mut size = self.size.lock().unwrap_or_else(|e| e.into_inner());
            let old = size.limit();
            change(&mut size);
            (old, size.limit())
        };

        if new > old {
            self.semaphore.add_permits(new - old);
        } else if new < old {
            self.shrink((old - new) as u32);
        }
        info!(pool = self.name, from = old, to = new, "worker pool resized");
    }

    /// Retire `surplus` permits. Idle permits go right away; the rest are
    /// taken as running tasks release them.
    fn shrink(&self, surplus: u32) {
        if let Ok(permits) = self.semaphore.try_acquire_many(surplus) {
            permits.forget();
            return;
        }
        let semaphore = Arc::clone(&self.semaphore);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                        permits.forget();
                    }
                });
            }
            Err(_) => warn!(pool = self.name, "no runtime, pool shrink deferred"),
        }
    }

    /// Run `task` as soon as a worker is free.
    pub fn submit<F>(&self, task: F) -> TaskHandle
    where
        F: Future<Output = TrialResult<TrialId>> + Send + 'static,
    {
        self.submit_after(Duration::ZERO, task)
    }

    /// Run `task` once `delay` has elapsed and a worker is free.
    pub fn submit_after<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: Future<Output = TrialResult<TrialId>> + Send + 'static,
    {
        let name = self.name;
        let semaphore = Arc::clone(&self.semaphore);
        let counters = Arc::clone(&self.counters);
        counters.queued.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let permit = semaphore.acquire_owned().await;
            counters.queued.fetch_sub(1, Ordering::SeqCst);
            let Ok(_permit) = permit else {
                return Err(TrialError::PoolClosed(name));
            };

            counters.active.fetch_add(1, Ordering::SeqCst);
            let result = task.await;
            counters.active.fetch_sub(1, Ordering::SeqCst);

            match &result {
                Ok(trial) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                    debug!(pool = name, %trial, "task finished");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(pool = name, error = %e, "task failed");
                }
            }
            result
        })
    }

    /// Stop handing out workers. Tasks still waiting fail with `PoolClosed`.
    pub fn close(&self) {
        self.semaphore.close();
        info!(pool = self.name, "worker pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.counters.active.load(Ordering::SeqCst),
            queued: self.counters.queued.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst) as u64,
            failed: self.counters.failed.load(Ordering::SeqCst) as u64,
            limit: self.size().limit(),
        }
    }
}

/// The two pools the pipeline dispatches onto.
pub struct WorkerPools {
    pub regular: WorkerPool,
    pub scheduled: WorkerPool,
}

impl WorkerPools {
    pub fn new(regular: PoolSize, scheduled: PoolSize) -> Self {
        Self {
            regular: WorkerPool::new("regular", regular),
            scheduled: WorkerPool::new("scheduled", scheduled),
        }
    }

    pub fn close(&self) {
        self.regular.close();
        self.scheduled.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    fn size(core: usize, max: usize) -> PoolSize {
        PoolSize { core, max }
    }

    #[test]
    fn limit_is_core_clamped_to_max() {
        assert_eq!(size(4, 8).limit(), 4);
        assert_eq!(size(8, 4).limit(), 4);
        assert_eq!(size(0, 4).limit(), 1);
    }

    #[tokio::test]
    async fn submit_returns_result() {
        let pool = WorkerPool::new("test", size(1, 1));
        let ok = pool.submit(async { Ok("t1".to_string()) });
        assert_eq!(ok.await.unwrap(), Ok("t1".to_string()));

        let err = pool.submit(async { Err(TrialError::UnknownTrial("t2".to_string())) });
        assert_eq!(
            err.await.unwrap(),
            Err(TrialError::UnknownTrial("t2".to_string()))
        );

        let stats = pool.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
    }

    /// Spawn `n` tasks that block on `gate`, tracking peak concurrency.
    async fn run_blocked(pool: &WorkerPool, n: usize) -> (Arc<AtomicUsize>, Arc<Notify>, Vec<TaskHandle>) {
        let running = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let mut handles = Vec::new();
        for i in 0..n {
            let running = Arc::clone(&running);
            let gate = Arc::clone(&gate);
            handles.push(pool.submit(async move {
                running.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(format!("t{i}"))
            }));
        }
        // Let the admitted tasks reach the gate.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        (running, gate, handles)
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_core() {
        let pool = WorkerPool::new("test", size(2, 4));
        let (running, gate, _handles) = run_blocked(&pool, 5).await;

        assert_eq!(running.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().active, 2);
        assert_eq!(pool.stats().queued, 3);

        // Release one; a queued task takes its worker.
        gate.notify_one();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.stats().completed, 1);
        assert_eq!(running.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().queued, 2);
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn growing_core_admits_more_work() {
        let pool = WorkerPool::new("test", size(1, 4));
        let (running, gate, _handles) = run_blocked(&pool, 3).await;
        assert_eq!(running.load(Ordering::SeqCst), 1);

        pool.set_core_pool_size(3);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(running.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().limit, 3);
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn shrinking_max_limits_later_submissions() {
        let pool = WorkerPool::new("test", size(3, 3));
        pool.set_max_pool_size(1);
        assert_eq!(pool.size(), size(3, 1));
        assert_eq!(pool.stats().limit, 1);

        let (running, gate, _handles) = run_blocked(&pool, 3).await;
        assert_eq!(running.load(Ordering::SeqCst), 1);
        gate.notify_waiters();
    }

    #[tokio::test(start_paused = true)]
    async fn submit_after_waits_for_delay() {
        let pool = WorkerPool::new("test", size(1, 1));
        let started = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&started);
        let handle = pool.submit_after(Duration::from_secs(30), async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok("t1".to_string())
        });

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().queued, 1);

        assert_eq!(handle.await.unwrap(), Ok("t1".to_string()));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let pool = WorkerPool::new("test", size(1, 1));
        pool.close();
        let result = pool.submit(async { Ok("t1".to_string()) }).await.unwrap();
        assert_eq!(result, Err(TrialError::PoolClosed("test")));
        assert_eq!(pool.stats().queued, 0);
    }
}
