//! Bounded worker pool.
//!
//! A semaphore caps how many documents are in flight; finished tasks are
//! collected from a [`JoinSet`]. Consumer and batch mode share it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, warn};

pub struct WorkerPool<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<T>,
    concurrency: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            tasks: JoinSet::new(),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Tasks spawned and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for a free slot. `None` once the pool is closed.
    pub async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Stop handing out slots; running tasks are unaffected.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Run `task` in a reserved slot; the slot frees when the task ends.
    pub fn spawn_reserved<F>(&mut self, permit: OwnedSemaphorePermit, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
    }

    /// Wait for a free slot, then run `task` in it. Returns `false` without
    /// running it if the pool is closed.
    pub async fn spawn<F>(&mut self, task: F) -> bool
    where
        F: Future<Output = T> + Send + 'static,
    {
        match self.reserve().await {
            Some(permit) => {
                self.spawn_reserved(permit, task);
                true
            }
            None => false,
        }
    }

    /// Outputs of tasks that already finished.
    pub fn collect_finished(&mut self) -> Vec<T> {
        let mut done = Vec::new();
        while let Some(joined) = self.tasks.try_join_next() {
            if let Some(output) = unpack(joined) {
                done.push(output);
            }
        }
        done
    }

    /// Wait for every task.
    pub async fn join_all(&mut self) -> Vec<T> {
        let mut done = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(output) = unpack(joined) {
                done.push(output);
            }
        }
        done
    }

    /// Wait up to `limit` for every task. Whatever is still running
    /// afterwards stays in the pool.
    pub async fn drain_within(&mut self, limit: Duration) -> Vec<T> {
        let mut done = Vec::new();
        let _ = tokio::time::timeout(limit, async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Some(output) = unpack(joined) {
                    done.push(output);
                }
            }
        })
        .await;
        done
    }

    /// Abort every remaining task. Returns how many were aborted.
    pub async fn abort_all(&mut self) -> usize {
        let remaining = self.tasks.len();
        if remaining > 0 {
            warn!(remaining, "aborting unfinished tasks");
        }
        self.tasks.shutdown().await;
        remaining
    }
}

fn unpack<T>(joined: Result<T, tokio::task::JoinError>) -> Option<T> {
    match joined {
        Ok(output) => Some(output),
        Err(e) if e.is_cancelled() => None,
        Err(e) => {
            error!(error = %e, "worker task panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn caps_concurrency() {
        let mut pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                i
            })
            .await;
        }

        let mut out = pool.join_all().await;
        out.sort();
        assert_eq!(out, (0..8).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn zero_concurrency_means_one() {
        let pool: WorkerPool<()> = WorkerPool::new(0);
        assert_eq!(pool.concurrency(), 1);
    }

    #[tokio::test]
    async fn drain_leaves_slow_tasks_then_abort() {
        let mut pool = WorkerPool::new(2);
        pool.spawn(async { "fast" }).await;
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            "slow"
        })
        .await;

        let done = pool.drain_within(Duration::from_millis(200)).await;
        assert_eq!(done, vec!["fast"]);
        assert_eq!(pool.in_flight(), 1);

        assert_eq!(pool.abort_all().await, 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_task_is_dropped() {
        let mut pool = WorkerPool::new(1);
        pool.spawn(async {
            let fail = true;
            if fail {
                panic!("boom");
            }
            0
        })
        .await;
        pool.spawn(async { 7 }).await;
        assert_eq!(pool.join_all().await, vec![7]);
    }

    #[tokio::test]
    async fn closed_pool_refuses_work() {
        let mut pool = WorkerPool::new(1);
        pool.close();
        assert!(!pool.spawn(async { 1 }).await);
        assert!(pool.join_all().await.is_empty());
    }
}
