//! Bounded in-process worker pools with caller-runs overflow.
//!
//! Scans enqueue reconciliation and republish work here. When both the
//! workers and the queue are full, the submitting task runs the work inline,
//! which throttles the scan to the pool's pace.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Stand-in capacity when a bound is left unset.
const UNBOUNDED: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct TaskPool {
    name: &'static str,
    workers: Arc<Semaphore>,
    queue_slots: Arc<Semaphore>,
    worker_limit: usize,
}

impl TaskPool {
    /// `max_workers` bounds concurrent tasks, `queue_capacity` bounds tasks
    /// parked waiting for a worker. `None` means unbounded.
    pub fn new(name: &'static str, max_workers: Option<usize>, queue_capacity: Option<usize>) -> Self {
        let worker_limit = max_workers.unwrap_or(UNBOUNDED).max(1);
        let queue_limit = queue_capacity.unwrap_or(UNBOUNDED);
        Self {
            name,
            workers: Arc::new(Semaphore::new(worker_limit)),
            queue_slots: Arc::new(Semaphore::new(queue_limit)),
            worker_limit,
        }
    }

    /// Run `task` on the pool, or inline when the pool is saturated.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(worker) = Arc::clone(&self.workers).try_acquire_owned() {
            tokio::spawn(async move {
                task.await;
                drop(worker);
            });
            return;
        }
        if let Ok(slot) = Arc::clone(&self.queue_slots).try_acquire_owned() {
            let workers = Arc::clone(&self.workers);
            tokio::spawn(async move {
                let worker = workers.acquire_owned().await;
                drop(slot);
                task.await;
                drop(worker);
            });
            return;
        }
        tracing::debug!(pool = self.name, "pool saturated, running task inline");
        task.await;
    }

    /// Wait until every accepted task has finished. New submissions after
    /// this resolves would race it; callers stop submitting first.
    pub async fn drain(&self) {
        let all = u32::try_from(self.worker_limit).unwrap_or(u32::MAX);
        if let Ok(permits) = self.workers.acquire_many(all).await {
            drop(permits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn tasks_run_concurrently_up_to_the_worker_limit() {
        let pool = TaskPool::new("test", Some(2), Some(0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }

        pool.drain().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn saturation_runs_the_task_inline() {
        let pool = TaskPool::new("test", Some(1), Some(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let held = Arc::clone(&gate);
        pool.submit(async move {
            held.notified().await;
        })
        .await;

        // Worker and queue are both full: this submit must complete the task
        // before returning.
        let ran_inline = Arc::new(AtomicUsize::new(0));
        let marker = Arc::clone(&ran_inline);
        pool.submit(async move {
            marker.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(ran_inline.load(Ordering::SeqCst), 1);

        gate.notify_one();
        pool.drain().await;
    }

    #[tokio::test]
    async fn queued_tasks_wait_for_a_worker() {
        let pool = TaskPool::new("test", Some(1), Some(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());

        let (order1, gate1) = (Arc::clone(&order), Arc::clone(&gate));
        pool.submit(async move {
            gate1.notified().await;
            order1.lock().await.push("first");
        })
        .await;

        let order2 = Arc::clone(&order);
        pool.submit(async move {
            order2.lock().await.push("second");
        })
        .await;

        gate.notify_one();
        pool.drain().await;
        assert_eq!(*order.lock().await, vec!["first", "second"]);
    }
}
