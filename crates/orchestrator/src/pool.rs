//! Bounded fan-out for per-node work within a phase.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const DEFAULT_PARALLELISM: usize = 4;

/// Runs tasks on a [`JoinSet`] with at most `parallelism` executing at once.
///
/// Results come back in spawn order, so callers can report per-node
/// outcomes in topology order regardless of completion order.
pub struct NodeTaskSet<T> {
    semaphore: Arc<Semaphore>,
    set: JoinSet<(usize, T)>,
    spawned: usize,
}

impl<T: Send + 'static> NodeTaskSet<T> {
    pub fn new(parallelism: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
            set: JoinSet::new(),
            spawned: 0,
        }
    }

    /// Queue a task; it starts once a permit is free.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let index = self.spawned;
        self.spawned += 1;
        let semaphore = Arc::clone(&self.semaphore);

        self.set.spawn(async move {
            // Never closed, so acquire only fails if the set itself is gone.
            let _permit = semaphore.acquire_owned().await.ok();
            (index, task.await)
        });
    }

    /// Wait for every task and return the outputs in spawn order.
    ///
    /// A panic inside a task is resumed on the caller.
    pub async fn join_all(mut self) -> Vec<T> {
        let mut results = Vec::with_capacity(self.spawned);
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, output)| output).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_results_in_spawn_order() {
        let mut tasks = NodeTaskSet::new(4);
        for (i, delay) in [30u64, 10, 20].into_iter().enumerate() {
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                i
            });
        }

        assert_eq!(tasks.join_all().await, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = NodeTaskSet::new(2);

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        tasks.join_all().await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_parallelism_still_runs() {
        let mut tasks = NodeTaskSet::new(0);
        tasks.spawn(async { 7 });
        assert_eq!(tasks.join_all().await, vec![7]);
    }
}
