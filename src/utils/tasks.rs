use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Background Tasks
// ============================================================================
//
// Owned periodic loops with a shutdown handle. No iteration starts after
// shutdown is signalled. What happens to the one in flight depends on how
// the loop was spawned:
// - spawn_periodic: raced against the signal and dropped (probes, janitors)
// - spawn_draining: runs to completion; the work polls `is_stopping` to cut
//   itself short without abandoning anything it has claimed
//
// ============================================================================

pub struct BackgroundTasks {
    owner: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new(owner: &'static str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            owner,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `work` every `period` until shutdown, cancelling the iteration
    /// in flight
    pub fn spawn_periodic<F, Fut>(&self, task: &'static str, period: Duration, work: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_loop(task, period, false, work);
    }

    /// Run `work` every `period` until shutdown, letting the iteration in
    /// flight finish
    pub fn spawn_draining<F, Fut>(&self, task: &'static str, period: Duration, work: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_loop(task, period, true, work);
    }

    /// True once shutdown has been signalled
    pub fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn spawn_loop<F, Fut>(&self, task: &'static str, period: Duration, drain: bool, mut work: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if *self.shutdown_tx.borrow() {
            tracing::warn!(owner = self.owner, task, "Not spawning task after shutdown");
            return;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let owner = self.owner;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::debug!(
                owner,
                task,
                period_ms = period.as_millis() as u64,
                drain,
                "Background task started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if drain {
                            work().await;
                        } else {
                            tokio::select! {
                                _ = shutdown_rx.changed() => break,
                                _ = work() => {}
                            }
                        }
                    }
                }
            }

            tracing::info!(owner, task, "Background task shutting down");
        });

        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub fn running(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Signal every loop and wait for them to exit
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!(owner = self.owner, error = %e, "Background task panicked");
                }
            }
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_periodic_task_runs_until_shutdown() {
        let tasks = BackgroundTasks::new("test");
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();

        tasks.spawn_periodic("counter", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        tasks.shutdown().await;
        let after_shutdown = ticks.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2);
        assert_eq!(tasks.running(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_iteration() {
        let tasks = BackgroundTasks::new("test");
        tasks.spawn_periodic("stuck", Duration::from_millis(1), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(1), tasks.shutdown())
            .await
            .expect("shutdown should not wait for the stuck iteration");
    }

    #[tokio::test]
    async fn test_draining_task_finishes_in_flight_iteration() {
        let tasks = Arc::new(BackgroundTasks::new("test"));
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));
        let (s, f) = (started.clone(), finished.clone());

        tasks.spawn_draining("slow", Duration::from_millis(1), move || {
            let (s, f) = (s.clone(), f.clone());
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tasks.shutdown().await;
        assert!(tasks.is_stopping());
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stopping_without_any_spawned_loop() {
        let tasks = BackgroundTasks::new("test");
        tasks.shutdown().await;
        assert!(tasks.is_stopping());

        tasks.spawn_periodic("late", Duration::from_millis(1), || async {});
        assert_eq!(tasks.running(), 0);
    }
}
