// ── Background task supervisor ──
//
// Owns every long-running task of a started fleet under one
// cancellation token, so the whole set starts and stops as a unit.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Supervisor {
    cancel: CancellationToken,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token observed by every supervised task. Cancelled on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn task_count(&self) -> usize {
        self.lock().len()
    }

    /// Run a future until it finishes or the supervisor shuts down.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = task => {}
            }
        });
        self.lock().push((name, handle));
    }

    /// Call `tick` every `period`, skipping the immediate first tick.
    /// A zero period disables the task.
    pub fn spawn_periodic<F>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            debug!(task = name, "periodic task disabled");
            return;
        }

        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        tracing::trace!(task = name, "tick");
                        tick();
                    }
                }
            }
        });
        debug!(task = name, period = %humantime::format_duration(period), "periodic task started");
        self.lock().push((name, handle));
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.lock().drain(..).collect();
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "background task panicked");
            }
        }
        debug!("supervisor stopped");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(&'static str, JoinHandle<()>)>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn periodic_task_ticks_until_shutdown() {
        let supervisor = Supervisor::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        supervisor.spawn_periodic("count", Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        supervisor.shutdown().await;
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.task_count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_period_is_disabled() {
        let supervisor = Supervisor::new();
        supervisor.spawn_periodic("never", Duration::ZERO, || {});
        assert_eq!(supervisor.task_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_long_running_tasks() {
        let supervisor = Supervisor::new();
        supervisor.spawn("forever", std::future::pending());
        assert_eq!(supervisor.task_count(), 1);
        supervisor.shutdown().await;
        assert_eq!(supervisor.task_count(), 0);
    }
}
