use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::error::BoxError;

/// Tracked fire-and-forget work, such as email delivery.
///
/// Every job is registered before it starts and deregistered when it
/// finishes, fails or panics, so the shutdown coordinator can wait for the
/// set to empty.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F, E>(&self, name: &'static str, job: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.tracker.spawn(async move {
            match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    let err: BoxError = err.into();
                    error!(task = name, error = %err, "background task failed");
                }
                Err(panic) => {
                    error!(task = name, panic = %panic_message(&*panic), "background task panicked");
                }
            }
        });
    }

    pub fn outstanding(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting the notion of "more work later" and wait for every
    /// tracked job to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        let outstanding = self.tracker.len();
        if outstanding > 0 {
            info!(outstanding, "waiting for background tasks");
        }
        self.tracker.wait().await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_jobs() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for delay in [1, 2, 3] {
            let done = done.clone();
            tasks.spawn("sleepy", async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            });
        }
        assert_eq!(tasks.outstanding(), 3);

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_contained() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("fails", async { Err::<(), _>("boom") });
        tasks.spawn("panics", async {
            panic!("kaboom");
            #[allow(unreachable_code)]
            Ok::<_, BoxError>(())
        });

        tasks.drain().await;
        assert_eq!(tasks.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_stuck_jobs() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("stuck", async {
            std::future::pending::<()>().await;
            Ok::<_, BoxError>(())
        });

        assert!(tokio::time::timeout(Duration::from_secs(5), tasks.drain()).await.is_err());
        assert_eq!(tasks.outstanding(), 1);
    }
}
