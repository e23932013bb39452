//! Graceful shutdown.
//!
//! The server moves through three phases: `Serving`, `Draining` and
//! `Stopped`. Draining starts when the trigger fires (an OS signal in
//! production). From then on the listener refuses new connections, and the
//! coordinator waits for the listener to finish and for every tracked
//! background task, up to a hard deadline.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::background::BackgroundTasks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Serving,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The listener closed and every tracked task finished in time.
    Completed,
    /// The deadline elapsed first; remaining work is abandoned.
    DeadlineElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    pub outstanding_tasks: usize,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    phase: Arc<watch::Sender<Phase>>,
    deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(deadline: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Serving);
        Self {
            phase: Arc::new(phase),
            deadline,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Leave the serving phase. Calling it again is a no-op.
    pub fn begin_draining(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Serving {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once serving has ended; handed to the listener as its
    /// shutdown trigger.
    pub fn draining(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.subscribe();
        async move {
            let _ = rx.wait_for(|phase| *phase != Phase::Serving).await;
        }
    }

    /// Drive `listener` to completion and then wait for `tasks`, bounding
    /// the wait with the deadline once draining has begun.
    ///
    /// A listener error surfaces immediately and abandons the wait.
    pub async fn drain<L>(&self, listener: L, tasks: &BackgroundTasks) -> Result<DrainReport, ServeError>
    where
        L: Future<Output = io::Result<()>>,
    {
        tokio::pin!(listener);

        let mut listener_done = false;
        tokio::select! {
            result = &mut listener => {
                check_listener(result)?;
                listener_done = true;
                self.begin_draining();
            }
            _ = self.draining() => {}
        }

        info!(deadline = ?self.deadline, outstanding = tasks.outstanding(), "draining");
        let started = Instant::now();

        let completion = async {
            if !listener_done {
                check_listener(listener.await)?;
            }
            tasks.drain().await;
            Ok::<_, ServeError>(())
        };

        let outcome = match tokio::time::timeout(self.deadline, completion).await {
            Ok(Ok(())) => DrainOutcome::Completed,
            Ok(Err(err)) => {
                error!(error = %err, "listener failed while draining");
                self.phase.send_replace(Phase::Stopped);
                return Err(err);
            }
            Err(_) => DrainOutcome::DeadlineElapsed,
        };

        self.phase.send_replace(Phase::Stopped);
        let report = DrainReport {
            outcome,
            outstanding_tasks: tasks.outstanding(),
            elapsed: started.elapsed(),
        };

        match report.outcome {
            DrainOutcome::Completed => info!(elapsed = ?report.elapsed, "stopped"),
            DrainOutcome::DeadlineElapsed => warn!(
                outstanding = report.outstanding_tasks,
                "shutdown deadline elapsed, abandoning background tasks"
            ),
        }
        Ok(report)
    }
}

fn check_listener(result: io::Result<()>) -> Result<(), ServeError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(err) => Err(ServeError::Listener(err)),
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!(signal = "interrupt", "shutting down server");
        },
        _ = terminate => {
            info!(signal = "terminate", "shutting down server");
        },
    }
}
