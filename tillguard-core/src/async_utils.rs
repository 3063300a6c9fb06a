//! Async utilities and patterns
//!
//! Timeout wrapping for remote calls and cancellable periodic background tasks

use crate::error::{ErrorContext, TillError, TillResult};
use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Timeout wrapper for async operations
pub async fn with_timeout<F, T>(future: F, timeout_ms: u64, operation_name: &str) -> TillResult<T>
where
    F: Future<Output = T>,
{
    match timeout(Duration::from_millis(timeout_ms), future).await {
        Ok(result) => Ok(result),
        Err(_) => Err(TillError::Timeout {
            operation: operation_name.to_string(),
            duration_ms: timeout_ms,
            context: ErrorContext::new("async_utils")
                .with_operation("timeout")
                .with_metadata("timeout_ms", &timeout_ms.to_string())
                .with_suggestion("Check network connectivity")
                .with_suggestion("Verify service availability"),
        }),
    }
}

/// What a periodic task wants to do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Stop,
}

/// A background task that runs a tick function on a fixed interval until it
/// is cancelled, dropped, or a tick returns [`TickOutcome::Stop`].
///
/// The first tick fires one full period after spawning.
pub struct PeriodicTask {
    name: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn a new periodic task on the current tokio runtime
    pub fn spawn<F, Fut>(name: &str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickOutcome> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if tick().await == TickOutcome::Stop {
                            debug!(task = %task_name, "Periodic task stopped itself");
                            break;
                        }
                    }
                    // Fires on an explicit cancel and when the owner is dropped
                    _ = &mut shutdown_rx => {
                        debug!(task = %task_name, "Periodic task cancelled");
                        break;
                    }
                }
            }
        });

        info!(task = name, period_ms = period.as_millis() as u64, "Started periodic task");

        Self {
            name: name.to_string(),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Task name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation. Returns `true` only for the call that actually
    /// cancelled the task; later calls are no-ops.
    pub fn cancel(&mut self) -> bool {
        match self.shutdown_tx.take() {
            Some(tx) => {
                // The task may already have stopped itself; that is fine.
                let _ = tx.send(());
                debug!(task = %self.name, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.shutdown_tx.is_none()
    }

    /// Whether the underlying task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the task to exit
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
