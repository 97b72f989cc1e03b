//! Cancellation monitor.
//!
//! Polls the call's cancellation flag on a background task and kills the
//! worker when it is set. Nothing is reported to the caller: the executor
//! notices the kill as the reply channel closing without a terminal reply.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::InvocationContext;
use crate::process::Terminate;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Shorter intervals are raised to this so the poll loop never spins.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct Monitor {
    context: InvocationContext,
    target: Arc<dyn Terminate>,
    poll_interval: Duration,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(context: InvocationContext, target: impl Terminate) -> Self {
        Self {
            context,
            target: Arc::new(target),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start polling. Must be called from within a tokio runtime; a second
    /// call while already started does nothing.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let context = self.context.clone();
        let target = Arc::clone(&self.target);
        let stop = self.stop.clone();
        let poll_interval = self.poll_interval;

        self.task = Some(tokio::spawn(async move {
            tracing::trace!(poll_ms = poll_interval.as_millis() as u64, "Monitor started");
            loop {
                if context.is_cancelled() {
                    tracing::info!("Cancellation observed, terminating worker");
                    if let Err(e) = target.terminate() {
                        tracing::error!(error = %e, "Failed to terminate worker");
                    }
                    break;
                }

                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            tracing::trace!("Monitor exiting");
        }));
    }

    /// Signal the polling task to exit and wait until it has.
    ///
    /// Safe to call more than once, and before [`Monitor::start`].
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Monitor task did not exit cleanly");
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // Never outlive the call, even if stop() was skipped.
        self.stop.cancel();
    }
}
