//! Per-call state shared between the caller, the executor and its monitor.

use std::sync::{Arc, Mutex, MutexGuard};

pub use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::Progress;

/// Callback run for every progress report, in arrival order.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Ordered record of the progress a call has reported.
///
/// Written only by the executor's read loop. Clones share the same history.
#[derive(Clone, Default)]
pub struct ProgressSink {
    history: Arc<Mutex<Vec<Progress>>>,
    callback: Option<ProgressCallback>,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        Self {
            history: Arc::default(),
            callback: Some(Arc::new(callback)),
        }
    }

    pub fn report(&self, progress: Progress) {
        if let Some(callback) = &self.callback {
            callback(&progress);
        }
        self.lock().push(progress);
    }

    pub fn latest(&self) -> Option<Progress> {
        self.lock().last().cloned()
    }

    pub fn history(&self) -> Vec<Progress> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Progress>> {
        match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Progress history mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("history", &self.history())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Cancellation flag plus progress sink for one call.
///
/// The flag goes from not-cancelled to cancelled once and never back. The
/// surrounding dispatch layer keeps a clone and calls [`cancel`] when the
/// remote caller asks for it; the executor's monitor only reads it.
///
/// [`cancel`]: InvocationContext::cancel
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    cancel_token: CancellationToken,
    progress: ProgressSink,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(progress: ProgressSink) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            progress,
        }
    }

    pub fn cancel(&self) {
        if !self.cancel_token.is_cancelled() {
            tracing::debug!("Call cancellation requested");
        }
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn progress(&self) -> &ProgressSink {
        &self.progress
    }
}
