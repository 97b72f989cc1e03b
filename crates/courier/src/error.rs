//! Call outcome errors.

use std::fmt;

use serde_json::Value;

use crate::bridge::protocol::RaisedException;
use crate::process::SpawnError;

/// The reply stream could not be decoded. Always fatal to the current call.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] std::io::Error),

    #[error("unregistered reply code {0}")]
    UnknownCode(u8),

    #[error("invalid payload for reply code {code}: {source}")]
    Payload {
        code: u8,
        #[source]
        source: serde_json::Error,
    },
}

/// Why a call ended without a terminal reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The context was cancelled and the worker was killed.
    Cancelled,
    /// The worker went away on its own (crash, `exit`, signal from elsewhere).
    WorkerExited(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::WorkerExited(detail) => write!(f, "worker exited: {}", detail),
        }
    }
}

/// Everything `execute` can fail with.
///
/// `Application` and `Raised` mean the method itself failed; `Aborted` means
/// the call never finished (cancelled or crashed); `Protocol` and `Spawn` are
/// infrastructure failures.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("call failed: {}", describe(.0))]
    Application(Value),

    #[error("call raised {0}")]
    Raised(RaisedException),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("call aborted: {0}")]
    Aborted(AbortReason),

    #[error("failed to start worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error("unsupported call: {0}")]
    Unsupported(String),
}

impl CallError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Aborted(AbortReason::Cancelled))
    }

    /// The method ran and reported or raised a failure.
    pub fn is_method_failure(&self) -> bool {
        matches!(self, Self::Application(_) | Self::Raised(_))
    }
}

/// Render a failure description: strings as-is, anything else as JSON.
pub fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
