//! Wire protocol types for executor-worker communication.
//!
//! Two directions:
//! - **Startup payload** (worker stdin): one [`WorkerInit`] frame, then EOF
//! - **Reply channel** (worker stdout): a stream of [`Envelope`]s ending in
//!   exactly one terminal reply
//!
//! An envelope is a `[code, payload]` pair. The [`Registry`] maps each code to
//! a constructor producing a typed [`Reply`], and [`Reply::dispatch`] applies
//! the reply to the call's [`InvocationContext`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::InvocationContext;
use crate::error::{CallError, ProtocolError};

/// Stable reply codes, one per [`Reply`] variant.
pub mod codes {
    pub const RESULT: u8 = 1;
    pub const PROGRESS: u8 = 2;
    pub const ERROR: u8 = 3;
    pub const RAISED: u8 = 4;
    pub const PING: u8 = 5;
}

/// Where a call runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallModel {
    /// Isolated worker process.
    #[default]
    Fork,
    /// In-process, on a blocking thread of the caller's runtime.
    Direct,
}

/// A method reference plus its arguments.
///
/// Built once with the `with_*` methods and never mutated afterwards; the
/// executor hands a copy to the worker in the startup payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    method: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Map<String, Value>,
    #[serde(default)]
    model: CallModel,
}

impl InvocationRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            model: CallModel::default(),
        }
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn with_model(mut self, model: CallModel) -> Self {
        self.model = model;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn model(&self) -> CallModel {
        self.model
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Value>, Map<String, Value>) {
        (self.method, self.args, self.kwargs)
    }
}

/// First and only message sent to a worker, on its stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInit {
    pub request: InvocationRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_interval_ms: Option<u64>,
}

/// One message unit on the reply channel: `[code, payload]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope(pub u8, pub Value);

impl Envelope {
    pub fn code(&self) -> u8 {
        self.0
    }

    pub fn payload(&self) -> &Value {
        &self.1
    }
}

/// Exception captured in the worker, preserving its type name and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RaisedException {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub trace: Option<String>,
}

impl RaisedException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Capture a typed error. The kind is the error's type name and the trace
    /// lists its `source()` chain, innermost last.
    pub fn capture<E: std::error::Error + 'static>(err: &E) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        let captured = Self::new(std::any::type_name::<E>(), err.to_string());
        if chain.is_empty() {
            captured
        } else {
            captured.with_trace(chain.join("\n"))
        }
    }

    /// Whether this exception was captured from an error of type `E`.
    pub fn is<E: 'static>(&self) -> bool {
        self.kind == std::any::type_name::<E>()
    }
}

/// Progress report from the callee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Progress {
    pub fn new(completed: u64, total: u64) -> Self {
        Self {
            completed,
            total,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Completion in percent, `None` when the total is unknown (zero).
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.completed as f64 * 100.0 / self.total as f64)
    }
}

/// Worker liveness heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub seq: u64,
}

/// Typed reply, decoded from an [`Envelope`] through the [`Registry`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Final return value.
    Result(Value),
    Progress(Progress),
    /// Failure reported by the callee through [`crate::worker::MethodError::Failed`].
    Error(Value),
    /// Exception or panic captured in the worker.
    Raised(RaisedException),
    Ping(Heartbeat),
}

/// What the read loop does after dispatching a reply.
#[derive(Debug)]
pub enum Dispatch {
    Continue,
    Terminate(Result<Value, CallError>),
}

impl Reply {
    pub fn code(&self) -> u8 {
        match self {
            Self::Result(_) => codes::RESULT,
            Self::Progress(_) => codes::PROGRESS,
            Self::Error(_) => codes::ERROR,
            Self::Raised(_) => codes::RAISED,
            Self::Ping(_) => codes::PING,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error(_) | Self::Raised(_))
    }

    pub fn into_envelope(self) -> Result<Envelope, serde_json::Error> {
        let code = self.code();
        let payload = match self {
            Self::Result(value) | Self::Error(value) => value,
            Self::Progress(progress) => serde_json::to_value(progress)?,
            Self::Raised(raised) => serde_json::to_value(raised)?,
            Self::Ping(heartbeat) => serde_json::to_value(heartbeat)?,
        };
        Ok(Envelope(code, payload))
    }

    /// Apply the reply to the call. Terminal replies always end the loop.
    pub fn dispatch(self, context: &InvocationContext) -> Dispatch {
        match self {
            Self::Result(value) => Dispatch::Terminate(Ok(value)),
            Self::Error(description) => Dispatch::Terminate(Err(CallError::Application(description))),
            Self::Raised(raised) => Dispatch::Terminate(Err(CallError::Raised(raised))),
            Self::Progress(progress) => {
                tracing::trace!(
                    completed = progress.completed,
                    total = progress.total,
                    "Progress reported"
                );
                context.progress().report(progress);
                Dispatch::Continue
            }
            Self::Ping(heartbeat) => {
                tracing::debug!(pid = heartbeat.pid, seq = heartbeat.seq, "Pinged by worker");
                Dispatch::Continue
            }
        }
    }
}

/// Builds a [`Reply`] from an envelope payload.
pub type Constructor = fn(Value) -> Result<Reply, serde_json::Error>;

fn result_reply(payload: Value) -> Result<Reply, serde_json::Error> {
    Ok(Reply::Result(payload))
}

fn progress_reply(payload: Value) -> Result<Reply, serde_json::Error> {
    serde_json::from_value(payload).map(Reply::Progress)
}

fn error_reply(payload: Value) -> Result<Reply, serde_json::Error> {
    Ok(Reply::Error(payload))
}

fn raised_reply(payload: Value) -> Result<Reply, serde_json::Error> {
    serde_json::from_value(payload).map(Reply::Raised)
}

fn ping_reply(payload: Value) -> Result<Reply, serde_json::Error> {
    serde_json::from_value(payload).map(Reply::Ping)
}

/// Code -> constructor table.
///
/// Built (and customized through [`Registry::register`]) before a call starts;
/// the executor only reads it while dispatching.
#[derive(Debug, Clone)]
pub struct Registry {
    constructors: HashMap<u8, Constructor>,
}

impl Registry {
    /// A registry with no codes; every envelope fails to decode.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// The five standard replies.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(codes::RESULT, result_reply);
        registry.register(codes::PROGRESS, progress_reply);
        registry.register(codes::ERROR, error_reply);
        registry.register(codes::RAISED, raised_reply);
        registry.register(codes::PING, ping_reply);
        registry
    }

    /// Associate `code` with `constructor`, returning the one it replaced.
    pub fn register(&mut self, code: u8, constructor: Constructor) -> Option<Constructor> {
        self.constructors.insert(code, constructor)
    }

    pub fn is_registered(&self, code: u8) -> bool {
        self.constructors.contains_key(&code)
    }

    pub fn decode(&self, envelope: Envelope) -> Result<Reply, ProtocolError> {
        let Envelope(code, payload) = envelope;
        let constructor = self
            .constructors
            .get(&code)
            .ok_or(ProtocolError::UnknownCode(code))?;
        constructor(payload).map_err(|source| ProtocolError::Payload { code, source })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}
