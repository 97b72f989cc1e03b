//! Call executor - parent side of a call.
//!
//! Flow for a forked call:
//! 1. Open the reply channel
//! 2. Spawn the worker with the channel writer as its stdout
//! 3. Start the cancellation monitor
//! 4. Close the parent's copy of the writer
//! 5. Send the startup payload on the worker's stdin
//! 6. Read and dispatch replies until a terminal reply or end-of-stream
//! 7. Teardown, always and in this order: close the channel, stop the
//!    monitor, reap the worker
//!
//! A direct call runs the same adapter and read loop in-process, over an
//! in-memory stream instead of a pipe.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::process::ChildStdin;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::channel::Channel;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    CallModel, Dispatch, Envelope, InvocationRequest, Registry, WorkerInit,
};
use crate::context::InvocationContext;
use crate::error::{AbortReason, CallError, ProtocolError};
use crate::monitor::{DEFAULT_POLL_INTERVAL, MIN_POLL_INTERVAL, Monitor};
use crate::process::{CommandSpawner, SpawnError, WorkerProcess, WorkerSpawner, describe_status};
use crate::worker::{Methods, run_call};

/// Worker program used when none is configured, looked up on `PATH`.
pub const DEFAULT_WORKER_PROGRAM: &str = "courier-worker";
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

const DIRECT_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a positive number of milliseconds, got '{value}'")]
    InvalidMillis { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub poll_interval: Duration,
    /// Worker heartbeat interval; `None` disables pings.
    pub ping_interval: Option<Duration>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            spawner: Arc::new(CommandSpawner::new(DEFAULT_WORKER_PROGRAM)),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `COURIER_WORKER`, `COURIER_POLL_INTERVAL_MS` and
    /// `COURIER_PING_INTERVAL_MS` (`0` disables pings).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(program) = lookup("COURIER_WORKER").filter(|p| !p.is_empty()) {
            config = config.with_worker(program);
        }
        if let Some(value) = lookup("COURIER_POLL_INTERVAL_MS") {
            match parse_millis(&value) {
                Some(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => {
                    return Err(ConfigError::InvalidMillis {
                        name: "COURIER_POLL_INTERVAL_MS",
                        value,
                    });
                }
            }
        }
        if let Some(value) = lookup("COURIER_PING_INTERVAL_MS") {
            let ms = parse_millis(&value).ok_or_else(|| ConfigError::InvalidMillis {
                name: "COURIER_PING_INTERVAL_MS",
                value: value.clone(),
            })?;
            config.ping_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }

        tracing::debug!(?config, "Executor config loaded");
        Ok(config)
    }

    /// Zero is raised to [`MIN_POLL_INTERVAL`] so the monitor never spins.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn with_ping_interval(mut self, ping_interval: Option<Duration>) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_worker(self, program: impl Into<PathBuf>) -> Self {
        self.with_spawner(Arc::new(CommandSpawner::new(program)))
    }
}

fn parse_millis(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Runs calls, one worker per call.
#[derive(Debug, Clone)]
pub struct Executor {
    config: ExecutorConfig,
    registry: Arc<Registry>,
    local: Option<Arc<Methods>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::standard()),
            local: None,
        }
    }

    /// Replace the reply registry. The registry is frozen from here on.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Methods available to [`CallModel::Direct`] requests.
    pub fn with_local_methods(mut self, methods: Methods) -> Self {
        self.local = Some(Arc::new(methods));
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one call to completion.
    ///
    /// Returns the method's return value, or why there is none. Every
    /// resource the call used is released before this returns.
    pub async fn execute(
        &self,
        request: InvocationRequest,
        context: &InvocationContext,
    ) -> Result<Value, CallError> {
        let method = request.method().to_string();
        let model = request.model();
        tracing::info!(%method, ?model, "Executing call");

        let outcome = match model {
            CallModel::Fork => self.execute_forked(request, context).await,
            CallModel::Direct => self.execute_direct(request, context).await,
        };

        match &outcome {
            Ok(_) => tracing::info!(%method, "Call succeeded"),
            Err(e) if e.is_method_failure() => tracing::info!(%method, error = %e, "Call failed"),
            Err(e) => tracing::warn!(%method, error = %e, "Call did not complete"),
        }
        outcome
    }

    async fn execute_forked(
        &self,
        request: InvocationRequest,
        context: &InvocationContext,
    ) -> Result<Value, CallError> {
        let mut channel = Channel::open().map_err(SpawnError::Spawn)?;
        let mut worker = WorkerProcess::new(self.config.spawner.command());
        let mut monitor = None;

        let outcome = self
            .run_forked(&mut channel, &mut worker, &mut monitor, request, context)
            .await;

        // Unconditional teardown. The channel goes first so a worker blocked
        // on a full pipe gets EPIPE instead of holding up the reap.
        channel.close();
        if let Some(mut monitor) = monitor {
            monitor.stop().await;
        }
        if matches!(outcome, Err(CallError::Protocol(_) | CallError::Spawn(_)))
            && let Err(e) = worker.terminate()
        {
            tracing::warn!(error = %e, "Failed to terminate worker after failed call");
        }
        let status = match worker.wait().await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reap worker");
                None
            }
        };

        refine_abort(outcome, context, || describe_status(status))
    }

    async fn run_forked(
        &self,
        channel: &mut Channel,
        worker: &mut WorkerProcess,
        monitor: &mut Option<Monitor>,
        request: InvocationRequest,
        context: &InvocationContext,
    ) -> Result<Value, CallError> {
        let stdout = channel.child_writer().map_err(SpawnError::Spawn)?;
        let stdin = worker.start(stdout)?;

        let mut started = Monitor::new(context.clone(), worker.terminator())
            .with_poll_interval(self.config.poll_interval);
        started.start();
        *monitor = Some(started);

        channel.close_writer();

        let init = WorkerInit {
            request,
            ping_interval_ms: self.config.ping_interval.map(saturating_millis),
        };
        // A worker gone before reading stdin shows up as end-of-stream below,
        // so its exit status can be reported.
        match send_startup(stdin, init).await {
            Ok(()) => tracing::debug!(pid = ?worker.pid(), "Startup payload sent"),
            Err(e) => tracing::warn!(pid = ?worker.pid(), error = %e, "Worker did not take its startup payload"),
        }

        let replies = channel.reader().map_err(ProtocolError::Malformed)?;
        read_replies(replies, &self.registry, context).await
    }

    async fn execute_direct(
        &self,
        request: InvocationRequest,
        context: &InvocationContext,
    ) -> Result<Value, CallError> {
        let Some(methods) = self.local.clone() else {
            return Err(CallError::Unsupported(format!(
                "direct call to '{}' but no local methods are configured",
                request.method()
            )));
        };
        if context.is_cancelled() {
            return Err(CallError::Aborted(AbortReason::Cancelled));
        }

        let (writer, reader) = tokio::io::duplex(DIRECT_BUFFER_SIZE);
        let call = tokio::spawn(async move { run_call(writer, &methods, request, None).await });

        let mut replies = FramedRead::new(reader, JsonCodec::<Envelope>::new());
        let cancel = context.cancel_token();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallError::Aborted(AbortReason::Cancelled)),
            outcome = read_replies(&mut replies, &self.registry, context) => outcome,
        };
        drop(replies);

        if call.is_finished() {
            if let Ok(Err(e)) = call.await {
                tracing::debug!(error = %e, "Direct call writer failed");
            }
        } else {
            // Cannot be preempted; the method finishes on its own thread.
            tracing::info!("Detaching direct call still in progress");
        }

        refine_abort(outcome, context, || "direct call ended without a result".to_string())
    }
}

async fn send_startup(stdin: ChildStdin, init: WorkerInit) -> Result<(), SpawnError> {
    let mut writer = FramedWrite::new(stdin, JsonCodec::<WorkerInit>::new());
    writer.send(init).await.map_err(SpawnError::Startup)?;
    // Dropping stdin after the close gives the worker EOF
    writer.close().await.map_err(SpawnError::Startup)
}

/// Replace the generic abort reason from the read loop with the real one.
fn refine_abort(
    outcome: Result<Value, CallError>,
    context: &InvocationContext,
    exit_detail: impl FnOnce() -> String,
) -> Result<Value, CallError> {
    match outcome {
        Err(CallError::Aborted(_)) if context.is_cancelled() => {
            Err(CallError::Aborted(AbortReason::Cancelled))
        }
        Err(CallError::Aborted(_)) => Err(CallError::Aborted(AbortReason::WorkerExited(exit_detail()))),
        other => other,
    }
}

/// Read and dispatch replies until one ends the call.
///
/// Undecodable frames are a protocol error. End-of-stream without a terminal
/// reply, or a stream cut off mid-frame, is an abort.
pub async fn read_replies<S>(
    replies: &mut S,
    registry: &Registry,
    context: &InvocationContext,
) -> Result<Value, CallError>
where
    S: Stream<Item = io::Result<Envelope>> + Unpin,
{
    loop {
        let envelope = match replies.next().await {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(ProtocolError::Malformed(e).into());
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Reply channel failed");
                return Err(CallError::Aborted(AbortReason::WorkerExited(e.to_string())));
            }
            None => {
                tracing::debug!("Reply channel closed without a terminal reply");
                return Err(CallError::Aborted(AbortReason::WorkerExited(
                    "no terminal reply".to_string(),
                )));
            }
        };

        let code = envelope.code();
        let reply = registry.decode(envelope).inspect_err(|e| {
            tracing::error!(code, error = %e, "Undecodable reply");
        })?;
        if let Dispatch::Terminate(outcome) = reply.dispatch(context) {
            tracing::trace!(code, "Terminal reply received");
            return outcome;
        }
    }
}
