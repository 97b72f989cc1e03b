//! Worker side of a call - runs inside the worker process.
//!
//! The parent side (spawning, reading replies) is in executor.rs.
//!
//! [`run_call`] invokes one method and writes its replies: any number of
//! `Progress` and `Ping` envelopes, then exactly one terminal envelope, then
//! it closes the writer. [`run_worker`] wraps it for a worker binary: it reads
//! the startup payload from stdin and writes replies to the isolated channel.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    Envelope, Heartbeat, InvocationRequest, Progress, RaisedException, Reply, WorkerInit,
};
use crate::error::describe;

/// Kind given to exceptions captured from a panicking method.
pub const PANIC_KIND: &str = "panic";

pub type MethodResult = Result<Value, MethodError>;

/// How a method reports failure.
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    /// Expected failure; the caller gets an application error.
    #[error("{}", describe(.0))]
    Failed(Value),

    /// Unexpected failure; re-raised in the caller with its kind and message.
    #[error("{0}")]
    Raised(RaisedException),
}

impl MethodError {
    pub fn failed(description: impl Into<Value>) -> Self {
        Self::Failed(description.into())
    }

    pub fn raised(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Raised(RaisedException::new(kind, message))
    }

    pub fn capture<E: std::error::Error + 'static>(err: &E) -> Self {
        Self::Raised(RaisedException::capture(err))
    }
}

fn invalid_argument(message: String) -> MethodError {
    MethodError::raised("InvalidArgument", message)
}

/// Handle for sending non-terminal replies while a method runs.
///
/// Replies are queued and written in order by a forwarder task, so reporting
/// never blocks the method on channel I/O.
#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<Reply>,
}

impl Reporter {
    fn new(tx: mpsc::UnboundedSender<Reply>) -> Self {
        Self { tx }
    }

    /// Emit one `Progress` envelope.
    pub fn progress(&self, progress: Progress) -> io::Result<()> {
        self.send(Reply::Progress(progress))
    }

    fn ping(&self, heartbeat: Heartbeat) -> io::Result<()> {
        self.send(Reply::Ping(heartbeat))
    }

    fn send(&self, reply: Reply) -> io::Result<()> {
        self.tx
            .send(reply)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reply channel closed"))
    }
}

/// Arguments and reporting surface handed to a method.
pub struct Call {
    method: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    reporter: Reporter,
}

impl Call {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// Positional argument `index`, deserialized. Missing or mistyped
    /// arguments raise `InvalidArgument`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, MethodError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| invalid_argument(format!("missing positional argument {}", index)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| invalid_argument(format!("argument {}: {}", index, e)))
    }

    /// Keyword argument `name`, deserialized, or `None` when absent.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, MethodError> {
        match self.kwargs.get(name) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| invalid_argument(format!("argument '{}': {}", name, e))),
            None => Ok(None),
        }
    }

    /// Report progress. Delivery failures are logged, not raised: the parent
    /// has gone away and will not read the outcome either.
    pub fn report(&self, progress: Progress) {
        if let Err(e) = self.reporter.progress(progress) {
            tracing::warn!(error = %e, "Dropping progress report");
        }
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }
}

pub type MethodFn = dyn Fn(&Call) -> MethodResult + Send + Sync;

/// Name -> method table the worker resolves request method names against.
#[derive(Clone, Default)]
pub struct Methods {
    table: HashMap<String, Arc<MethodFn>>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, method: F) -> &mut Self
    where
        F: Fn(&Call) -> MethodResult + Send + Sync + 'static,
    {
        self.table.insert(name.into(), Arc::new(method));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&Call) -> MethodResult + Send + Sync + 'static,
    {
        self.register(name, method);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<MethodFn>> {
        self.table.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Methods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Methods").field("names", &self.names()).finish()
    }
}

type ReplyWriter<W> = FramedWrite<W, JsonCodec<Envelope>>;

async fn send_reply<W: AsyncWrite + Unpin>(
    frames: &mut ReplyWriter<W>,
    reply: Reply,
) -> io::Result<()> {
    let envelope = reply
        .into_envelope()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    frames.send(envelope).await
}

/// Run one call and write its replies to `writer`.
///
/// Returns the writer once the terminal envelope has been flushed and the
/// writer shut down.
pub async fn run_call<W>(
    writer: W,
    methods: &Methods,
    request: InvocationRequest,
    ping_interval: Option<Duration>,
) -> io::Result<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (method_name, args, kwargs) = request.into_parts();
    tracing::trace!(method = %method_name, "run_call starting");

    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Reply>();
    let reporter = Reporter::new(reply_tx);
    let method_done = CancellationToken::new();

    let forwarder = tokio::spawn(forward_replies(
        FramedWrite::new(writer, JsonCodec::new()),
        reply_rx,
        method_done.clone(),
    ));

    let stop_pings = CancellationToken::new();
    let pinger = ping_interval.map(|interval| spawn_pinger(reporter.clone(), interval, stop_pings.clone()));

    let terminal = match methods.get(&method_name) {
        Some(method) => {
            let call = Call {
                method: method_name.clone(),
                args,
                kwargs,
                reporter: reporter.clone(),
            };
            match tokio::task::spawn_blocking(move || invoke(method, call)).await {
                Ok(reply) => reply,
                Err(e) => Reply::Raised(RaisedException::new(
                    "WorkerError",
                    format!("method task failed: {}", e),
                )),
            }
        }
        None => {
            tracing::warn!(method = %method_name, "Method not found");
            Reply::Raised(RaisedException::new(
                "MethodNotFound",
                format!("no method named '{}'", method_name),
            ))
        }
    };
    tracing::trace!(method = %method_name, terminal = terminal.code(), "Method returned");

    stop_pings.cancel();
    if let Some(pinger) = pinger {
        let _ = pinger.await;
    }
    drop(reporter);
    method_done.cancel();

    let mut frames = forwarder.await.map_err(io::Error::other)??;

    tracing::debug!(method = %method_name, code = terminal.code(), "Sending terminal reply");
    send_reply(&mut frames, terminal).await?;
    frames.close().await?;
    Ok(frames.into_inner())
}

/// Write queued replies in order. Once the method is done, drain what is left
/// and hand the writer back for the terminal envelope.
async fn forward_replies<W>(
    mut frames: ReplyWriter<W>,
    mut reply_rx: mpsc::UnboundedReceiver<Reply>,
    method_done: CancellationToken,
) -> io::Result<ReplyWriter<W>>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            reply = reply_rx.recv() => match reply {
                Some(reply) => send_reply(&mut frames, reply).await?,
                None => break,
            },

            _ = method_done.cancelled() => {
                // A reporter clone kept alive past the call must not hold us up.
                reply_rx.close();
                while let Ok(reply) = reply_rx.try_recv() {
                    send_reply(&mut frames, reply).await?;
                }
                break;
            }
        }
    }
    tracing::trace!("Reply forwarder exiting");
    Ok(frames)
}

fn spawn_pinger(reporter: Reporter, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pid = std::process::id();
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        let mut seq = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if reporter.ping(Heartbeat { pid, seq }).is_err() {
                        break;
                    }
                    seq += 1;
                }
            }
        }
    })
}

thread_local! {
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a hook that records where a panic happened, for the raised trace.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                PANIC_LOCATION.with(|slot| *slot.borrow_mut() = Some(location.to_string()));
            }
            previous(info);
        }));
    });
}

fn invoke(method: Arc<MethodFn>, call: Call) -> Reply {
    install_panic_hook();
    match std::panic::catch_unwind(AssertUnwindSafe(|| method(&call))) {
        Ok(Ok(value)) => Reply::Result(value),
        Ok(Err(MethodError::Failed(description))) => Reply::Error(description),
        Ok(Err(MethodError::Raised(raised))) => Reply::Raised(raised),
        Err(payload) => Reply::Raised(panic_exception(payload)),
    }
}

fn panic_exception(payload: Box<dyn Any + Send>) -> RaisedException {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };

    let raised = RaisedException::new(PANIC_KIND, message);
    match PANIC_LOCATION.with(|slot| slot.borrow_mut().take()) {
        Some(location) => raised.with_trace(location),
        None => raised,
    }
}

/// Worker process entry point.
///
/// Moves the reply channel off stdout, reads the startup payload from stdin,
/// runs the call and returns once the terminal reply is flushed. Tracing must
/// already be writing to stderr.
pub async fn run_worker(methods: Methods) -> io::Result<()> {
    let channel = crate::fd_redirect::isolate_reply_channel()?;
    let writer = tokio::fs::File::from_std(std::fs::File::from(channel));

    let mut startup = FramedRead::new(tokio::io::stdin(), JsonCodec::<WorkerInit>::new());
    let init = match startup.next().await {
        Some(Ok(init)) => init,
        Some(Err(e)) => {
            tracing::error!(error = %e, "Invalid startup payload");
            return Err(e);
        }
        None => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stdin closed before the startup payload arrived",
            ));
        }
    };
    drop(startup);

    tracing::info!(
        method = %init.request.method(),
        pid = std::process::id(),
        "Worker invoking method"
    );

    let ping_interval = init
        .ping_interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);
    run_call(writer, &methods, init.request, ping_interval).await?;

    tracing::info!("Worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::codes;
    use serde_json::json;
    use tokio_util::bytes::BytesMut;
    use tokio_util::codec::Decoder;

    fn decode_all(bytes: &[u8]) -> Vec<Reply> {
        let registry = crate::bridge::protocol::Registry::standard();
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::from(bytes);
        let mut replies = Vec::new();
        while let Some(env) = codec.decode(&mut buf).unwrap() {
            replies.push(registry.decode(env).unwrap());
        }
        assert!(buf.is_empty(), "trailing bytes after last frame");
        replies
    }

    fn methods() -> Methods {
        Methods::new()
            .with("add", |call| {
                let a: i64 = call.arg(0)?;
                let b: i64 = call.arg(1)?;
                Ok(json!(a + b))
            })
            .with("steps", |call| {
                for completed in [25, 50, 100] {
                    call.report(Progress::new(completed, 100));
                }
                Ok(json!("done"))
            })
            .with("fail", |call| {
                let reason: Option<String> = call.kwarg("reason")?;
                Err(MethodError::failed(reason.unwrap_or_else(|| "failed".into())))
            })
            .with("parse", |call| {
                let text: String = call.arg(0)?;
                text.parse::<i64>()
                    .map(|n| json!(n))
                    .map_err(|e| MethodError::capture(&e))
            })
            .with("explode", |_| panic!("kaboom"))
            .with("slow", |_| {
                std::thread::sleep(Duration::from_millis(120));
                Ok(json!(null))
            })
    }

    async fn run(request: InvocationRequest, ping: Option<Duration>) -> Vec<Reply> {
        let bytes = run_call(Vec::new(), &methods(), request, ping).await.unwrap();
        decode_all(&bytes)
    }

    #[tokio::test]
    async fn return_value_becomes_single_result() {
        let replies = run(InvocationRequest::new("add").with_args([2, 3]), None).await;
        assert_eq!(replies, vec![Reply::Result(json!(5))]);
    }

    #[tokio::test]
    async fn progress_precedes_terminal_in_order() {
        let replies = run(InvocationRequest::new("steps"), None).await;
        assert_eq!(
            replies,
            vec![
                Reply::Progress(Progress::new(25, 100)),
                Reply::Progress(Progress::new(50, 100)),
                Reply::Progress(Progress::new(100, 100)),
                Reply::Result(json!("done")),
            ]
        );
    }

    #[tokio::test]
    async fn reported_failure_becomes_error() {
        let request = InvocationRequest::new("fail").with_kwarg("reason", "quota exceeded");
        let replies = run(request, None).await;
        assert_eq!(replies, vec![Reply::Error(json!("quota exceeded"))]);
    }

    #[tokio::test]
    async fn typed_error_is_raised_with_its_type() {
        let replies = run(InvocationRequest::new("parse").with_arg("x1"), None).await;
        match replies.as_slice() {
            [Reply::Raised(raised)] => assert!(raised.is::<std::num::ParseIntError>()),
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[tokio::test]
    async fn panic_is_raised_with_location() {
        let replies = run(InvocationRequest::new("explode"), None).await;
        match replies.as_slice() {
            [Reply::Raised(raised)] => {
                assert_eq!(raised.kind, PANIC_KIND);
                assert_eq!(raised.message, "kaboom");
                assert!(raised.trace.as_deref().is_some_and(|t| t.contains("worker.rs")));
            }
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_argument_is_raised() {
        let replies = run(InvocationRequest::new("add").with_arg("two"), None).await;
        match replies.as_slice() {
            [Reply::Raised(raised)] => {
                assert_eq!(raised.kind, "InvalidArgument");
                assert!(raised.message.starts_with("argument 0"));
            }
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_raised() {
        let replies = run(InvocationRequest::new("nope"), None).await;
        match replies.as_slice() {
            [Reply::Raised(raised)] => assert_eq!(raised.kind, "MethodNotFound"),
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[tokio::test]
    async fn pings_interleave_before_terminal() {
        let replies = run(InvocationRequest::new("slow"), Some(Duration::from_millis(20))).await;

        let (last, rest) = replies.split_last().unwrap();
        assert_eq!(last.code(), codes::RESULT);
        assert!(!rest.is_empty());

        let mut expected_seq = 0;
        for reply in rest {
            match reply {
                Reply::Ping(heartbeat) => {
                    assert_eq!(heartbeat.pid, std::process::id());
                    assert_eq!(heartbeat.seq, expected_seq);
                    expected_seq += 1;
                }
                other => panic!("unexpected reply: {:?}", other),
            }
        }
    }

    #[test]
    fn methods_table() {
        let methods = methods();
        assert!(methods.contains("add"));
        assert!(methods.get("missing").is_none());
        assert_eq!(methods.names()[0], "add");
    }
}
