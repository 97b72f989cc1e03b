//! courier: isolated-process execution core for remote method invocation.
//!
//! An [`Executor`] runs one method call per worker process, streams progress
//! back into the caller's [`InvocationContext`], and kills the worker when the
//! context is cancelled. Worker binaries call [`run_worker`] with their
//! [`Methods`] table.

#[cfg(not(unix))]
compile_error!("courier requires a unix platform (pipes, fork/exec and signals)");

pub mod bridge;
pub mod context;
pub mod error;
pub mod executor;
mod fd_redirect;
pub mod logging;
pub mod monitor;
pub mod process;
pub mod worker;

pub use bridge::protocol::{
    CallModel, InvocationRequest, Progress, RaisedException, Registry, Reply,
};
pub use context::{CancellationToken, InvocationContext, ProgressSink};
pub use error::{AbortReason, CallError, ProtocolError};
pub use executor::{ExecutorConfig, Executor};
pub use process::{CommandSpawner, SpawnError, WorkerSpawner};
pub use worker::{Call, MethodError, MethodResult, Methods, run_worker};
