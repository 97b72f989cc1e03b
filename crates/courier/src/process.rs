//! Worker process handle.
//!
//! The executor owns the [`WorkerProcess`] for the whole call: it starts it,
//! and reaps it during teardown. The monitor gets a [`WorkerTerminator`], which
//! can only kill. Killing is pid-based, which is safe because the monitor is
//! always stopped before the executor reaps the worker, so the pid cannot have
//! been recycled.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::process::{Child, ChildStdin, Command};

/// Lifecycle of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Terminated,
    Reaped,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker already started")]
    AlreadyStarted,
    #[error("worker stdin not captured")]
    NoStdin,
    #[error("failed to send startup payload: {0}")]
    Startup(#[source] io::Error),
}

/// Something the monitor can forcibly stop.
pub trait Terminate: Send + Sync + 'static {
    /// Kill the target. Must be a no-op once the target is gone.
    fn terminate(&self) -> io::Result<()>;
}

/// Extension point for different worker launch strategies.
pub trait WorkerSpawner: Send + Sync + std::fmt::Debug {
    /// Build the worker command. Stdio is set by [`WorkerProcess::start`].
    fn command(&self) -> Command;
}

/// Runs a fixed program with fixed arguments.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl WorkerSpawner for CommandSpawner {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

fn lock_state(state: &Mutex<WorkerState>) -> MutexGuard<'_, WorkerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct WorkerProcess {
    command: Option<Command>,
    child: Option<Child>,
    pid: Option<u32>,
    state: Arc<Mutex<WorkerState>>,
    status: Option<ExitStatus>,
}

impl WorkerProcess {
    pub fn new(command: Command) -> Self {
        Self {
            command: Some(command),
            child: None,
            pid: None,
            state: Arc::new(Mutex::new(WorkerState::NotStarted)),
            status: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        *lock_state(&self.state)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the worker with `stdout` as its reply channel and a piped stdin
    /// for the startup payload. Stderr is inherited so worker logs reach the
    /// parent's log stream.
    pub fn start(&mut self, stdout: Stdio) -> Result<ChildStdin, SpawnError> {
        let mut command = self.command.take().ok_or(SpawnError::AlreadyStarted)?;
        command
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        // The command still holds the parent's duplicate of the channel writer.
        drop(command);

        self.pid = child.id();
        let stdin = child.stdin.take();
        self.child = Some(child);
        *lock_state(&self.state) = WorkerState::Running;

        tracing::debug!(pid = ?self.pid, "Worker started");
        stdin.ok_or(SpawnError::NoStdin)
    }

    pub fn terminator(&self) -> WorkerTerminator {
        WorkerTerminator {
            pid: self.pid,
            state: Arc::clone(&self.state),
        }
    }

    pub fn terminate(&self) -> io::Result<()> {
        self.terminator().terminate()
    }

    /// Wait for the worker to exit and reap it.
    ///
    /// Returns `None` if the worker was never started. Calling this again
    /// after a successful reap returns the cached status.
    pub async fn wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };

        let status = child.wait().await?;
        self.status = Some(status);
        *lock_state(&self.state) = WorkerState::Reaped;

        tracing::debug!(pid = ?self.pid, %status, "Worker reaped");
        Ok(Some(status))
    }
}

/// Kill-only view of a [`WorkerProcess`], handed to the monitor.
#[derive(Debug, Clone)]
pub struct WorkerTerminator {
    pid: Option<u32>,
    state: Arc<Mutex<WorkerState>>,
}

impl Terminate for WorkerTerminator {
    fn terminate(&self) -> io::Result<()> {
        let mut state = lock_state(&self.state);
        if *state != WorkerState::Running {
            tracing::trace!(state = ?*state, "Terminate skipped");
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        send_kill(pid)?;
        *state = WorkerState::Terminated;
        tracing::info!(pid, "Worker terminated");
        Ok(())
    }
}

fn send_kill(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        // Already exited but not yet reaped by us
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Human-readable exit status for abort reasons.
pub fn describe_status(status: Option<ExitStatus>) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status {
        Some(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "unknown exit status".to_string(),
        },
        None => "exit status unavailable".to_string(),
    }
}
