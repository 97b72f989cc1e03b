//! Reply channel isolation for worker processes.
//!
//! The worker is spawned with the reply channel as fd 1. Anything the method
//! prints, and anything a subprocess it launches inherits, would otherwise
//! write straight into the channel and corrupt the framing.
//!
//! [`isolate_reply_channel`] moves the channel to a fresh close-on-exec fd and
//! points fd 1 at stderr, so stray output lands in the worker's log stream and
//! grandchildren never see the channel at all.
//!
//! ## Safety contracts
//!
//! The `unsafe` blocks here rely on:
//! 1. Being called once, early in the worker, before any method code runs
//! 2. fds 1 and 2 being open, as the executor always spawns workers that way
//! 3. `forget` after `dup2` onto fd 1, so the standard fd is never closed

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::unistd::dup2;

const STDOUT_FD: i32 = 1;
const STDERR_FD: i32 = 2;

/// Take the reply channel off stdout.
///
/// Returns the channel as an owned, close-on-exec fd. After this returns,
/// writes to stdout go to stderr.
pub fn isolate_reply_channel() -> io::Result<OwnedFd> {
    // Safety: fd 1 is open for the life of the worker (contract 2).
    let channel = unsafe { BorrowedFd::borrow_raw(STDOUT_FD) }
        .try_clone_to_owned()
        .map_err(|e| io::Error::other(format!("dup(1) failed: {}", e)))?;

    // Safety: contract 2 again, for fd 2.
    let stderr = unsafe { BorrowedFd::borrow_raw(STDERR_FD) };
    let mut target = unsafe { OwnedFd::from_raw_fd(STDOUT_FD) };
    let redirected = dup2(stderr, &mut target);
    std::mem::forget(target);
    redirected.map_err(|e| io::Error::other(format!("dup2(2, 1) failed: {}", e)))?;

    tracing::debug!(channel_fd = channel.as_raw_fd(), "Reply channel moved off stdout");
    Ok(channel)
}
