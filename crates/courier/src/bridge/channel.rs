//! Unidirectional reply channel from a worker to the executor.
//!
//! An anonymous pipe: the worker gets a duplicate of the write end as its
//! stdout; the executor keeps the read end, framed with [`JsonCodec`].
//!
//! The executor must call [`Channel::close_writer`] right after spawning the
//! worker. Once the only remaining write end is the worker's, the read side
//! sees end-of-stream as soon as the worker exits or is killed.

use std::io::{self, PipeWriter};
use std::os::fd::OwnedFd;
use std::process::Stdio;

use tokio::net::unix::pipe::Receiver;
use tokio_util::codec::FramedRead;

use super::codec::JsonCodec;
use super::protocol::Envelope;

/// Framed read end of the reply channel.
pub type ReplyReader = FramedRead<Receiver, JsonCodec<Envelope>>;

pub struct Channel {
    reader: Option<ReplyReader>,
    writer: Option<PipeWriter>,
}

impl Channel {
    /// Create the pipe. Both ends are close-on-exec; only the duplicate handed
    /// out by [`Channel::child_writer`] reaches the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open() -> io::Result<Self> {
        let (reader, writer) = io::pipe()?;
        let receiver = Receiver::from_owned_fd(OwnedFd::from(reader))?;

        tracing::trace!("Opened reply channel");

        Ok(Self {
            reader: Some(FramedRead::new(receiver, JsonCodec::new())),
            writer: Some(writer),
        })
    }

    /// Duplicate of the write end, for use as the worker's stdout.
    pub fn child_writer(&self) -> io::Result<Stdio> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "channel writer closed"))?;
        Ok(Stdio::from(writer.try_clone()?))
    }

    /// Drop the parent's write end.
    pub fn close_writer(&mut self) {
        if self.writer.take().is_some() {
            tracing::trace!("Closed parent copy of channel writer");
        }
    }

    pub fn reader(&mut self) -> io::Result<&mut ReplyReader> {
        self.reader
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel reader closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    /// Close both ends. Unread frames are discarded and a worker still writing
    /// gets `EPIPE`.
    pub fn close(&mut self) {
        self.close_writer();
        if self.reader.take().is_some() {
            tracing::trace!("Closed reply channel");
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
