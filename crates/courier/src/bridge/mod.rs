//! IPC bridge between the executor (parent) and a worker process.
//!
//! This module provides the wire protocol, codec and pipe for communication
//! between the call executor and the worker it spawns.
//!
//! # Architecture
//!
//! - **protocol**: Reply envelopes, the code registry, the startup payload
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **channel**: the unidirectional pipe the worker writes replies into

pub mod channel;
pub mod codec;
pub mod protocol;
