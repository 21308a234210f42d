// Copyright 2021 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Stream multiplexing capabilities.
//!
//! A muxer carries many independent bidirectional streams over one secured
//! connection. The traits here are the seam between the upgrade pipeline
//! (which selects and instantiates a muxer) and the concrete muxer crates.

use crate::resource::{PeerScope, ResourceError};
use crate::secure::SecureConn;
use crate::ProtocolId;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// A muxed connection: one muxer session bound to one secured connection.
///
/// `open_stream` and `accept_stream` may be called concurrently, and
/// concurrently with I/O on existing streams. Dropping the future returned
/// by `open_stream` cancels the open attempt without leaking a half-open
/// stream.
#[async_trait]
pub trait StreamMuxer: Send + Sync {
    /// Initiates a new outbound stream.
    async fn open_stream(&self) -> Result<Box<dyn MuxedStream>, MuxerError>;

    /// Yields the next stream initiated by the remote.
    ///
    /// Returns [`MuxerError::ConnClosed`] once the connection is closed.
    async fn accept_stream(&self) -> Result<Box<dyn MuxedStream>, MuxerError>;

    /// Closes the session: every live stream is terminated, the memory
    /// manager released, the scope span released. Idempotent.
    async fn close(&self) -> Result<(), MuxerError>;

    fn is_closed(&self) -> bool;
}

/// One logical flow within a muxed connection.
///
/// State machine per stream: `Open` moves to `HalfClosedLocal` via
/// [`MuxedStream::close_write`], to `HalfClosedRemote` when the peer sends
/// FIN, and to `Closed` when both happened; any state moves to `Reset` via
/// [`MuxedStream::reset`] or a remote reset. Once `Closed` or `Reset`, no
/// further I/O succeeds.
#[async_trait]
pub trait MuxedStream: Send {
    /// Reads into `buf`, returning the number of bytes read; `Ok(0)` is EOF
    /// (peer half-closed and the receive buffer drained).
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MuxerError>;

    /// Writes from `buf`, returning the number of bytes accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, MuxerError>;

    /// Closes both directions cleanly. Idempotent: the second call returns
    /// `Ok` immediately.
    async fn close(&mut self) -> Result<(), MuxerError>;

    /// Refuses further local reads. In-flight data is discarded.
    fn close_read(&mut self) -> Result<(), MuxerError>;

    /// Sends FIN; the peer observes EOF. Subsequent writes fail, reads
    /// still drain whatever the peer sends until it closes or resets.
    async fn close_write(&mut self) -> Result<(), MuxerError>;

    /// Terminates both directions immediately, signalling the peer.
    fn reset(&mut self);

    /// Bounds both reads and writes. `None` clears the deadline; a deadline
    /// in the past makes pending and subsequent operations fail promptly.
    fn set_deadline(&mut self, deadline: Option<Instant>);

    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    fn set_write_deadline(&mut self, deadline: Option<Instant>);

    /// Identifier of this stream within its connection.
    fn id(&self) -> u64;
}

/// Factory wrapping secured connections into muxer sessions.
#[async_trait]
pub trait MuxerTransport: Send + Sync {
    /// Identity of the muxer protocol, e.g. `/yamux/1.0.0`.
    fn protocol(&self) -> ProtocolId;

    /// Wraps an already-secured connection.
    ///
    /// When `peer_scope` is given, the session must route every buffer
    /// allocation through a span of that scope. A session that fails to set
    /// up must release any span it already opened before returning the
    /// error.
    async fn new_conn(
        &self,
        conn: Box<dyn SecureConn>,
        is_server: bool,
        peer_scope: Option<Arc<dyn PeerScope>>,
    ) -> Result<Box<dyn StreamMuxer>, MuxerError>;
}

/// The stable error taxonomy of the muxing layer.
///
/// Session implementations map their internal failures onto this set before
/// surfacing them, so callers observe the same errors regardless of the
/// negotiated muxer.
#[derive(Debug, Error)]
pub enum MuxerError {
    /// The connection is closed; terminal for the connection.
    #[error("connection is closed")]
    ConnClosed,

    /// The stream was reset, locally or by the peer; terminal for the
    /// stream.
    #[error("stream was reset")]
    StreamReset,

    /// I/O on a direction that was closed deliberately.
    #[error("stream is closed")]
    StreamClosed,

    /// A deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The stream limit of the session was reached.
    #[error("too many streams")]
    TooManyStreams,

    /// The remote violated the muxer protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A resource reservation was denied.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// An I/O error on the underlying connection.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}
