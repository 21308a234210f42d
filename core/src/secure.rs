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

//! Security capabilities: the seam between the upgrade pipeline and the
//! concrete handshake implementations (TLS, Noise, ...), which live in
//! their own crates.

use crate::transport::RawConn;
use crate::{PeerId, ProtocolId};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use std::io;
use thiserror::Error;

/// An authenticated, encrypted duplex stream.
///
/// After the handshake, [`SecureConn::remote_peer`] is cryptographically
/// bound to the remote's key material; the upgrade pipeline is entitled to
/// trust it.
pub trait SecureConn: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_peer(&self) -> PeerId;

    fn remote_peer(&self) -> PeerId;
}

/// A security protocol: performs the handshake that turns a raw connection
/// into a [`SecureConn`].
#[async_trait]
pub trait SecureTransport: Send + Sync {
    /// Identity of the security protocol, e.g. `/tls/1.3`.
    fn protocol(&self) -> ProtocolId;

    /// Handshakes as the server.
    ///
    /// `expected` is usually absent inbound; when present, the transport
    /// must fail with [`SecurityError::PeerMismatch`] if the handshake
    /// derives a different peer.
    async fn secure_inbound(
        &self,
        conn: Box<dyn RawConn>,
        expected: Option<&PeerId>,
    ) -> Result<Box<dyn SecureConn>, SecurityError>;

    /// Handshakes as the client.
    ///
    /// Must fail with [`SecurityError::PeerMismatch`] when the
    /// handshake-derived peer id differs from `expected`.
    async fn secure_outbound(
        &self,
        conn: Box<dyn RawConn>,
        expected: &PeerId,
    ) -> Result<Box<dyn SecureConn>, SecurityError>;
}

/// Failure of a security handshake.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The handshake succeeded cryptographically but authenticated a peer
    /// other than the expected one. Never retried with the same
    /// expectation.
    #[error("handshake authenticated {actual} but {expected} was expected")]
    PeerMismatch { expected: PeerId, actual: PeerId },

    /// The cryptographic exchange itself failed.
    #[error("handshake failed: {0}")]
    Crypto(String),

    /// The handshake did not complete within the caller's deadline.
    #[error("handshake timed out")]
    TimedOut,

    /// An I/O error on the underlying connection.
    #[error("i/o during handshake: {0}")]
    Io(#[from] io::Error),
}
