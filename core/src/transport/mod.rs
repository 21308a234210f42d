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

//! Connection-level types: the raw connection a transport hands to the
//! upgrade pipeline, and the in-memory transport used throughout the test
//! suites.

pub mod memory;
pub mod upgrade;

use crate::muxing::StreamMuxer;
use crate::PeerId;
use futures::io::{AsyncRead, AsyncWrite};
use std::fmt;

/// Role of the local node in a connection.
///
/// Inbound means the local side acts as the server during negotiation and
/// handshake; outbound means it acts as the client and must know the
/// expected remote peer up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn is_inbound(&self) -> bool {
        matches!(self, Direction::Inbound)
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// A raw connection as delivered by a transport: an untrusted duplex byte
/// stream.
pub trait RawConn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Transports whose connections come out of the socket layer already
    /// authenticated and multiplexed (QUIC) return the finished pieces
    /// here, letting the upgrade pipeline skip negotiation, handshake and
    /// muxer setup entirely. At most one call returns `Some`.
    fn native_upgrade(&mut self) -> Option<NativeUpgrade> {
        None
    }
}

/// The result of a transport-level upgrade (see [`RawConn::native_upgrade`]).
pub struct NativeUpgrade {
    pub local_peer: PeerId,
    pub remote_peer: PeerId,
    pub muxer: Box<dyn StreamMuxer>,
}

impl fmt::Debug for NativeUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeUpgrade")
            .field("local_peer", &self.local_peer)
            .field("remote_peer", &self.remote_peer)
            .finish()
    }
}
