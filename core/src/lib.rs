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

//! Core traits and structs of peerlink.
//!
//! The crate defines the vocabulary the rest of the stack is written in:
//!
//! - identifiers ([`PeerId`], [`ProtocolId`]) and the [`Direction`] of a
//!   connection;
//! - the capability traits a transport stack is assembled from:
//!   [`transport::RawConn`] for a freshly established connection,
//!   [`secure::SecureTransport`]/[`secure::SecureConn`] for authentication,
//!   [`muxing::MuxerTransport`]/[`muxing::StreamMuxer`]/[`muxing::MuxedStream`]
//!   for stream multiplexing, and the [`resource`] scopes that meter all of
//!   it;
//! - the [`transport::upgrade::Upgrader`], which composes those capabilities
//!   into the pipeline that turns a raw byte stream into an authenticated,
//!   encrypted, multiplexed connection;
//! - [`shutdown`] signalling, the explicit cancellation context every
//!   suspendable operation takes.

mod peer_id;

pub mod muxing;
pub mod resource;
pub mod secure;
pub mod shutdown;
pub mod transport;

pub use multiaddr::Multiaddr;
pub use peer_id::PeerId;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use transport::upgrade::{UpgradeError, UpgradedConn, Upgrader, UpgraderConfig};
pub use transport::Direction;

use std::borrow::Cow;
use std::fmt;

/// A boxed error used at the boundaries where collaborators plug in their
/// own failure types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Identifier of a protocol, e.g. `/yamux/1.0.0`.
///
/// The same value serves as registry key and as the bytes exchanged during
/// negotiation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(Cow<'static, str>);

impl ProtocolId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for ProtocolId {
    fn from(s: &'static str) -> Self {
        ProtocolId(Cow::Borrowed(s))
    }
}

impl From<String> for ProtocolId {
    fn from(s: String) -> Self {
        ProtocolId(Cow::Owned(s))
    }
}

impl AsRef<str> for ProtocolId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ProtocolId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ProtocolId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
