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

use std::{fmt, str::FromStr};
use thiserror::Error;

/// How many logical characters of a peer id end up in log lines.
const SHORT_STR_CHARS: usize = 8;

/// Identifier of a remote endpoint, derived from that peer's public key.
///
/// A `PeerId` is opaque to this crate: identity generation and the
/// key-to-id derivation live with the security transports. Ids are compared
/// for equality and never mutated.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    bytes: Vec<u8>,
}

impl PeerId {
    /// Builds a `PeerId` from the raw bytes a security handshake produced.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        PeerId { bytes }
    }

    /// A `PeerId` carrying no identity at all.
    ///
    /// Security transports that cannot name the remote yet (inbound, before
    /// the handshake) use this as the placeholder; it never matches a real
    /// id.
    pub fn empty() -> Self {
        PeerId { bytes: Vec::new() }
    }

    /// Generates a random id. Useful for tests and for transports that
    /// assign ephemeral identities.
    pub fn random() -> Self {
        PeerId {
            bytes: (0..32).map(|_| rand::random::<u8>()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The base58 rendering, the canonical textual form.
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.bytes).into_string()
    }

    /// A truncated rendering for log lines.
    ///
    /// Truncation iterates code points, never raw bytes, so ids containing
    /// multi-byte characters are not sliced mid-character.
    pub fn short_str(&self) -> String {
        let full = self.to_base58();
        full.chars().take(SHORT_STR_CHARS).collect()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short_str())
    }
}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        Ok(PeerId { bytes })
    }
}

/// Error when parsing a [`PeerId`] from its textual form.
#[derive(Debug, Error)]
#[error("invalid base58 peer id: {0}")]
pub struct ParsePeerIdError(#[from] bs58::decode::Error);
