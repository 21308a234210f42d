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

//! The negotiation wire protocol: varint-length-prefixed messages, each
//! carrying either the protocol header, a protocol offer/acknowledgement,
//! or the `na` rejection.

use bytes::{BufMut, Bytes, BytesMut};
use futures::prelude::*;
use std::io;
use thiserror::Error;
use unsigned_varint::{decode, encode};

/// The header line both sides send before anything else.
const HEADER: &[u8] = b"/multiselect/1.0.0\n";

/// Reply sent by the listener for an offer it does not support.
const NA: &[u8] = b"na\n";

/// Upper bound on a single negotiation message, header and newline included.
///
/// Anything longer is a protocol violation; real protocol ids are tiny and
/// the bound keeps a misbehaving remote from making us buffer arbitrarily.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// A single message of the negotiation exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The `/multiselect/1.0.0` header line.
    Header,
    /// A protocol, sent by the dialer as an offer and echoed back by the
    /// listener as the acknowledgement.
    Protocol(Bytes),
    /// `na`: the listener does not support the offered protocol.
    NotAvailable,
}

impl Message {
    fn to_bytes(&self) -> Bytes {
        match self {
            Message::Header => Bytes::from_static(HEADER),
            Message::NotAvailable => Bytes::from_static(NA),
            Message::Protocol(p) => {
                let mut buf = BytesMut::with_capacity(p.len() + 1);
                buf.put_slice(p);
                buf.put_u8(b'\n');
                buf.freeze()
            }
        }
    }

    fn from_bytes(bytes: &[u8]) -> Result<Message, NegotiationError> {
        if bytes == HEADER {
            return Ok(Message::Header);
        }
        if bytes == NA {
            return Ok(Message::NotAvailable);
        }
        // A protocol id starts with `/` and ends with the newline that
        // terminates every message.
        match bytes.split_last() {
            Some((b'\n', proto)) if proto.first() == Some(&b'/') => {
                Ok(Message::Protocol(Bytes::copy_from_slice(proto)))
            }
            _ => Err(NegotiationError::Malformed),
        }
    }
}

/// Writes one message, without flushing.
pub(crate) async fn write_message<W>(io: &mut W, msg: &Message) -> Result<(), NegotiationError>
where
    W: AsyncWrite + Unpin,
{
    let body = msg.to_bytes();
    debug_assert!(body.len() <= MAX_MESSAGE_LEN);
    let mut len_buf = encode::usize_buffer();
    io.write_all(encode::usize(body.len(), &mut len_buf)).await?;
    io.write_all(&body).await?;
    Ok(())
}

/// Reads one message.
pub(crate) async fn read_message<R>(io: &mut R) -> Result<Message, NegotiationError>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint(io).await?;
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(NegotiationError::Malformed);
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await.map_err(unexpected_eof_is_malformed)?;
    Message::from_bytes(&buf)
}

async fn read_varint<R>(io: &mut R) -> Result<usize, NegotiationError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 10];
    for i in 0..buf.len() {
        if i == 0 {
            // EOF before the first byte of a message is a clean hang-up and
            // surfaces as such; EOF anywhere later is a framing violation.
            if io.read(&mut buf[..1]).await? == 0 {
                return Err(NegotiationError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
        } else {
            io.read_exact(&mut buf[i..=i]).await.map_err(unexpected_eof_is_malformed)?;
        }
        // A clear continuation bit terminates the varint.
        if buf[i] & 0x80 == 0 {
            let (len, _) = decode::usize(&buf[..=i]).map_err(|_| NegotiationError::Malformed)?;
            return Ok(len);
        }
    }
    // Longer than any valid usize varint.
    Err(NegotiationError::Malformed)
}

fn unexpected_eof_is_malformed(e: io::Error) -> NegotiationError {
    // The remote hanging up mid-message is a framing violation, not a
    // transport failure of ours.
    if e.kind() == io::ErrorKind::UnexpectedEof {
        NegotiationError::Malformed
    } else {
        NegotiationError::Io(e)
    }
}

/// Error produced while negotiating a protocol with the remote.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The exchange completed but no protocol was agreed upon.
    #[error("no protocol could be agreed upon")]
    NoProtocol,

    /// The negotiation did not complete within the caller's deadline.
    #[error("protocol negotiation timed out")]
    TimedOut,

    /// The remote sent a message that violates the negotiation protocol.
    #[error("received a malformed negotiation message")]
    Malformed,

    /// An I/O error on the underlying connection.
    #[error("i/o error during negotiation: {0}")]
    Io(#[from] io::Error),
}
