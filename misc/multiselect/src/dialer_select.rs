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

use crate::protocol::{read_message, write_message, Message, NegotiationError, MAX_MESSAGE_LEN};
use bytes::Bytes;
use futures::prelude::*;
use log::{debug, trace};

const LOG_TARGET: &str = "multiselect::dialer";

/// Negotiates a protocol in the dialer role.
///
/// Offers `protocols` to the remote one at a time, in order, and returns the
/// first one the remote accepts. The iteration order of `protocols` thus
/// defines the local preference, and the outcome is the first element that
/// both sides support.
///
/// Fails with [`NegotiationError::NoProtocol`] when every offer is answered
/// with `na`. The I/O resource is left untouched past the final negotiation
/// message; on error it is the caller's to close.
pub async fn dialer_select_proto<R, N>(
    io: &mut R,
    protocols: &[N],
) -> Result<N, NegotiationError>
where
    R: AsyncRead + AsyncWrite + Unpin,
    N: AsRef<str> + Clone,
{
    write_message(io, &Message::Header).await?;
    io.flush().await?;
    match read_message(io).await? {
        Message::Header => {}
        _ => return Err(NegotiationError::Malformed),
    }

    for proto in protocols {
        let name = proto.as_ref();
        if !valid_protocol(name) {
            debug!(target: LOG_TARGET, "refusing to offer invalid protocol {:?}", name);
            continue;
        }
        trace!(target: LOG_TARGET, "offering {}", name);
        let offered = Bytes::copy_from_slice(name.as_bytes());
        write_message(io, &Message::Protocol(offered.clone())).await?;
        io.flush().await?;

        match read_message(io).await? {
            Message::Protocol(echoed) if echoed == offered => {
                debug!(target: LOG_TARGET, "negotiated {}", name);
                return Ok(proto.clone());
            }
            Message::NotAvailable => {
                trace!(target: LOG_TARGET, "remote rejected {}", name);
            }
            _ => return Err(NegotiationError::Malformed),
        }
    }

    Err(NegotiationError::NoProtocol)
}

pub(crate) fn valid_protocol(name: &str) -> bool {
    !name.is_empty()
        && name.len() < MAX_MESSAGE_LEN
        && name.starts_with('/')
        && !name.contains('\n')
}
