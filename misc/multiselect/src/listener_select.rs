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

use crate::dialer_select::valid_protocol;
use crate::protocol::{read_message, write_message, Message, NegotiationError};
use futures::prelude::*;
use log::{debug, trace};

const LOG_TARGET: &str = "multiselect::listener";

/// Negotiates a protocol in the listener role.
///
/// Reads the remote's offers and accepts the first one that appears in the
/// local `registry`, echoing it back as confirmation. Every other offer is
/// answered with `na`.
///
/// Fails with [`NegotiationError::NoProtocol`] when the remote gives up
/// (closes the stream at a message boundary) without a match.
pub async fn listener_select_proto<R, N>(
    io: &mut R,
    registry: &[N],
) -> Result<N, NegotiationError>
where
    R: AsyncRead + AsyncWrite + Unpin,
    N: AsRef<str> + Clone,
{
    write_message(io, &Message::Header).await?;
    io.flush().await?;
    match read_message(io).await {
        Ok(Message::Header) => {}
        Ok(_) => return Err(NegotiationError::Malformed),
        Err(e) => return Err(e),
    }

    loop {
        let offered = match read_message(io).await {
            Ok(Message::Protocol(p)) => p,
            // A clean hang-up after `na` replies means the dialer ran out
            // of protocols to offer.
            Err(NegotiationError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(NegotiationError::NoProtocol)
            }
            Ok(_) => return Err(NegotiationError::Malformed),
            Err(e) => return Err(e),
        };

        let name = std::str::from_utf8(&offered).map_err(|_| NegotiationError::Malformed)?;
        trace!(target: LOG_TARGET, "remote offered {}", name);

        if let Some(local) = registry
            .iter()
            .find(|p| valid_protocol(p.as_ref()) && p.as_ref() == name)
        {
            write_message(io, &Message::Protocol(offered.clone())).await?;
            io.flush().await?;
            debug!(target: LOG_TARGET, "negotiated {}", name);
            return Ok(local.clone());
        }

        write_message(io, &Message::NotAvailable).await?;
        io.flush().await?;
    }
}
