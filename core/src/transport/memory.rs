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

//! An in-memory transport: a pair of connected duplex channels.
//!
//! Every protocol-level test in the workspace runs over this transport,
//! which behaves like a loss-free, instantly-connected socket. Dropping one
//! end surfaces as EOF on the other.

use crate::transport::RawConn;
use bytes::{Buf, Bytes};
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite};
use futures::prelude::*;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Creates a pair of connected in-memory connections.
pub fn pair() -> (MemoryConn, MemoryConn) {
    let (a_tx, a_rx) = mpsc::unbounded();
    let (b_tx, b_rx) = mpsc::unbounded();
    (MemoryConn::new(a_rx, b_tx), MemoryConn::new(b_rx, a_tx))
}

/// One endpoint of an in-memory connection.
pub struct MemoryConn {
    incoming: mpsc::UnboundedReceiver<Bytes>,
    outgoing: mpsc::UnboundedSender<Bytes>,
    /// Data received but not yet claimed by a read.
    current: Bytes,
}

impl MemoryConn {
    fn new(incoming: mpsc::UnboundedReceiver<Bytes>, outgoing: mpsc::UnboundedSender<Bytes>) -> Self {
        MemoryConn {
            incoming,
            outgoing,
            current: Bytes::new(),
        }
    }
}

impl AsyncRead for MemoryConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.len());
                buf[..n].copy_from_slice(&self.current[..n]);
                self.current.advance(n);
                return Poll::Ready(Ok(n));
            }
            match Pin::new(&mut self.incoming).poll_next(cx) {
                Poll::Ready(Some(chunk)) => self.current = chunk,
                // Sender dropped: clean EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MemoryConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.outgoing.unbounded_send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.outgoing.close_channel();
        Poll::Ready(Ok(()))
    }
}

impl RawConn for MemoryConn {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_across_the_pair() {
        let (mut a, mut b) = pair();
        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn drop_means_eof() {
        let (a, mut b) = pair();
        drop(a);
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_means_eof() {
        let (mut a, mut b) = pair();
        a.write_all(b"x").await.unwrap();
        a.close().await.unwrap();
        let mut buf = Vec::new();
        b.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"x");
    }
}
