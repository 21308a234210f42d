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

//! Plaintext "security" transport.
//!
//! Exchanges peer ids in the clear and performs no encryption whatsoever.
//! It exists so the upgrade pipeline can be exercised end-to-end without a
//! cryptographic handshake: tests and fully trusted networks only. The
//! identity it reports is claimed, not proven.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::io::{AsyncRead, AsyncWrite};
use futures::prelude::*;
use log::trace;
use peerlink_core::secure::{SecureConn, SecureTransport, SecurityError};
use peerlink_core::transport::RawConn;
use peerlink_core::{PeerId, ProtocolId};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

const LOG_TARGET: &str = "peerlink::plaintext";

/// Protocol id under which this transport negotiates.
pub const PLAINTEXT_PROTOCOL: &str = "/plaintext/2.0.0";

/// Ids longer than this are rejected during the exchange.
const MAX_ID_LEN: usize = 1024;

/// The plaintext transport; one instance per local identity.
#[derive(Clone)]
pub struct PlainTextConfig {
    local_peer: PeerId,
}

impl PlainTextConfig {
    pub fn new(local_peer: PeerId) -> Self {
        PlainTextConfig { local_peer }
    }

    async fn exchange_ids(
        &self,
        conn: &mut Box<dyn RawConn>,
    ) -> Result<PeerId, SecurityError> {
        let local = self.local_peer.as_bytes();
        let mut hello = BytesMut::with_capacity(4 + local.len());
        hello.put_u32(local.len() as u32);
        hello.put_slice(local);
        conn.write_all(&hello).await?;
        conn.flush().await?;

        let mut len_buf = [0u8; 4];
        conn.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_ID_LEN {
            return Err(SecurityError::Crypto(format!(
                "remote id length {} exceeds maximum",
                len
            )));
        }
        let mut id = vec![0u8; len];
        conn.read_exact(&mut id).await?;
        Ok(PeerId::from_bytes(id))
    }
}

#[async_trait]
impl SecureTransport for PlainTextConfig {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::from(PLAINTEXT_PROTOCOL)
    }

    async fn secure_inbound(
        &self,
        mut conn: Box<dyn RawConn>,
        expected: Option<&PeerId>,
    ) -> Result<Box<dyn SecureConn>, SecurityError> {
        let remote = self.exchange_ids(&mut conn).await?;
        trace!(target: LOG_TARGET, "inbound exchange: remote is {}", remote.short_str());
        if let Some(expected) = expected {
            if *expected != remote {
                return Err(SecurityError::PeerMismatch {
                    expected: expected.clone(),
                    actual: remote,
                });
            }
        }
        Ok(Box::new(PlainTextConn {
            inner: conn,
            local_peer: self.local_peer.clone(),
            remote_peer: remote,
        }))
    }

    async fn secure_outbound(
        &self,
        mut conn: Box<dyn RawConn>,
        expected: &PeerId,
    ) -> Result<Box<dyn SecureConn>, SecurityError> {
        let remote = self.exchange_ids(&mut conn).await?;
        trace!(target: LOG_TARGET, "outbound exchange: remote is {}", remote.short_str());
        if *expected != remote {
            return Err(SecurityError::PeerMismatch {
                expected: expected.clone(),
                actual: remote,
            });
        }
        Ok(Box::new(PlainTextConn {
            inner: conn,
            local_peer: self.local_peer.clone(),
            remote_peer: remote,
        }))
    }
}

/// A connection whose "handshake" was a plaintext id exchange.
pub struct PlainTextConn {
    inner: Box<dyn RawConn>,
    local_peer: PeerId,
    remote_peer: PeerId,
}

impl SecureConn for PlainTextConn {
    fn local_peer(&self) -> PeerId {
        self.local_peer.clone()
    }

    fn remote_peer(&self) -> PeerId {
        self.remote_peer.clone()
    }
}

impl AsyncRead for PlainTextConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PlainTextConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::transport::memory;

    #[tokio::test]
    async fn ids_are_exchanged() {
        let a_id = PeerId::random();
        let b_id = PeerId::random();
        let (a_conn, b_conn) = memory::pair();

        let a = PlainTextConfig::new(a_id.clone());
        let b = PlainTextConfig::new(b_id.clone());

        let (a_res, b_res) = future::join(
            a.secure_outbound(Box::new(a_conn), &b_id),
            b.secure_inbound(Box::new(b_conn), None),
        )
        .await;

        let a_secured = a_res.unwrap();
        let b_secured = b_res.unwrap();
        assert_eq!(a_secured.remote_peer(), b_id);
        assert_eq!(b_secured.remote_peer(), a_id);
        assert_eq!(a_secured.local_peer(), a_id);
    }

    #[tokio::test]
    async fn outbound_rejects_wrong_peer() {
        let a_id = PeerId::random();
        let b_id = PeerId::random();
        let someone_else = PeerId::random();
        let (a_conn, b_conn) = memory::pair();

        let a = PlainTextConfig::new(a_id);
        let b = PlainTextConfig::new(b_id);

        let (a_res, _b_res) = future::join(
            a.secure_outbound(Box::new(a_conn), &someone_else),
            b.secure_inbound(Box::new(b_conn), None),
        )
        .await;

        assert!(matches!(
            a_res,
            Err(SecurityError::PeerMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn data_flows_after_exchange() {
        let (a_conn, b_conn) = memory::pair();
        let a = PlainTextConfig::new(PeerId::random());
        let b_id = PeerId::random();
        let b = PlainTextConfig::new(b_id.clone());

        let (a_res, b_res) = future::join(
            a.secure_outbound(Box::new(a_conn), &b_id),
            b.secure_inbound(Box::new(b_conn), None),
        )
        .await;
        let mut a_secured = a_res.unwrap();
        let mut b_secured = b_res.unwrap();

        a_secured.write_all(b"in the clear").await.unwrap();
        let mut buf = [0u8; 12];
        b_secured.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"in the clear");
    }
}
