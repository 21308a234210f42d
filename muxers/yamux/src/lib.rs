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

//! Yamux stream multiplexing for peerlink.
//!
//! Carries many independent bidirectional streams over one secured
//! connection, with per-stream flow control (256 KiB initial credit raised
//! to the configured window), half-close, reset, deadlines and keepalive
//! pings. Buffer space is accounted against a resource-manager span when
//! one is provided.

mod connection;
mod frame;
mod stream;

pub use connection::{Mode, YamuxConn};
pub use stream::YamuxStream;

use async_trait::async_trait;
use peerlink_core::muxing::{MuxerError, MuxerTransport, StreamMuxer};
use peerlink_core::resource::PeerScope;
use peerlink_core::secure::SecureConn;
use peerlink_core::ProtocolId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Protocol id under which this muxer negotiates.
pub const YAMUX_PROTOCOL: &str = "/yamux/1.0.0";

/// Yamux configuration.
///
/// Defaults: a 16 MiB receive window per stream (the ceiling on each
/// stream's bandwidth-delay product), no bound on incoming streams beyond
/// what the resource manager enforces, keepalive every 30 seconds.
#[derive(Debug, Clone)]
pub struct Config {
    max_stream_window_size: u32,
    max_incoming_streams: u32,
    keepalive_interval: Duration,
    enable_keepalive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_stream_window_size: 16 * 1024 * 1024,
            max_incoming_streams: u32::MAX,
            keepalive_interval: Duration::from_secs(30),
            enable_keepalive: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Sets the per-stream receive window. Must be at least the 256 KiB
    /// initial credit of the yamux protocol.
    pub fn set_max_stream_window_size(&mut self, n: u32) -> &mut Self {
        self.max_stream_window_size = n;
        self
    }

    pub fn set_max_incoming_streams(&mut self, n: u32) -> &mut Self {
        self.max_incoming_streams = n;
        self
    }

    pub fn set_keepalive_interval(&mut self, interval: Duration) -> &mut Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn set_enable_keepalive(&mut self, enabled: bool) -> &mut Self {
        self.enable_keepalive = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_stream_window_size < connection::DEFAULT_CREDIT {
            return Err(ConfigError(
                "max_stream_window_size must be at least the 256 KiB initial credit",
            ));
        }
        if self.enable_keepalive && self.keepalive_interval.is_zero() {
            return Err(ConfigError("keepalive_interval must be non-zero"));
        }
        Ok(())
    }
}

/// A configuration constraint was violated.
#[derive(Debug, Error)]
#[error("invalid yamux configuration: {0}")]
pub struct ConfigError(pub &'static str);

/// The muxer transport: wraps secured connections into yamux sessions.
///
/// Configured once and shared across connections; per-connection mutation
/// is deliberately impossible.
pub struct YamuxTransport {
    cfg: Config,
}

impl YamuxTransport {
    pub fn new(cfg: Config) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(YamuxTransport { cfg })
    }
}

impl Default for YamuxTransport {
    fn default() -> Self {
        YamuxTransport { cfg: Config::default() }
    }
}

#[async_trait]
impl MuxerTransport for YamuxTransport {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::from(YAMUX_PROTOCOL)
    }

    async fn new_conn(
        &self,
        conn: Box<dyn SecureConn>,
        is_server: bool,
        peer_scope: Option<Arc<dyn PeerScope>>,
    ) -> Result<Box<dyn StreamMuxer>, MuxerError> {
        let mode = if is_server { Mode::Server } else { Mode::Client };
        let conn = YamuxConn::new(conn, self.cfg.clone(), mode, peer_scope)?;
        Ok(Box::new(conn))
    }
}
