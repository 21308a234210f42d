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

//! The connection upgrade pipeline.
//!
//! An [`Upgrader`] turns a raw, untrusted byte stream into an
//! authenticated, encrypted, stream-multiplexed [`UpgradedConn`]:
//!
//! 1. transports that secure and multiplex natively (QUIC) pass through;
//! 2. a connection scope is reserved with the resource manager;
//! 3. a security protocol is negotiated over the raw connection;
//! 4. its handshake runs, authenticating the remote;
//! 5. the authenticated peer is bound to the resource scope;
//! 6. a muxer protocol is negotiated over the secured connection;
//! 7. the muxer session is set up;
//! 8. the pieces are assembled into an [`UpgradedConn`].
//!
//! Any failure aborts the pipeline and releases everything acquired by the
//! steps before it, in reverse order. Negotiation precedes the handshake so
//! both sides settle on an algorithm first; the handshake precedes muxer
//! selection so the muxer session runs inside the encrypted channel; the
//! peer is bound to the scope only after the handshake so an attacker
//! cannot exhaust another peer's quota with a claimed identity.

use crate::muxing::{MuxerError, MuxerTransport, StreamMuxer, MuxedStream};
use crate::resource::{ConnManagementScope, ResourceError, ResourceManager};
use crate::secure::{SecureConn, SecureTransport, SecurityError};
use crate::shutdown::ShutdownSignal;
use crate::transport::{Direction, RawConn};
use crate::{PeerId, ProtocolId};
use futures::io::AsyncWriteExt;
use log::{debug, trace, warn};
use multiselect::{dialer_select_proto, listener_select_proto, NegotiationError};
use smallvec::SmallVec;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const LOG_TARGET: &str = "peerlink::upgrade";

/// Synthetic security protocol id reported for natively-secured (QUIC)
/// connections.
pub const QUIC_SECURITY_PROTOCOL: &str = "/quic/tls/1.3";

/// Synthetic muxer protocol id reported for natively-multiplexed (QUIC)
/// connections.
pub const QUIC_MUXER_PROTOCOL: &str = "/quic/muxer/1.0";

/// Timeouts of the upgrade pipeline.
#[derive(Debug, Clone)]
pub struct UpgraderConfig {
    /// Bounds each of the two protocol negotiations.
    pub negotiate_timeout: Duration,
    /// Bounds the security handshake.
    pub handshake_timeout: Duration,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        UpgraderConfig {
            negotiate_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl UpgraderConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.negotiate_timeout.is_zero() {
            return Err(InvalidConfig("negotiate_timeout must be non-zero"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(InvalidConfig("handshake_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// A configuration constraint was violated.
#[derive(Debug, Error)]
#[error("invalid upgrader configuration: {0}")]
pub struct InvalidConfig(pub &'static str);

/// Upgrades raw connections. See the module documentation for the pipeline.
pub struct Upgrader {
    // Registries hold a handful of transports at most.
    security: SmallVec<[Arc<dyn SecureTransport>; 2]>,
    muxers: SmallVec<[Arc<dyn MuxerTransport>; 2]>,
    resources: Option<Arc<dyn ResourceManager>>,
    config: UpgraderConfig,
}

impl Upgrader {
    pub fn new(config: UpgraderConfig) -> Self {
        Upgrader {
            security: SmallVec::new(),
            muxers: SmallVec::new(),
            resources: None,
            config,
        }
    }

    /// Registers a security transport. Registration order is the outbound
    /// preference order.
    pub fn with_security(mut self, transport: Arc<dyn SecureTransport>) -> Self {
        self.security.push(transport);
        self
    }

    /// Registers a muxer transport. Registration order is the outbound
    /// preference order.
    pub fn with_muxer(mut self, transport: Arc<dyn MuxerTransport>) -> Self {
        self.muxers.push(transport);
        self
    }

    /// Attaches a resource manager. Without one, upgrades are not metered.
    pub fn with_resource_manager(mut self, rm: Arc<dyn ResourceManager>) -> Self {
        self.resources = Some(rm);
        self
    }

    /// Runs the upgrade pipeline on `conn`.
    ///
    /// Outbound upgrades must name the expected remote peer; the call fails
    /// with [`UpgradeError::NoPeerId`] otherwise, before acquiring
    /// anything. On success, `remote_peer()` of the result is
    /// cryptographically the expected one.
    pub async fn upgrade(
        &self,
        mut signal: ShutdownSignal,
        mut conn: Box<dyn RawConn>,
        direction: Direction,
        expected_remote: Option<PeerId>,
    ) -> Result<UpgradedConn, UpgradeError> {
        let expected_remote = match (&direction, expected_remote) {
            (Direction::Outbound, None) => return Err(UpgradeError::NoPeerId),
            (Direction::Outbound, Some(p)) if p.is_empty() => {
                return Err(UpgradeError::NoPeerId)
            }
            (_, expected) => expected,
        };

        // Step 1: QUIC passthrough.
        if let Some(native) = conn.native_upgrade() {
            trace!(target: LOG_TARGET, "{} conn is natively upgraded", direction);
            return Ok(UpgradedConn::new(
                native.muxer,
                native.local_peer,
                native.remote_peer,
                ProtocolId::from(QUIC_SECURITY_PROTOCOL),
                ProtocolId::from(QUIC_MUXER_PROTOCOL),
                None,
            ));
        }

        // Step 2: reserve a connection scope.
        let scope = match &self.resources {
            Some(rm) => match rm.open_connection(direction, true, None) {
                Ok(scope) => Some(scope),
                Err(e) => {
                    let _ = conn.close().await;
                    return Err(UpgradeError::ResourceReserve(e));
                }
            },
            None => None,
        };

        // Step 3: negotiate the security protocol over the raw connection.
        let security_protos: SmallVec<[ProtocolId; 2]> =
            self.security.iter().map(|t| t.protocol()).collect();
        let selected = match bounded(
            &mut signal,
            self.config.negotiate_timeout,
            select_proto(&mut conn, direction, &security_protos),
        )
        .await
        {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                release(&scope);
                let _ = conn.close().await;
                return Err(UpgradeError::SecurityNegotiation(e));
            }
            Err(abort) => {
                release(&scope);
                let _ = conn.close().await;
                return Err(abort.into_negotiation(UpgradeError::SecurityNegotiation));
            }
        };
        let security = match self.security.iter().find(|t| t.protocol() == selected) {
            Some(t) => t.clone(),
            None => {
                release(&scope);
                let _ = conn.close().await;
                return Err(UpgradeError::SecurityNegotiation(NegotiationError::NoProtocol));
            }
        };
        trace!(target: LOG_TARGET, "negotiated security protocol {}", selected);

        // Step 4: run the handshake. The raw connection moves into the
        // security transport; on failure (or timeout, which drops the
        // in-flight future) it is dropped and thereby closed.
        let handshake = async {
            match direction {
                Direction::Inbound => {
                    security.secure_inbound(conn, expected_remote.as_ref()).await
                }
                Direction::Outbound => {
                    let expected = expected_remote
                        .as_ref()
                        .expect("checked at entry for outbound");
                    security.secure_outbound(conn, expected).await
                }
            }
        };
        let secure_conn = match bounded(&mut signal, self.config.handshake_timeout, handshake)
            .await
        {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                release(&scope);
                return Err(UpgradeError::SecurityHandshake(e));
            }
            Err(abort) => {
                release(&scope);
                return Err(abort.into_handshake());
            }
        };

        let local_peer = secure_conn.local_peer();
        let remote_peer = secure_conn.remote_peer();

        // The security transport already verified the expectation; this
        // re-check keeps identity soundness independent of transport
        // implementations.
        if let Some(expected) = &expected_remote {
            if *expected != remote_peer {
                warn!(
                    target: LOG_TARGET,
                    "security transport {} returned peer {} instead of {}",
                    selected,
                    remote_peer.short_str(),
                    expected.short_str()
                );
                release(&scope);
                let mut secure_conn = secure_conn;
                let _ = secure_conn.close().await;
                return Err(UpgradeError::SecurityHandshake(
                    SecurityError::PeerMismatch {
                        expected: expected.clone(),
                        actual: remote_peer,
                    },
                ));
            }
        }

        // Step 5: bind the authenticated peer to the scope.
        if let (Some(conn_scope), false) = (&scope, remote_peer.is_empty()) {
            if let Err(e) = conn_scope.set_peer(&remote_peer) {
                conn_scope.done();
                let mut secure_conn = secure_conn;
                let _ = secure_conn.close().await;
                return Err(UpgradeError::ResourcePeer(e));
            }
        }

        // Step 6: negotiate the muxer protocol over the secured connection.
        let mut secure_conn = secure_conn;
        let muxer_protos: SmallVec<[ProtocolId; 2]> =
            self.muxers.iter().map(|t| t.protocol()).collect();
        let selected_muxer = match bounded(
            &mut signal,
            self.config.negotiate_timeout,
            select_proto(&mut secure_conn, direction, &muxer_protos),
        )
        .await
        {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                release(&scope);
                let _ = secure_conn.close().await;
                return Err(UpgradeError::MuxerNegotiation(e));
            }
            Err(abort) => {
                release(&scope);
                let _ = secure_conn.close().await;
                return Err(abort.into_negotiation(UpgradeError::MuxerNegotiation));
            }
        };
        let muxer = match self.muxers.iter().find(|t| t.protocol() == selected_muxer) {
            Some(t) => t.clone(),
            None => {
                release(&scope);
                let _ = secure_conn.close().await;
                return Err(UpgradeError::MuxerNegotiation(NegotiationError::NoProtocol));
            }
        };
        trace!(target: LOG_TARGET, "negotiated muxer protocol {}", selected_muxer);

        // Step 7: set up the muxer session inside the encrypted channel.
        let peer_scope = scope.as_ref().and_then(|s| s.peer_scope());
        let muxed = match muxer
            .new_conn(secure_conn, direction.is_inbound(), peer_scope)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                release(&scope);
                return Err(UpgradeError::MuxerSetup(e));
            }
        };

        debug!(
            target: LOG_TARGET,
            "{} connection to {} upgraded (security: {}, muxer: {})",
            direction,
            remote_peer.short_str(),
            selected,
            selected_muxer
        );

        // Step 8: assemble.
        Ok(UpgradedConn::new(
            muxed,
            local_peer,
            remote_peer,
            selected,
            selected_muxer,
            scope,
        ))
    }
}

async fn select_proto<R>(
    io: &mut R,
    direction: Direction,
    protocols: &[ProtocolId],
) -> Result<ProtocolId, NegotiationError>
where
    R: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin,
{
    match direction {
        Direction::Outbound => dialer_select_proto(io, protocols).await,
        Direction::Inbound => listener_select_proto(io, protocols).await,
    }
}

fn release(scope: &Option<Box<dyn ConnManagementScope>>) {
    if let Some(scope) = scope {
        scope.done();
    }
}

/// Why a bounded step stopped before its inner future finished.
enum StepAbort {
    Cancelled,
    TimedOut,
}

impl StepAbort {
    fn into_negotiation(self, wrap: fn(NegotiationError) -> UpgradeError) -> UpgradeError {
        match self {
            StepAbort::Cancelled => UpgradeError::Cancelled,
            StepAbort::TimedOut => wrap(NegotiationError::TimedOut),
        }
    }

    fn into_handshake(self) -> UpgradeError {
        match self {
            StepAbort::Cancelled => UpgradeError::Cancelled,
            StepAbort::TimedOut => UpgradeError::SecurityHandshake(SecurityError::TimedOut),
        }
    }
}

/// Runs `fut` bounded by both the shutdown signal and a timeout.
async fn bounded<F, T>(
    signal: &mut ShutdownSignal,
    timeout: Duration,
    fut: F,
) -> Result<T, StepAbort>
where
    F: Future<Output = T>,
{
    tokio::select! {
        _ = signal.wait() => Err(StepAbort::Cancelled),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| StepAbort::TimedOut),
    }
}

/// A fully upgraded connection: authenticated, encrypted, multiplexed.
pub struct UpgradedConn {
    muxer: Box<dyn StreamMuxer>,
    local_peer: PeerId,
    remote_peer: PeerId,
    security_protocol: ProtocolId,
    muxer_protocol: ProtocolId,
    scope: Option<Box<dyn ConnManagementScope>>,
    closed: AtomicBool,
}

impl UpgradedConn {
    fn new(
        muxer: Box<dyn StreamMuxer>,
        local_peer: PeerId,
        remote_peer: PeerId,
        security_protocol: ProtocolId,
        muxer_protocol: ProtocolId,
        scope: Option<Box<dyn ConnManagementScope>>,
    ) -> Self {
        UpgradedConn {
            muxer,
            local_peer,
            remote_peer,
            security_protocol,
            muxer_protocol,
            scope,
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer.clone()
    }

    /// The authenticated identity of the remote.
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer.clone()
    }

    /// The security protocol the connection settled on.
    pub fn security_protocol(&self) -> ProtocolId {
        self.security_protocol.clone()
    }

    /// The muxer protocol the connection settled on.
    pub fn muxer_protocol(&self) -> ProtocolId {
        self.muxer_protocol.clone()
    }

    pub async fn open_stream(&self) -> Result<Box<dyn MuxedStream>, MuxerError> {
        self.muxer.open_stream().await
    }

    pub async fn accept_stream(&self) -> Result<Box<dyn MuxedStream>, MuxerError> {
        self.muxer.accept_stream().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.muxer.is_closed()
    }

    /// Closes the muxed connection (which closes the secured connection
    /// underneath) and releases the resource scope. Idempotent.
    pub async fn close(&self) -> Result<(), MuxerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let res = self.muxer.close().await;
        if let Some(scope) = &self.scope {
            scope.done();
        }
        res
    }
}

impl Drop for UpgradedConn {
    fn drop(&mut self) {
        // The muxer shuts itself down once its handles are gone; the scope
        // release must not depend on the caller having closed explicitly.
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(scope) = &self.scope {
                scope.done();
            }
        }
    }
}

impl std::fmt::Debug for UpgradedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradedConn")
            .field("remote_peer", &self.remote_peer)
            .field("security", &self.security_protocol)
            .field("muxer", &self.muxer_protocol)
            .finish()
    }
}

/// Error of the upgrade pipeline. Every failure path releases the
/// resources acquired before it.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// An outbound upgrade was attempted without naming the remote.
    #[error("outbound upgrade requires the expected remote peer id")]
    NoPeerId,

    /// The resource manager denied the connection scope.
    #[error("resource reservation failed: {0}")]
    ResourceReserve(#[source] ResourceError),

    /// The resource manager denied binding the authenticated peer.
    #[error("binding peer to resource scope failed: {0}")]
    ResourcePeer(#[source] ResourceError),

    /// No common security protocol, or the negotiation broke down.
    #[error("security negotiation failed: {0}")]
    SecurityNegotiation(#[source] NegotiationError),

    /// The security handshake failed.
    #[error("security handshake failed: {0}")]
    SecurityHandshake(#[source] SecurityError),

    /// No common muxer protocol, or the negotiation broke down.
    #[error("muxer negotiation failed: {0}")]
    MuxerNegotiation(#[source] NegotiationError),

    /// The muxer session could not be set up.
    #[error("muxer setup failed: {0}")]
    MuxerSetup(#[source] MuxerError),

    /// The caller's context was cancelled mid-pipeline.
    #[error("upgrade was cancelled")]
    Cancelled,
}
