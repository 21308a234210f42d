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

//! Boundary interfaces for the event sources the health monitor consumes.
//! Concrete implementations (ICMP/QUIC probes, netlink watchers, address
//! observers) live outside this crate; the monitor only needs the shapes
//! defined here.

use async_trait::async_trait;
use futures::stream::BoxStream;
use multiaddr::Multiaddr;
use peerlink_core::{PeerId, ShutdownSignal};
use std::time::SystemTime;

/// Outcome of one reachability probe across the peer set.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    /// The probe itself ran to completion.
    pub success: bool,
    pub reachable_peers: usize,
    pub total_peers: usize,
    /// Peers that failed the probe. Probers that cannot attribute failures
    /// leave this `None`; the monitor then never derives "degraded" from
    /// the result.
    pub failed_peers: Option<Vec<PeerId>>,
    pub error: Option<String>,
}

impl ProbeResult {
    /// Nothing reachable although peers exist.
    pub fn is_down(&self) -> bool {
        self.reachable_peers == 0 && self.total_peers > 0
    }

    /// Some peers reachable, some attributably failing.
    pub fn is_degraded(&self) -> bool {
        self.reachable_peers > 0
            && self
                .failed_peers
                .as_ref()
                .map(|f| !f.is_empty())
                .unwrap_or(false)
    }

    pub fn is_healthy(&self) -> bool {
        self.success && self.reachable_peers > 0
    }
}

/// Actively probes the environment for reachability.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, signal: ShutdownSignal) -> ProbeResult;
}

/// A prober that always reports a healthy network. Attached when no real
/// prober is configured.
#[derive(Debug, Default, Clone)]
pub struct NoopProber;

#[async_trait]
impl Prober for NoopProber {
    async fn probe(&self, _signal: ShutdownSignal) -> ProbeResult {
        ProbeResult {
            success: true,
            reachable_peers: 1,
            total_peers: 1,
            failed_peers: Some(Vec::new()),
            error: None,
        }
    }
}

/// Kind of an OS-level network event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEventKind {
    InterfaceUp,
    InterfaceDown,
    AddressAdded,
    AddressRemoved,
    RouteChanged,
    GatewayChanged,
    NetworkChanged,
}

impl NetworkEventKind {
    /// Major events force a health degradation on their own.
    pub fn is_major(&self) -> bool {
        matches!(
            self,
            NetworkEventKind::InterfaceDown
                | NetworkEventKind::GatewayChanged
                | NetworkEventKind::NetworkChanged
        )
    }
}

/// One OS-level network event.
#[derive(Debug, Clone)]
pub struct NetworkEvent {
    pub kind: NetworkEventKind,
    pub interface: Option<String>,
    pub address: Option<Multiaddr>,
    pub timestamp: SystemTime,
}

/// Watches the operating system for interface, route and gateway changes.
///
/// Implementations are event-driven where the OS supports it and fall back
/// to polling (typically every 5 seconds) where it does not.
pub trait SystemWatcher: Send + Sync {
    fn events(&self) -> BoxStream<'static, NetworkEvent>;
}

/// Severity of an address-set change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChangeKind {
    Major,
    Minor,
}

/// Higher-level address churn, from whatever tracks the node's own
/// addresses.
#[derive(Debug, Clone)]
pub struct NetworkChangeEvent {
    pub kind: NetworkChangeKind,
    pub old_addrs: Vec<Multiaddr>,
    pub new_addrs: Vec<Multiaddr>,
}

/// Source of [`NetworkChangeEvent`]s. Only major changes cause health
/// transitions.
pub trait NetworkMonitor: Send + Sync {
    fn subscribe(&self) -> BoxStream<'static, NetworkChangeEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_classification() {
        let down = ProbeResult { success: true, reachable_peers: 0, total_peers: 3, ..Default::default() };
        assert!(down.is_down() && !down.is_degraded() && !down.is_healthy());

        let degraded = ProbeResult {
            success: true,
            reachable_peers: 2,
            total_peers: 3,
            failed_peers: Some(vec![PeerId::random()]),
            error: None,
        };
        assert!(degraded.is_degraded() && !degraded.is_down());

        // An absent failed-peers list never counts as degraded.
        let unattributed = ProbeResult {
            success: true,
            reachable_peers: 2,
            total_peers: 3,
            failed_peers: None,
            error: None,
        };
        assert!(!unattributed.is_degraded());
        assert!(unattributed.is_healthy());
    }

    #[tokio::test]
    async fn noop_prober_is_always_healthy() {
        let result = NoopProber.probe(ShutdownSignal::noop()).await;
        assert!(result.is_healthy());
        assert!(!result.is_down());
        assert!(!result.is_degraded());
    }

    #[test]
    fn major_event_kinds() {
        assert!(NetworkEventKind::InterfaceDown.is_major());
        assert!(NetworkEventKind::GatewayChanged.is_major());
        assert!(NetworkEventKind::NetworkChanged.is_major());
        assert!(!NetworkEventKind::AddressAdded.is_major());
        assert!(!NetworkEventKind::RouteChanged.is_major());
    }
}
