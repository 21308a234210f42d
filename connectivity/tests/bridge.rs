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

//! The monitor <-> recovery loop, wired through the bridge.

use async_trait::async_trait;
use peerlink_connectivity::{
    Connector, HealthConfig, HealthMonitor, HealthState, MonitorBridge, RecoveryConfig,
    RecoveryManager,
};
use peerlink_core::{BoxError, Multiaddr, PeerId, ShutdownSignal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct StaticConnector {
    connections: usize,
    dials: AtomicUsize,
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(&self, _signal: ShutdownSignal, _peer: &PeerId) -> Result<(), BoxError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.connections > 0 {
            Ok(())
        } else {
            Err("unreachable".into())
        }
    }

    async fn connect_with_addrs(
        &self,
        signal: ShutdownSignal,
        peer: &PeerId,
        _addrs: &[Multiaddr],
    ) -> Result<(), BoxError> {
        self.connect(signal, peer).await
    }

    fn connection_count(&self) -> usize {
        self.connections
    }
}

fn quick_monitor(max_attempts: u32) -> Arc<HealthMonitor> {
    let mut cfg = HealthConfig::default();
    cfg.error_threshold = 2;
    cfg.state_change_debounce = Duration::from_millis(10);
    cfg.max_recovery_attempts = max_attempts;
    HealthMonitor::new(cfg).unwrap()
}

async fn wait_for_state(monitor: &Arc<HealthMonitor>, target: HealthState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while monitor.state() != target {
        assert!(
            Instant::now() < deadline,
            "monitor never reached {:?}, stuck at {:?}",
            target,
            monitor.state()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn down_transition_drives_recovery_to_success() {
    let _ = env_logger::try_init();
    let monitor = quick_monitor(5);
    let manager = RecoveryManager::new(RecoveryConfig::default()).unwrap();
    manager.set_connector(Arc::new(StaticConnector {
        connections: 1,
        dials: AtomicUsize::new(0),
    }));
    manager.set_critical_peers(vec![PeerId::random()], vec![]);

    let bridge = MonitorBridge::new(monitor.clone(), manager.clone());
    bridge.start();
    // Let the listener subscribe before transitions happen.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let peer = PeerId::random();
    monitor.on_send_error(&peer, "timed out").await;
    monitor.on_send_error(&peer, "timed out").await;

    // Down -> (bridge) Recovering -> recovery succeeds -> Healthy.
    wait_for_state(&monitor, HealthState::Healthy).await;
    assert_eq!(manager.attempt_count(), 0);
    assert_eq!(monitor.recovery_attempts(), 0);

    bridge.stop().await;
}

#[tokio::test]
async fn failed_recovery_stops_after_max_attempts() {
    let _ = env_logger::try_init();
    let monitor = quick_monitor(2);
    let manager = RecoveryManager::new(RecoveryConfig::default()).unwrap();
    let connector = Arc::new(StaticConnector {
        connections: 0,
        dials: AtomicUsize::new(0),
    });
    manager.set_connector(connector.clone());
    manager.set_critical_peers(vec![PeerId::random()], vec![]);

    let bridge = MonitorBridge::new(monitor.clone(), manager.clone());
    bridge.start();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let peer = PeerId::random();
    monitor.on_send_error(&peer, "timed out").await;
    monitor.on_send_error(&peer, "timed out").await;

    // The loop retries until the attempt budget is gone, then stays Down.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !monitor.recovery_attempts_exhausted() {
        assert!(Instant::now() < deadline, "attempts never exhausted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wait_for_state(&monitor, HealthState::Down).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(monitor.recovery_attempts(), 2);

    bridge.stop().await;
}

#[tokio::test]
async fn bridge_lifecycle_is_idempotent() {
    let monitor = quick_monitor(5);
    let manager = RecoveryManager::new(RecoveryConfig::default()).unwrap();
    let bridge = MonitorBridge::new(monitor.clone(), manager);

    // Stop before start is a no-op.
    bridge.stop().await;
    bridge.start();
    bridge.start();
    bridge.stop().await;
    bridge.stop().await;
}

#[tokio::test]
async fn stopped_bridge_ignores_transitions() {
    let _ = env_logger::try_init();
    let monitor = quick_monitor(5);
    let manager = RecoveryManager::new(RecoveryConfig::default()).unwrap();
    let connector = Arc::new(StaticConnector {
        connections: 1,
        dials: AtomicUsize::new(0),
    });
    manager.set_connector(connector.clone());
    manager.set_critical_peers(vec![PeerId::random()], vec![]);

    let bridge = MonitorBridge::new(monitor.clone(), manager.clone());
    bridge.start();
    tokio::time::sleep(Duration::from_millis(20)).await;
    bridge.stop().await;

    let peer = PeerId::random();
    monitor.on_send_error(&peer, "network is unreachable").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(monitor.state(), HealthState::Down);
    assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
}
