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

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_connectivity::{
    AddressDiscoverer, Connector, Rebinder, RecoveryConfig, RecoveryError, RecoveryManager,
    RecoveryReason, StateChangeReason,
};
use peerlink_core::{BoxError, Multiaddr, PeerId, ShutdownSignal};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockConnector {
    /// `connect` succeeds when true.
    connect_ok: AtomicBool,
    /// `connect_with_addrs` succeeds when true.
    with_addrs_ok: AtomicBool,
    connections: AtomicUsize,
    calls: Mutex<Vec<&'static str>>,
    delay: Mutex<Option<Duration>>,
}

impl MockConnector {
    fn succeeding() -> Arc<MockConnector> {
        let c = MockConnector::default();
        c.connect_ok.store(true, Ordering::SeqCst);
        c.with_addrs_ok.store(true, Ordering::SeqCst);
        c.connections.store(1, Ordering::SeqCst);
        Arc::new(c)
    }

    fn failing() -> Arc<MockConnector> {
        Arc::new(MockConnector::default())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _signal: ShutdownSignal, _peer: &PeerId) -> Result<(), BoxError> {
        self.calls.lock().push("connect");
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.connect_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("dial failed".into())
        }
    }

    async fn connect_with_addrs(
        &self,
        _signal: ShutdownSignal,
        _peer: &PeerId,
        _addrs: &[Multiaddr],
    ) -> Result<(), BoxError> {
        self.calls.lock().push("connect_with_addrs");
        if self.with_addrs_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("address unreachable".into())
        }
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockRebinder {
    needed: AtomicBool,
    rebinds: AtomicUsize,
}

#[async_trait]
impl Rebinder for MockRebinder {
    fn is_rebind_needed(&self) -> bool {
        self.needed.load(Ordering::SeqCst)
    }

    async fn rebind(&self, _signal: ShutdownSignal) -> Result<(), BoxError> {
        self.rebinds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockDiscoverer {
    runs: AtomicUsize,
}

#[async_trait]
impl AddressDiscoverer for MockDiscoverer {
    async fn discover(&self, _signal: ShutdownSignal) -> Result<Vec<Multiaddr>, BoxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["/ip4/192.0.2.1/tcp/4001".parse().unwrap()])
    }
}

fn manager() -> Arc<RecoveryManager> {
    RecoveryManager::new(RecoveryConfig::default()).unwrap()
}

#[tokio::test]
async fn success_resets_the_attempt_counter() {
    let manager = manager();
    let connector = MockConnector::failing();
    manager.set_connector(connector.clone());
    manager.set_critical_peers(vec![PeerId::random()], vec![]);

    for _ in 0..3 {
        let result = manager
            .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ErrorThreshold)
            .await;
        assert!(!result.success);
        assert_eq!(result.error, Some(RecoveryError::Failed));
    }
    assert_eq!(manager.attempt_count(), 3);

    // Now the network is back.
    connector.connect_ok.store(true, Ordering::SeqCst);
    connector.connections.store(1, Ordering::SeqCst);

    let result = manager
        .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ManualTrigger)
        .await;
    assert!(result.success);
    assert_eq!(result.attempts, 4);
    assert_eq!(manager.attempt_count(), 0);
    assert!(manager.last_recovery_at().is_some());
}

#[tokio::test]
async fn known_address_fails_over_to_plain_dial() {
    let manager = manager();
    let connector = MockConnector::failing();
    // The direct path fails, the fallback dial succeeds.
    connector.connect_ok.store(true, Ordering::SeqCst);
    connector.connections.store(1, Ordering::SeqCst);
    manager.set_connector(connector.clone());
    manager.set_critical_peers(
        vec![PeerId::random()],
        vec!["/ip4/1.1.1.1/tcp/4001".parse().unwrap()],
    );

    let result = manager
        .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ManualTrigger)
        .await;

    assert!(result.success);
    assert_eq!(result.connections_restored, 1);
    assert_eq!(
        *connector.calls.lock(),
        vec!["connect_with_addrs", "connect"],
        "both methods, in that order, exactly once each"
    );
}

#[tokio::test]
async fn known_address_is_preferred_when_it_works() {
    let manager = manager();
    let connector = MockConnector::succeeding();
    manager.set_connector(connector.clone());
    manager.set_critical_peers(
        vec![PeerId::random()],
        vec!["/ip4/1.1.1.1/tcp/4001".parse().unwrap()],
    );

    let result = manager
        .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ManualTrigger)
        .await;

    assert!(result.success);
    assert_eq!(*connector.calls.lock(), vec!["connect_with_addrs"]);
}

#[tokio::test]
async fn concurrent_triggers_are_single_flight() {
    let _ = env_logger::try_init();
    let manager = manager();
    let connector = MockConnector::succeeding();
    *connector.delay.lock() = Some(Duration::from_millis(200));
    // Force the slow path through `connect`.
    manager.set_connector(connector.clone());
    manager.set_critical_peers(vec![PeerId::random()], vec![]);

    let m1 = manager.clone();
    let m2 = manager.clone();
    let (r1, r2) = tokio::join!(
        m1.trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ManualTrigger),
        m2.trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ManualTrigger),
    );

    let in_progress = [&r1, &r2]
        .iter()
        .filter(|r| r.error == Some(RecoveryError::InProgress))
        .count();
    let ran = [&r1, &r2].iter().filter(|r| r.success).count();
    assert_eq!(in_progress, 1, "exactly one trigger must be turned away");
    assert_eq!(ran, 1, "exactly one pipeline must run");
    assert_eq!(connector.calls.lock().len(), 1);
    assert!(!manager.is_recovering());
}

#[tokio::test]
async fn rebind_depends_on_the_reason() {
    let manager = manager();
    let rebinder = Arc::new(MockRebinder::default());
    rebinder.needed.store(true, Ordering::SeqCst);
    manager.set_rebinder(rebinder.clone());
    manager.set_connector(MockConnector::succeeding());

    // An error threshold alone must not touch the transport.
    let result = manager
        .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ErrorThreshold)
        .await;
    assert!(!result.rebind_performed);
    assert_eq!(rebinder.rebinds.load(Ordering::SeqCst), 0);

    let result = manager
        .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::NetworkUnreachable)
        .await;
    assert!(result.rebind_performed);
    assert_eq!(rebinder.rebinds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn discovery_results_are_counted() {
    let manager = manager();
    let discoverer = Arc::new(MockDiscoverer::default());
    manager.set_address_discoverer(discoverer.clone());
    manager.set_connector(MockConnector::succeeding());

    let result = manager
        .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::NetworkChange)
        .await;
    assert_eq!(result.addresses_discovered, 1);
    assert_eq!(discoverer.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabled_recovery_refuses_to_run() {
    let mut cfg = RecoveryConfig::default();
    cfg.enabled = false;
    let manager = RecoveryManager::new(cfg).unwrap();
    let connector = MockConnector::succeeding();
    manager.set_connector(connector.clone());

    let result = manager
        .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ManualTrigger)
        .await;
    assert!(!result.success);
    assert_eq!(result.error, Some(RecoveryError::Disabled));
    assert!(connector.calls.lock().is_empty());
}

#[tokio::test]
async fn run_is_bounded_by_the_timeout() {
    let _ = env_logger::try_init();
    let mut cfg = RecoveryConfig::default();
    cfg.recovery_timeout = Duration::from_millis(50);
    let manager = RecoveryManager::new(cfg).unwrap();
    let connector = MockConnector::succeeding();
    *connector.delay.lock() = Some(Duration::from_secs(10));
    connector.connections.store(0, Ordering::SeqCst);
    connector.with_addrs_ok.store(false, Ordering::SeqCst);
    manager.set_connector(connector.clone());
    manager.set_critical_peers(vec![PeerId::random()], vec![]);

    let started = std::time::Instant::now();
    let result = manager
        .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ManualTrigger)
        .await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.connections_restored, 0);
}

#[tokio::test]
async fn callbacks_run_isolated_from_each_other() {
    let _ = env_logger::try_init();
    let manager = manager();
    manager.set_connector(MockConnector::succeeding());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    manager.on_recovery_complete(|_result| panic!("callback gone wrong"));
    manager.on_recovery_complete(move |result| {
        let _ = tx.send(result.success);
    });

    let result = manager
        .trigger_recovery(ShutdownSignal::noop(), RecoveryReason::ManualTrigger)
        .await;
    assert!(result.success);

    // The panicking callback must not take the healthy one down with it.
    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(delivered);
}

#[test]
fn reason_mapping_is_total() {
    let cases = [
        (StateChangeReason::CriticalError, RecoveryReason::NetworkUnreachable),
        (StateChangeReason::AllConnectionsLost, RecoveryReason::AllConnectionsLost),
        (StateChangeReason::ErrorThreshold, RecoveryReason::ErrorThreshold),
        (StateChangeReason::NetworkChanged, RecoveryReason::NetworkChange),
        (StateChangeReason::ProbeFailed, RecoveryReason::NetworkUnreachable),
        (StateChangeReason::ManualTrigger, RecoveryReason::ManualTrigger),
        // Everything else defaults to Unknown.
        (StateChangeReason::ProbeDegraded, RecoveryReason::Unknown),
        (StateChangeReason::ProbeRecovered, RecoveryReason::Unknown),
        (StateChangeReason::PeerRecovered, RecoveryReason::Unknown),
        (StateChangeReason::RecoverySucceeded, RecoveryReason::Unknown),
        (StateChangeReason::RecoveryFailed, RecoveryReason::Unknown),
        (StateChangeReason::Reset, RecoveryReason::Unknown),
    ];
    for (from, to) in cases {
        assert_eq!(RecoveryReason::from(from), to, "{:?}", from);
    }
}

#[test]
fn rebind_applies_to_environmental_reasons_only() {
    assert!(RecoveryReason::NetworkUnreachable.needs_rebind());
    assert!(RecoveryReason::NetworkChange.needs_rebind());
    assert!(RecoveryReason::AllConnectionsLost.needs_rebind());
    assert!(!RecoveryReason::ErrorThreshold.needs_rebind());
    assert!(!RecoveryReason::ManualTrigger.needs_rebind());
    assert!(!RecoveryReason::Unknown.needs_rebind());
}
