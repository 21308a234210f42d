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

//! Health monitor behavior: thresholds, debouncing, critical errors and
//! subscriber management.

use peerlink_connectivity::{
    HealthConfig, HealthMonitor, HealthState, StateChangeReason,
};
use peerlink_core::PeerId;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn quick_config() -> HealthConfig {
    let mut cfg = HealthConfig::default();
    cfg.error_threshold = 2;
    cfg.state_change_debounce = Duration::from_millis(10);
    cfg
}

fn monitor() -> Arc<HealthMonitor> {
    HealthMonitor::new(quick_config()).unwrap()
}

#[tokio::test]
async fn starts_healthy() {
    let monitor = monitor();
    assert_eq!(monitor.state(), HealthState::Healthy);
}

#[tokio::test]
async fn threshold_on_sole_peer_means_all_connections_lost() {
    let monitor = monitor();
    let mut sub = monitor.subscribe();
    let peer = PeerId::random();

    monitor.on_send_error(&peer, "connection timed out").await;
    monitor.on_send_error(&peer, "connection timed out").await;

    let change = tokio::time::timeout(Duration::from_millis(100), sub.recv())
        .await
        .expect("transition within 100ms")
        .expect("subscription open");
    assert_eq!(change.previous, HealthState::Healthy);
    assert_eq!(change.current, HealthState::Down);
    assert_eq!(change.reason, StateChangeReason::AllConnectionsLost);
    assert_eq!(change.trigger_peer.as_ref(), Some(&peer));

    // Exactly one transition: nothing else arrives.
    let extra = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
    assert!(extra.is_err(), "expected exactly one transition");
}

#[tokio::test]
async fn mixed_peers_degrade_instead_of_down() {
    let monitor = monitor();
    let mut sub = monitor.subscribe();
    let bad = PeerId::random();
    let good = PeerId::random();

    monitor.on_send_success(&good).await;
    monitor.on_send_error(&bad, "connection timed out").await;
    monitor.on_send_error(&bad, "connection timed out").await;

    let change = tokio::time::timeout(Duration::from_millis(100), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.current, HealthState::Degraded);
    assert_eq!(change.reason, StateChangeReason::ErrorThreshold);
}

#[tokio::test]
async fn critical_error_bypasses_debounce() {
    let mut cfg = HealthConfig::default();
    // A long debounce that a critical transition must not wait for.
    cfg.state_change_debounce = Duration::from_secs(5);
    let monitor = HealthMonitor::new(cfg).unwrap();
    let peer = PeerId::random();

    let started = Instant::now();
    monitor
        .on_send_error(&peer, "dial: network is unreachable")
        .await;
    assert_eq!(monitor.state(), HealthState::Down);
    assert!(started.elapsed() < Duration::from_secs(1));

    let snapshot = monitor.snapshot();
    assert_eq!(
        snapshot.last_change.unwrap().reason,
        StateChangeReason::CriticalError
    );
    assert!(snapshot.last_critical.is_some());
}

#[tokio::test]
async fn debounce_is_last_writer_wins() {
    let monitor = HealthMonitor::new({
        let mut cfg = quick_config();
        cfg.state_change_debounce = Duration::from_millis(100);
        cfg
    })
    .unwrap();
    let mut sub = monitor.subscribe();
    let bad = PeerId::random();
    let good = PeerId::random();

    monitor.on_send_success(&good).await;
    // Proposes Degraded (debounced)...
    monitor.on_send_error(&bad, "timed out").await;
    monitor.on_send_error(&bad, "timed out").await;
    // ...which a success overrides before the debounce elapses.
    monitor.on_send_success(&bad).await;

    let outcome = tokio::time::timeout(Duration::from_millis(300), sub.recv()).await;
    // The pending Degraded was cancelled; since the monitor was already
    // Healthy, no transition is broadcast at all.
    assert!(outcome.is_err(), "cancelled transition must not broadcast");
    assert_eq!(monitor.state(), HealthState::Healthy);
}

#[tokio::test]
async fn success_brings_monitor_back_to_healthy() {
    let monitor = monitor();
    let peer = PeerId::random();

    monitor.on_send_error(&peer, "timed out").await;
    monitor.on_send_error(&peer, "timed out").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.state(), HealthState::Down);

    monitor.on_send_success(&peer).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.state(), HealthState::Healthy);
}

#[tokio::test]
async fn recovery_notifications_bypass_debounce() {
    let mut cfg = quick_config();
    cfg.state_change_debounce = Duration::from_secs(5);
    cfg.max_recovery_attempts = 2;
    let monitor = HealthMonitor::new(cfg).unwrap();

    monitor
        .trigger_recovery_state(StateChangeReason::ManualTrigger)
        .await;
    assert_eq!(monitor.state(), HealthState::Recovering);

    monitor.notify_recovery_failed("still down").await;
    assert_eq!(monitor.state(), HealthState::Down);
    assert_eq!(monitor.recovery_attempts(), 1);
    assert!(!monitor.recovery_attempts_exhausted());

    monitor
        .trigger_recovery_state(StateChangeReason::ManualTrigger)
        .await;
    monitor.notify_recovery_failed("still down").await;
    assert!(monitor.recovery_attempts_exhausted());

    monitor
        .trigger_recovery_state(StateChangeReason::ManualTrigger)
        .await;
    monitor.notify_recovery_success().await;
    assert_eq!(monitor.state(), HealthState::Healthy);
    assert_eq!(monitor.recovery_attempts(), 0);
}

#[tokio::test]
async fn unsubscribe_is_safe_and_precise() {
    let monitor = monitor();
    let sub_a = monitor.subscribe();
    let mut sub_b = monitor.subscribe();

    let id_a = sub_a.id();
    monitor.unsubscribe(id_a);
    // Double unsubscribe and unknown handles are no-ops.
    monitor.unsubscribe(id_a);

    let peer = PeerId::random();
    monitor.on_send_error(&peer, "network is unreachable").await;

    // The untouched subscriber still receives the change.
    let change = tokio::time::timeout(Duration::from_millis(100), sub_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.current, HealthState::Down);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let monitor = monitor();
    // Stop before start is a no-op.
    monitor.stop().await;

    monitor.start();
    monitor.start();

    let mut sub = monitor.subscribe();
    monitor.stop().await;
    // Stop closes every subscriber channel.
    assert!(sub.recv().await.is_none());
    monitor.stop().await;
}

#[tokio::test]
async fn reset_returns_to_healthy_and_clears_counter() {
    let monitor = monitor();
    let peer = PeerId::random();
    monitor.on_send_error(&peer, "network is unreachable").await;
    assert_eq!(monitor.state(), HealthState::Down);
    assert_eq!(monitor.counter().peer_error_count(&peer), 1);

    monitor.reset().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.state(), HealthState::Healthy);
    assert_eq!(monitor.counter().known_peers(), 0);
}

#[tokio::test]
async fn slow_subscriber_does_not_block_the_machine() {
    let mut cfg = quick_config();
    cfg.event_channel_capacity = 10;
    let monitor = HealthMonitor::new(cfg).unwrap();
    // A subscriber that never reads.
    let _lazy = monitor.subscribe();
    let peer = PeerId::random();

    // Drive many transitions; each fits the buffer or is dropped after
    // the bounded retry. The monitor itself must keep moving.
    let started = Instant::now();
    for _ in 0..8 {
        monitor.on_send_error(&peer, "network is unreachable").await;
        monitor.on_send_success(&peer).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(started.elapsed() < Duration::from_secs(10));
}
