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

//! The connection health monitor.
//!
//! Aggregates per-peer send errors, probe results and system events into a
//! four-state machine (`Healthy`, `Degraded`, `Down`, `Recovering`) and
//! broadcasts every transition to its subscribers.
//!
//! Transitions are debounced: a proposed change waits out
//! `state_change_debounce` and is cancelled by any newer proposal in that
//! window (last writer wins). Critical errors, manual triggers and recovery
//! outcomes bypass the debounce.

use crate::config::{ConfigError, HealthConfig};
use crate::counter::{CriticalError, ErrorCounter};
use crate::event::{ConnectionHealthChange, HealthState, StateChangeReason};
use crate::probe::{NetworkMonitor, NoopProber, Prober, SystemWatcher};
use futures::StreamExt;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use peerlink_core::{PeerId, Shutdown, ShutdownSignal};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

const LOG_TARGET: &str = "peerlink::health";

/// How long a broadcast waits for a slow subscriber before dropping the
/// event for it.
const BROADCAST_RETRY: Duration = Duration::from_millis(100);

/// Identifies a subscription for [`HealthMonitor::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The receiving end of a health subscription.
pub struct HealthSubscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<ConnectionHealthChange>,
}

impl HealthSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The next health change; `None` once the monitor stopped or the
    /// subscription was removed.
    pub async fn recv(&mut self) -> Option<ConnectionHealthChange> {
        self.rx.recv().await
    }
}

/// Point-in-time view of the monitor, for diagnostics.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub failing_peers: Vec<PeerId>,
    pub healthy_peers: Vec<PeerId>,
    pub recovery_attempts: u32,
    pub last_change: Option<ConnectionHealthChange>,
    pub last_critical: Option<CriticalError>,
}

struct MonitorState {
    current: HealthState,
    recovery_attempts: u32,
    last_change: Option<ConnectionHealthChange>,
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<ConnectionHealthChange>,
}

struct PendingChange {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Running {
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

struct Proposal {
    target: HealthState,
    reason: StateChangeReason,
    trigger_peer: Option<PeerId>,
    trigger_error: Option<String>,
}

/// See the module documentation.
pub struct HealthMonitor {
    config: HealthConfig,
    counter: ErrorCounter,
    state: Mutex<MonitorState>,
    // A handful of subscribers in the common case.
    subscribers: Mutex<SmallVec<[Subscriber; 4]>>,
    next_subscriber_id: AtomicU64,
    next_generation: AtomicU64,
    pending: Mutex<Option<PendingChange>>,
    /// Serializes state mutation and broadcast so every subscriber sees
    /// changes in timestamp order. This is the one lock in the crate that
    /// is held across an await; the broadcast underneath is bounded by
    /// [`BROADCAST_RETRY`].
    transition_lock: tokio::sync::Mutex<()>,
    runtime: Mutex<Option<Running>>,
    /// Back-reference for the tasks the monitor spawns.
    self_ref: Mutex<Weak<HealthMonitor>>,
    prober: Mutex<Option<Arc<dyn Prober>>>,
    watcher: Mutex<Option<Arc<dyn SystemWatcher>>>,
    network_monitor: Mutex<Option<Arc<dyn NetworkMonitor>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Result<Arc<HealthMonitor>, ConfigError> {
        config.validate()?;
        let counter = ErrorCounter::new(&config);
        let monitor = Arc::new(HealthMonitor {
            config,
            counter,
            state: Mutex::new(MonitorState {
                current: HealthState::Healthy,
                recovery_attempts: 0,
                last_change: None,
            }),
            subscribers: Mutex::new(SmallVec::new()),
            next_subscriber_id: AtomicU64::new(0),
            next_generation: AtomicU64::new(0),
            pending: Mutex::new(None),
            transition_lock: tokio::sync::Mutex::new(()),
            runtime: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
            prober: Mutex::new(None),
            watcher: Mutex::new(None),
            network_monitor: Mutex::new(None),
        });
        *monitor.self_ref.lock() = Arc::downgrade(&monitor);
        Ok(monitor)
    }

    /// The error counter backing this monitor.
    pub fn counter(&self) -> &ErrorCounter {
        &self.counter
    }

    pub fn state(&self) -> HealthState {
        self.state.lock().current
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock();
        HealthSnapshot {
            state: state.current,
            failing_peers: self.counter.failing_peers(),
            healthy_peers: self.counter.healthy_peers(),
            recovery_attempts: state.recovery_attempts,
            last_change: state.last_change.clone(),
            last_critical: self.counter.last_critical(),
        }
    }

    /// Attaches the prober. Must be called before [`start`](Self::start).
    pub fn set_prober(&self, prober: Arc<dyn Prober>) {
        if self.runtime.lock().is_some() {
            warn!(target: LOG_TARGET, "set_prober called after start; ignored");
            return;
        }
        *self.prober.lock() = Some(prober);
    }

    /// Attaches the system watcher. Must be called before `start`.
    pub fn set_system_watcher(&self, watcher: Arc<dyn SystemWatcher>) {
        if self.runtime.lock().is_some() {
            warn!(target: LOG_TARGET, "set_system_watcher called after start; ignored");
            return;
        }
        *self.watcher.lock() = Some(watcher);
    }

    /// Attaches the network monitor. Must be called before `start`.
    pub fn set_network_monitor(&self, monitor: Arc<dyn NetworkMonitor>) {
        if self.runtime.lock().is_some() {
            warn!(target: LOG_TARGET, "set_network_monitor called after start; ignored");
            return;
        }
        *self.network_monitor.lock() = Some(monitor);
    }

    /// Starts the intake loops. Idempotent.
    pub fn start(&self) {
        let this = self.self_ref.lock().clone();
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            debug!(target: LOG_TARGET, "monitor already started");
            return;
        }
        let shutdown = Shutdown::new();
        let mut tasks = Vec::new();

        let prober = self
            .prober
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProber) as Arc<dyn Prober>);
        tasks.push(tokio::spawn(probe_loop(
            this.clone(),
            prober,
            self.config.probe_interval,
            shutdown.signal(),
        )));

        if let Some(watcher) = self.watcher.lock().clone() {
            tasks.push(tokio::spawn(watcher_loop(
                this.clone(),
                watcher,
                shutdown.signal(),
            )));
        }
        if let Some(netmon) = self.network_monitor.lock().clone() {
            tasks.push(tokio::spawn(network_monitor_loop(
                this,
                netmon,
                shutdown.signal(),
            )));
        }

        *runtime = Some(Running { shutdown, tasks });
        info!(target: LOG_TARGET, "health monitor started");
    }

    /// Stops the intake loops, joins them, and closes every subscriber
    /// channel exactly once. A `stop` without a preceding `start` is a
    /// no-op.
    pub async fn stop(&self) {
        let running = self.runtime.lock().take();
        let running = match running {
            Some(r) => r,
            None => return,
        };
        running.shutdown.trigger();
        for task in running.tasks {
            let _ = task.await;
        }
        if let Some(pending) = self.pending.lock().take() {
            pending.handle.abort();
        }
        // Dropping the senders closes every subscription.
        self.subscribers.lock().clear();
        info!(target: LOG_TARGET, "health monitor stopped");
    }

    /// Registers a subscriber for health changes.
    pub fn subscribe(&self) -> HealthSubscription {
        let id = SubscriptionId(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.event_channel_capacity);
        self.subscribers.lock().push(Subscriber { id, tx });
        HealthSubscription { id, rx }
    }

    /// Removes a subscriber. Unknown (or already removed) ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock();
        if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
            subscribers.swap_remove(pos);
        }
    }

    /// Records a failed send to `peer`.
    pub async fn on_send_error(&self, peer: &PeerId, error: impl fmt::Display) {
        let message = error.to_string();
        let observation = self.counter.record_error(peer, &message);
        trace!(
            target: LOG_TARGET,
            "send error for {}: {} (threshold: {}, critical: {})",
            peer.short_str(),
            message,
            observation.reached_threshold,
            observation.is_critical
        );

        if observation.is_critical {
            self.propose(
                Proposal {
                    target: HealthState::Down,
                    reason: StateChangeReason::CriticalError,
                    trigger_peer: Some(peer.clone()),
                    trigger_error: Some(message),
                },
                true,
            )
            .await;
        } else if observation.reached_threshold {
            self.evaluate_transition(peer, &message).await;
        }
    }

    /// Records a successful send to `peer`.
    pub async fn on_send_success(&self, peer: &PeerId) {
        self.counter.record_success(peer);
        // Proposing `Healthy` also cancels a pending degradation that this
        // success has just invalidated.
        if self.counter.failing_peers().is_empty() {
            self.propose(
                Proposal {
                    target: HealthState::Healthy,
                    reason: StateChangeReason::PeerRecovered,
                    trigger_peer: Some(peer.clone()),
                    trigger_error: None,
                },
                false,
            )
            .await;
        }
    }

    /// Forces the `Recovering` state, bypassing debounce. Used by the
    /// bridge and by operators.
    pub async fn trigger_recovery_state(&self, reason: StateChangeReason) {
        self.propose(
            Proposal {
                target: HealthState::Recovering,
                reason,
                trigger_peer: None,
                trigger_error: None,
            },
            true,
        )
        .await;
    }

    /// Reports a successful recovery: resets the attempt counter and
    /// returns to `Healthy` immediately.
    pub async fn notify_recovery_success(&self) {
        self.state.lock().recovery_attempts = 0;
        self.propose(
            Proposal {
                target: HealthState::Healthy,
                reason: StateChangeReason::RecoverySucceeded,
                trigger_peer: None,
                trigger_error: None,
            },
            true,
        )
        .await;
    }

    /// Reports a failed recovery. The monitor drops to `Down` immediately;
    /// once `max_recovery_attempts` is exceeded it stays there until a
    /// success resets the counter.
    pub async fn notify_recovery_failed(&self, error: impl fmt::Display) {
        let attempts = {
            let mut state = self.state.lock();
            state.recovery_attempts += 1;
            state.recovery_attempts
        };
        if attempts >= self.config.max_recovery_attempts {
            warn!(
                target: LOG_TARGET,
                "recovery failed {} times (limit {})",
                attempts,
                self.config.max_recovery_attempts
            );
        }
        self.propose(
            Proposal {
                target: HealthState::Down,
                reason: StateChangeReason::RecoveryFailed,
                trigger_peer: None,
                trigger_error: Some(error.to_string()),
            },
            true,
        )
        .await;
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.state.lock().recovery_attempts
    }

    /// Whether recovery has failed `max_recovery_attempts` times in a row.
    pub fn recovery_attempts_exhausted(&self) -> bool {
        self.state.lock().recovery_attempts >= self.config.max_recovery_attempts
    }

    /// Clears all counter state and returns to `Healthy`.
    pub async fn reset(&self) {
        self.counter.reset();
        self.state.lock().recovery_attempts = 0;
        self.propose(
            Proposal {
                target: HealthState::Healthy,
                reason: StateChangeReason::Reset,
                trigger_peer: None,
                trigger_error: None,
            },
            false,
        )
        .await;
    }

    async fn evaluate_transition(&self, peer: &PeerId, message: &str) {
        let failing = self.counter.failing_peers();
        let healthy = self.counter.healthy_peers();
        let known = self.counter.known_peers();

        if !failing.is_empty() && failing.len() == known {
            self.propose(
                Proposal {
                    target: HealthState::Down,
                    reason: StateChangeReason::AllConnectionsLost,
                    trigger_peer: Some(peer.clone()),
                    trigger_error: Some(message.to_string()),
                },
                false,
            )
            .await;
        } else if !failing.is_empty() && !healthy.is_empty() {
            self.propose(
                Proposal {
                    target: HealthState::Degraded,
                    reason: StateChangeReason::ErrorThreshold,
                    trigger_peer: Some(peer.clone()),
                    trigger_error: Some(message.to_string()),
                },
                false,
            )
            .await;
        }
    }

    async fn handle_probe_result(&self, result: crate::probe::ProbeResult) {
        if result.is_down() {
            self.propose(
                Proposal {
                    target: HealthState::Down,
                    reason: StateChangeReason::ProbeFailed,
                    trigger_peer: None,
                    trigger_error: result.error,
                },
                false,
            )
            .await;
        } else if result.is_degraded() {
            self.propose(
                Proposal {
                    target: HealthState::Degraded,
                    reason: StateChangeReason::ProbeDegraded,
                    trigger_peer: None,
                    trigger_error: None,
                },
                false,
            )
            .await;
        } else if result.is_healthy() && self.state() != HealthState::Healthy {
            self.propose(
                Proposal {
                    target: HealthState::Healthy,
                    reason: StateChangeReason::ProbeRecovered,
                    trigger_peer: None,
                    trigger_error: None,
                },
                false,
            )
            .await;
        }
    }

    /// A major interface/gateway/address change degrades a healthy node
    /// and downs an already degraded one.
    async fn handle_major_network_change(&self) {
        let target = match self.state() {
            HealthState::Healthy => HealthState::Degraded,
            HealthState::Degraded => HealthState::Down,
            _ => return,
        };
        self.propose(
            Proposal {
                target,
                reason: StateChangeReason::NetworkChanged,
                trigger_peer: None,
                trigger_error: None,
            },
            false,
        )
        .await;
    }

    /// Schedules a transition. Any pending debounced transition is
    /// replaced (last writer wins); `urgent` proposals apply immediately.
    async fn propose(&self, proposal: Proposal, urgent: bool) {
        if let Some(pending) = self.pending.lock().take() {
            pending.handle.abort();
        }
        if self.state.lock().current == proposal.target {
            return;
        }
        if urgent {
            self.apply(proposal).await;
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let debounce = self.config.state_change_debounce;
        let this = self.self_ref.lock().clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let monitor = match this.upgrade() {
                Some(m) => m,
                None => return,
            };
            // Apply only when this is still the newest proposal. Removing
            // our own entry first means a later abort cannot land once the
            // transition started.
            let is_current = {
                let mut pending = monitor.pending.lock();
                match &*pending {
                    Some(p) if p.generation == generation => {
                        *pending = None;
                        true
                    }
                    _ => false,
                }
            };
            if is_current {
                monitor.apply(proposal).await;
            }
        });
        *self.pending.lock() = Some(PendingChange { generation, handle });
    }

    async fn apply(&self, proposal: Proposal) {
        let _ordering = self.transition_lock.lock().await;
        let change = {
            let mut state = self.state.lock();
            if state.current == proposal.target {
                return;
            }
            let change = ConnectionHealthChange {
                previous: state.current,
                current: proposal.target,
                reason: proposal.reason,
                timestamp: SystemTime::now(),
                trigger_peer: proposal.trigger_peer,
                trigger_error: proposal.trigger_error,
            };
            state.current = proposal.target;
            state.last_change = Some(change.clone());
            change
        };
        info!(
            target: LOG_TARGET,
            "health: {} -> {} ({})",
            change.previous,
            change.current,
            change.reason
        );
        self.broadcast(change).await;
    }

    /// Delivers a change to every subscriber without ever blocking the
    /// state machine: try-send first, then a bounded wait, then drop the
    /// event for that subscriber.
    async fn broadcast(&self, change: ConnectionHealthChange) {
        let targets: Vec<(SubscriptionId, mpsc::Sender<ConnectionHealthChange>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|s| (s.id, s.tx.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(change.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    match tokio::time::timeout(BROADCAST_RETRY, tx.send(event)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => dead.push(id),
                        Err(_) => warn!(
                            target: LOG_TARGET,
                            "subscriber {:?} is too slow, dropping health change", id
                        ),
                    }
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.lock();
            for id in dead {
                if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
                    subscribers.swap_remove(pos);
                }
            }
        }
    }
}

async fn probe_loop(
    monitor: Weak<HealthMonitor>,
    prober: Arc<dyn Prober>,
    interval: Duration,
    mut signal: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = signal.wait() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let result = prober.probe(signal.clone()).await;
        match monitor.upgrade() {
            Some(monitor) => monitor.handle_probe_result(result).await,
            None => return,
        }
    }
}

async fn watcher_loop(
    monitor: Weak<HealthMonitor>,
    watcher: Arc<dyn SystemWatcher>,
    mut signal: ShutdownSignal,
) {
    let mut events = watcher.events();
    loop {
        let event = tokio::select! {
            _ = signal.wait() => return,
            ev = events.next() => match ev {
                Some(ev) => ev,
                None => return,
            },
        };
        if event.kind.is_major() {
            debug!(
                target: LOG_TARGET,
                "major system event: {:?} on {:?}", event.kind, event.interface
            );
            match monitor.upgrade() {
                Some(monitor) => monitor.handle_major_network_change().await,
                None => return,
            }
        }
    }
}

async fn network_monitor_loop(
    monitor: Weak<HealthMonitor>,
    source: Arc<dyn NetworkMonitor>,
    mut signal: ShutdownSignal,
) {
    let mut events = source.subscribe();
    loop {
        let event = tokio::select! {
            _ = signal.wait() => return,
            ev = events.next() => match ev {
                Some(ev) => ev,
                None => return,
            },
        };
        if event.kind == crate::probe::NetworkChangeKind::Major {
            debug!(
                target: LOG_TARGET,
                "major address change: {} -> {} addresses",
                event.old_addrs.len(),
                event.new_addrs.len()
            );
            match monitor.upgrade() {
                Some(monitor) => monitor.handle_major_network_change().await,
                None => return,
            }
        }
    }
}
