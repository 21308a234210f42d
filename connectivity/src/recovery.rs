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

//! The recovery manager: a bounded, single-flight workflow that tries to
//! bring connectivity back after the monitor reports it gone.
//!
//! One recovery run rebinds the transport (when the trigger reason calls
//! for it), rediscovers addresses, and reconnects the configured critical
//! peers, each step bounded by the run's deadline and none of the first two
//! fatal on failure. Concurrent triggers collapse into one run; the others
//! observe [`RecoveryError::InProgress`].

use crate::config::{ConfigError, RecoveryConfig};
use crate::event::StateChangeReason;
use async_trait::async_trait;
use log::{debug, info, warn};
use multiaddr::Multiaddr;
use parking_lot::{Mutex, RwLock};
use peerlink_core::{BoxError, PeerId, Shutdown, ShutdownSignal};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const LOG_TARGET: &str = "peerlink::recovery";

/// Re-opens the local transport endpoint after a network disruption.
#[async_trait]
pub trait Rebinder: Send + Sync {
    /// Whether the transport actually needs a rebind right now.
    fn is_rebind_needed(&self) -> bool;

    async fn rebind(&self, signal: ShutdownSignal) -> Result<(), BoxError>;
}

/// Rediscovers the node's own addresses (STUN, interface scan, ...).
#[async_trait]
pub trait AddressDiscoverer: Send + Sync {
    async fn discover(&self, signal: ShutdownSignal) -> Result<Vec<Multiaddr>, BoxError>;
}

/// Re-establishes connections to peers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, signal: ShutdownSignal, peer: &PeerId) -> Result<(), BoxError>;

    async fn connect_with_addrs(
        &self,
        signal: ShutdownSignal,
        peer: &PeerId,
        addrs: &[Multiaddr],
    ) -> Result<(), BoxError>;

    /// Number of currently established connections.
    fn connection_count(&self) -> usize;
}

/// Why recovery was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryReason {
    NetworkUnreachable,
    AllConnectionsLost,
    ErrorThreshold,
    NetworkChange,
    ManualTrigger,
    Unknown,
}

impl RecoveryReason {
    /// Whether this reason warrants rebinding the transport. A mere error
    /// threshold does not: the socket is likely fine, the peers are not.
    pub fn needs_rebind(&self) -> bool {
        matches!(
            self,
            RecoveryReason::NetworkUnreachable
                | RecoveryReason::NetworkChange
                | RecoveryReason::AllConnectionsLost
        )
    }
}

/// Total mapping from monitor reasons to recovery reasons; the bridge
/// relies on every monitor reason having an image here.
impl From<StateChangeReason> for RecoveryReason {
    fn from(reason: StateChangeReason) -> RecoveryReason {
        match reason {
            StateChangeReason::CriticalError => RecoveryReason::NetworkUnreachable,
            StateChangeReason::AllConnectionsLost => RecoveryReason::AllConnectionsLost,
            StateChangeReason::ErrorThreshold => RecoveryReason::ErrorThreshold,
            StateChangeReason::NetworkChanged => RecoveryReason::NetworkChange,
            StateChangeReason::ProbeFailed => RecoveryReason::NetworkUnreachable,
            StateChangeReason::ManualTrigger => RecoveryReason::ManualTrigger,
            _ => RecoveryReason::Unknown,
        }
    }
}

/// Failure modes of a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecoveryError {
    /// Another run is already in flight. Advisory rather than fatal.
    #[error("recovery already in progress")]
    InProgress,

    /// The run finished without restoring connectivity.
    #[error("recovery failed")]
    Failed,

    /// Recovery is disabled by configuration.
    #[error("recovery is disabled")]
    Disabled,
}

/// Outcome of one recovery run.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub success: bool,
    pub reason: RecoveryReason,
    /// The attempt number of this run (1-based since the last success).
    pub attempts: u32,
    pub duration: Duration,
    pub rebind_performed: bool,
    pub addresses_discovered: usize,
    pub connections_restored: usize,
    pub error: Option<RecoveryError>,
}

type RecoveryCallback = Arc<dyn Fn(RecoveryResult) + Send + Sync>;

struct RecoveryState {
    current_attempt: u32,
    last_recovery_at: Option<Instant>,
}

/// See the module documentation.
pub struct RecoveryManager {
    config: RecoveryConfig,
    recovering: AtomicBool,
    state: Mutex<RecoveryState>,
    rebinder: RwLock<Option<Arc<dyn Rebinder>>>,
    discoverer: RwLock<Option<Arc<dyn AddressDiscoverer>>>,
    connector: RwLock<Option<Arc<dyn Connector>>>,
    critical_peers: RwLock<Vec<PeerId>>,
    /// Addresses parallel to `critical_peers`; an entry with no components
    /// (or no entry at all) means "none known".
    critical_peer_addrs: RwLock<Vec<Multiaddr>>,
    callbacks: Mutex<Vec<RecoveryCallback>>,
    lifecycle: Mutex<Option<Shutdown>>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Result<Arc<RecoveryManager>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(RecoveryManager {
            config,
            recovering: AtomicBool::new(false),
            state: Mutex::new(RecoveryState {
                current_attempt: 0,
                last_recovery_at: None,
            }),
            rebinder: RwLock::new(None),
            discoverer: RwLock::new(None),
            connector: RwLock::new(None),
            critical_peers: RwLock::new(Vec::new()),
            critical_peer_addrs: RwLock::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(None),
        }))
    }

    // Collaborators are late-bindable: wiring happens after construction,
    // in any order.

    pub fn set_rebinder(&self, rebinder: Arc<dyn Rebinder>) {
        *self.rebinder.write() = Some(rebinder);
    }

    pub fn set_address_discoverer(&self, discoverer: Arc<dyn AddressDiscoverer>) {
        *self.discoverer.write() = Some(discoverer);
    }

    pub fn set_connector(&self, connector: Arc<dyn Connector>) {
        *self.connector.write() = Some(connector);
    }

    /// Sets the peers that recovery reconnects, with optional known
    /// addresses at matching indices.
    pub fn set_critical_peers(&self, peers: Vec<PeerId>, addrs: Vec<Multiaddr>) {
        *self.critical_peers.write() = peers;
        *self.critical_peer_addrs.write() = addrs;
    }

    /// Registers a completion callback. Every callback runs on its own
    /// task, so a panicking callback affects neither the manager nor the
    /// other callbacks.
    pub fn on_recovery_complete<F>(&self, callback: F)
    where
        F: Fn(RecoveryResult) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    pub fn attempt_count(&self) -> u32 {
        self.state.lock().current_attempt
    }

    pub fn reset_attempts(&self) {
        self.state.lock().current_attempt = 0;
    }

    pub fn last_recovery_at(&self) -> Option<Instant> {
        self.state.lock().last_recovery_at
    }

    /// Starts the manager. Idempotent.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_none() {
            *lifecycle = Some(Shutdown::new());
            info!(target: LOG_TARGET, "recovery manager started");
        }
    }

    /// Stops the manager, aborting an in-flight run. A `stop` without a
    /// preceding `start` is a no-op.
    pub fn stop(&self) {
        if let Some(shutdown) = self.lifecycle.lock().take() {
            shutdown.trigger();
            info!(target: LOG_TARGET, "recovery manager stopped");
        }
    }

    /// Runs the recovery pipeline.
    ///
    /// Single-flight: when a run is already in progress, returns
    /// immediately with `success = false` and
    /// [`RecoveryError::InProgress`], without side effects.
    pub async fn trigger_recovery(
        &self,
        signal: ShutdownSignal,
        reason: RecoveryReason,
    ) -> RecoveryResult {
        if !self.config.enabled {
            return self.aborted_result(reason, RecoveryError::Disabled);
        }
        if self.recovering.swap(true, Ordering::SeqCst) {
            debug!(target: LOG_TARGET, "recovery already in progress");
            return self.aborted_result(reason, RecoveryError::InProgress);
        }

        let started = Instant::now();
        let attempt = {
            let mut state = self.state.lock();
            state.current_attempt += 1;
            state.current_attempt
        };
        info!(
            target: LOG_TARGET,
            "recovery attempt {} triggered ({:?})", attempt, reason
        );

        let lifecycle_signal = self
            .lifecycle
            .lock()
            .as_ref()
            .map(|s| s.signal())
            .unwrap_or_else(ShutdownSignal::noop);
        let deadline = started + self.config.recovery_timeout;
        let result = self
            .run_pipeline(signal, lifecycle_signal, reason, attempt, started, deadline)
            .await;
        self.recovering.store(false, Ordering::SeqCst);

        info!(
            target: LOG_TARGET,
            "recovery attempt {} finished: success={} restored={} in {:?}",
            attempt,
            result.success,
            result.connections_restored,
            result.duration
        );

        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            let outcome = result.clone();
            tokio::spawn(async move { callback(outcome) });
        }

        result
    }

    fn aborted_result(&self, reason: RecoveryReason, error: RecoveryError) -> RecoveryResult {
        RecoveryResult {
            success: false,
            reason,
            attempts: self.attempt_count(),
            duration: Duration::from_secs(0),
            rebind_performed: false,
            addresses_discovered: 0,
            connections_restored: 0,
            error: Some(error),
        }
    }

    async fn run_pipeline(
        &self,
        mut signal: ShutdownSignal,
        mut lifecycle: ShutdownSignal,
        reason: RecoveryReason,
        attempt: u32,
        started: Instant,
        deadline: Instant,
    ) -> RecoveryResult {
        let mut rebind_performed = false;
        let mut addresses_discovered = 0;
        let mut connections_restored = 0;

        // Step 1: rebind the transport. Failure is logged, not fatal.
        if reason.needs_rebind() && self.config.rebind_on_critical_error {
            let rebinder_opt = self.rebinder.read().clone();
            if let Some(rebinder) = rebinder_opt {
                if rebinder.is_rebind_needed() {
                    let rebind = rebinder.rebind(signal.clone());
                    match bounded(&mut signal, &mut lifecycle, deadline, rebind).await {
                        Some(Ok(())) => {
                            rebind_performed = true;
                            debug!(target: LOG_TARGET, "transport rebind done");
                        }
                        Some(Err(e)) => {
                            warn!(target: LOG_TARGET, "transport rebind failed: {}", e)
                        }
                        None => warn!(target: LOG_TARGET, "transport rebind cut short"),
                    }
                }
            }
        }

        // Step 2: rediscover addresses. Failure is logged, not fatal.
        if self.config.rediscover_addresses {
            let discoverer_opt = self.discoverer.read().clone();
            if let Some(discoverer) = discoverer_opt {
                let discover = discoverer.discover(signal.clone());
                match bounded(&mut signal, &mut lifecycle, deadline, discover).await {
                    Some(Ok(addrs)) => {
                        addresses_discovered = addrs.len();
                        debug!(
                            target: LOG_TARGET,
                            "discovered {} addresses", addresses_discovered
                        );
                    }
                    Some(Err(e)) => {
                        warn!(target: LOG_TARGET, "address discovery failed: {}", e)
                    }
                    None => warn!(target: LOG_TARGET, "address discovery cut short"),
                }
            }
        }

        // Step 3: reconnect critical peers, preferring a known address and
        // falling back to discovery-based dialing.
        let connector = self.connector.read().clone();
        if let Some(connector) = &connector {
            let peers = self.critical_peers.read().clone();
            let addrs = self.critical_peer_addrs.read().clone();
            for (i, peer) in peers.iter().enumerate() {
                if signal.is_triggered()
                    || lifecycle.is_triggered()
                    || Instant::now() >= deadline
                {
                    debug!(
                        target: LOG_TARGET,
                        "reconnect loop cut short after {} peers", i
                    );
                    break;
                }
                let known_addr = addrs.get(i).filter(|a| a.iter().next().is_some());
                let connected = match known_addr {
                    Some(addr) => {
                        let direct = connector.connect_with_addrs(
                            signal.clone(),
                            peer,
                            std::slice::from_ref(addr),
                        );
                        match bounded(&mut signal, &mut lifecycle, deadline, direct).await {
                            Some(Ok(())) => true,
                            _ => {
                                debug!(
                                    target: LOG_TARGET,
                                    "direct reconnect to {} failed, falling back to dial",
                                    peer.short_str()
                                );
                                self.dial(&mut signal, &mut lifecycle, deadline, connector, peer)
                                    .await
                            }
                        }
                    }
                    None => {
                        self.dial(&mut signal, &mut lifecycle, deadline, connector, peer)
                            .await
                    }
                };
                if connected {
                    connections_restored += 1;
                    debug!(target: LOG_TARGET, "reconnected {}", peer.short_str());
                }
            }
        }

        let success = connector
            .map(|c| c.connection_count() > 0)
            .unwrap_or(false);
        if success {
            let mut state = self.state.lock();
            state.current_attempt = 0;
            state.last_recovery_at = Some(Instant::now());
        }

        RecoveryResult {
            success,
            reason,
            attempts: attempt,
            duration: started.elapsed(),
            rebind_performed,
            addresses_discovered,
            connections_restored,
            error: if success { None } else { Some(RecoveryError::Failed) },
        }
    }

    async fn dial(
        &self,
        signal: &mut ShutdownSignal,
        lifecycle: &mut ShutdownSignal,
        deadline: Instant,
        connector: &Arc<dyn Connector>,
        peer: &PeerId,
    ) -> bool {
        let connect = connector.connect(signal.clone(), peer);
        matches!(
            bounded(signal, lifecycle, deadline, connect).await,
            Some(Ok(()))
        )
    }
}

/// Runs `fut` bounded by the caller's signal, the manager lifecycle and
/// the run deadline. `None` means the future was cut short.
async fn bounded<F, T>(
    signal: &mut ShutdownSignal,
    lifecycle: &mut ShutdownSignal,
    deadline: Instant,
    fut: F,
) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        _ = signal.wait() => None,
        _ = lifecycle.wait() => None,
        res = tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut) => res.ok(),
    }
}
