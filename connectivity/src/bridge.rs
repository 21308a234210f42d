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

//! The bridge between the health monitor and the recovery manager.
//!
//! The monitor and the manager do not know each other; the bridge
//! subscribes to health transitions, drives the manager whenever the
//! monitor goes `Down`, and reports the outcome back. Neither side owns
//! the other: the bridge is one listener task plus explicit method calls
//! in both directions.

use crate::event::{HealthState, StateChangeReason};
use crate::monitor::HealthMonitor;
use crate::recovery::{RecoveryError, RecoveryManager, RecoveryReason};
use log::{debug, info, warn};
use parking_lot::Mutex;
use peerlink_core::{Shutdown, ShutdownSignal};
use std::sync::Arc;
use tokio::task::JoinHandle;

const LOG_TARGET: &str = "peerlink::bridge";

struct BridgeTask {
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

/// See the module documentation.
pub struct MonitorBridge {
    monitor: Arc<HealthMonitor>,
    manager: Arc<RecoveryManager>,
    inner: Mutex<Option<BridgeTask>>,
}

impl MonitorBridge {
    pub fn new(monitor: Arc<HealthMonitor>, manager: Arc<RecoveryManager>) -> MonitorBridge {
        MonitorBridge {
            monitor,
            manager,
            inner: Mutex::new(None),
        }
    }

    /// Starts the listener task. Idempotent.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            debug!(target: LOG_TARGET, "bridge already started");
            return;
        }
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(listen(
            self.monitor.clone(),
            self.manager.clone(),
            shutdown.signal(),
        ));
        *inner = Some(BridgeTask { shutdown, handle });
        info!(target: LOG_TARGET, "bridge started");
    }

    /// Stops and joins the listener task. A `stop` without a preceding
    /// `start` is a no-op.
    pub async fn stop(&self) {
        let task = self.inner.lock().take();
        if let Some(task) = task {
            task.shutdown.trigger();
            let _ = task.handle.await;
            info!(target: LOG_TARGET, "bridge stopped");
        }
    }
}

async fn listen(
    monitor: Arc<HealthMonitor>,
    manager: Arc<RecoveryManager>,
    mut signal: ShutdownSignal,
) {
    let mut subscription = monitor.subscribe();
    let subscription_id = subscription.id();

    loop {
        let change = tokio::select! {
            _ = signal.wait() => break,
            change = subscription.recv() => match change {
                Some(change) => change,
                // The monitor stopped and closed the channel.
                None => break,
            },
        };

        if change.current != HealthState::Down {
            continue;
        }
        if change.reason == StateChangeReason::RecoveryFailed
            && monitor.recovery_attempts_exhausted()
        {
            warn!(
                target: LOG_TARGET,
                "recovery attempts exhausted; not triggering again"
            );
            continue;
        }

        debug!(
            target: LOG_TARGET,
            "monitor went down ({}), triggering recovery", change.reason
        );
        monitor.trigger_recovery_state(change.reason).await;
        let result = manager
            .trigger_recovery(signal.clone(), RecoveryReason::from(change.reason))
            .await;

        if result.success {
            monitor.notify_recovery_success().await;
        } else {
            match result.error {
                // Another trigger is already running the pipeline; its own
                // completion will report back.
                Some(RecoveryError::InProgress) => {}
                Some(err) => monitor.notify_recovery_failed(err).await,
                None => monitor.notify_recovery_failed(RecoveryError::Failed).await,
            }
        }
    }

    monitor.unsubscribe(subscription_id);
}
