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

//! Health states, transition reasons and the change events broadcast to
//! subscribers.

use peerlink_core::PeerId;
use std::fmt;
use std::time::SystemTime;

/// Overall connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    Healthy,
    Degraded,
    Down,
    Recovering,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => f.write_str("healthy"),
            HealthState::Degraded => f.write_str("degraded"),
            HealthState::Down => f.write_str("down"),
            HealthState::Recovering => f.write_str("recovering"),
        }
    }
}

/// Why the monitor changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChangeReason {
    /// A peer crossed the consecutive-error threshold.
    ErrorThreshold,
    /// An error matched the critical list.
    CriticalError,
    /// Every known peer is failing.
    AllConnectionsLost,
    /// The system watcher or network monitor reported a major change.
    NetworkChanged,
    /// The prober reported everything unreachable.
    ProbeFailed,
    /// The prober reported partial reachability.
    ProbeDegraded,
    /// The prober reported reachability again.
    ProbeRecovered,
    /// A send succeeded and no peer is failing any more.
    PeerRecovered,
    /// Recovery completed successfully.
    RecoverySucceeded,
    /// Recovery failed (possibly exhausting its attempts).
    RecoveryFailed,
    /// An operator or the bridge forced the transition.
    ManualTrigger,
    /// Monitor state was reset.
    Reset,
}

impl fmt::Display for StateChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateChangeReason::ErrorThreshold => "error threshold reached",
            StateChangeReason::CriticalError => "critical error",
            StateChangeReason::AllConnectionsLost => "all connections lost",
            StateChangeReason::NetworkChanged => "network changed",
            StateChangeReason::ProbeFailed => "probe failed",
            StateChangeReason::ProbeDegraded => "probe degraded",
            StateChangeReason::ProbeRecovered => "probe recovered",
            StateChangeReason::PeerRecovered => "peer recovered",
            StateChangeReason::RecoverySucceeded => "recovery succeeded",
            StateChangeReason::RecoveryFailed => "recovery failed",
            StateChangeReason::ManualTrigger => "manual trigger",
            StateChangeReason::Reset => "reset",
        };
        f.write_str(s)
    }
}

/// One observed health transition, broadcast to every subscriber.
#[derive(Debug, Clone)]
pub struct ConnectionHealthChange {
    pub previous: HealthState,
    pub current: HealthState,
    pub reason: StateChangeReason,
    pub timestamp: SystemTime,
    /// The peer whose error triggered the change, if one did.
    pub trigger_peer: Option<PeerId>,
    /// The error message that triggered the change, if one did.
    pub trigger_error: Option<String>,
}
