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

//! Connection health monitoring and recovery for peerlink.
//!
//! The pieces and how they wire together:
//!
//! - [`ErrorCounter`] keeps sliding-window send-error accounting per peer;
//! - [`HealthMonitor`] folds counter events, [`Prober`] results and
//!   [`SystemWatcher`]/[`NetworkMonitor`] events into a debounced
//!   four-state health machine and broadcasts transitions;
//! - [`RecoveryManager`] runs the bounded, single-flight recovery workflow
//!   against its [`Rebinder`]/[`AddressDiscoverer`]/[`Connector`]
//!   collaborators;
//! - [`MonitorBridge`] closes the loop: `Down` transitions trigger
//!   recovery, recovery outcomes feed back into the monitor;
//! - [`ReportBuilder`] accumulates network-diagnostic facts concurrently.

pub mod bridge;
pub mod config;
pub mod counter;
pub mod event;
pub mod monitor;
pub mod probe;
pub mod recovery;
pub mod report;

pub use bridge::MonitorBridge;
pub use config::{ConfigError, HealthConfig, RecoveryConfig, DEFAULT_CRITICAL_ERRORS};
pub use counter::{CriticalError, ErrorCounter, ErrorObservation, PeerErrorRecord};
pub use event::{ConnectionHealthChange, HealthState, StateChangeReason};
pub use monitor::{HealthMonitor, HealthSnapshot, HealthSubscription, SubscriptionId};
pub use probe::{
    NetworkChangeEvent, NetworkChangeKind, NetworkEvent, NetworkEventKind, NetworkMonitor,
    NoopProber, ProbeResult, Prober, SystemWatcher,
};
pub use recovery::{
    AddressDiscoverer, Connector, Rebinder, RecoveryError, RecoveryManager, RecoveryReason,
    RecoveryResult,
};
pub use report::{NatType, Report, ReportBuilder};
