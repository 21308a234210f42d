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

//! Peerlink
//!
//! The core of a peer-to-peer transport stack: it turns a raw, untrusted
//! byte stream between two hosts into a mutually authenticated, encrypted,
//! stream-multiplexed channel, and keeps such channels healthy over time.
//!
//! The member crates, re-exported here:
//!
//! - [`core`]: identifiers, capability traits, resource scopes and the
//!   [`Upgrader`] pipeline;
//! - [`multiselect`]: the protocol negotiation spoken during an upgrade;
//! - [`yamux`]: the stream multiplexer;
//! - [`plaintext`]: a no-crypto identity exchange for tests and trusted
//!   networks;
//! - [`connectivity`]: health monitoring, recovery and diagnostics
//!   reporting.

pub use multiselect;
pub use peerlink_connectivity as connectivity;
pub use peerlink_core as core;
pub use peerlink_plaintext as plaintext;
pub use peerlink_yamux as yamux;

pub use peerlink_connectivity::{
    HealthMonitor, MonitorBridge, RecoveryManager, ReportBuilder,
};
pub use peerlink_core::{
    Direction, Multiaddr, PeerId, Shutdown, ShutdownSignal, UpgradeError, UpgradedConn, Upgrader,
    UpgraderConfig,
};
