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

//! Sliding-window accounting of per-peer send errors.

use crate::config::HealthConfig;
use parking_lot::Mutex;
use peerlink_core::PeerId;
use std::collections::{HashMap, VecDeque};
use std::time::{Instant, SystemTime};

/// What one recorded error meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorObservation {
    /// The peer crossed the consecutive-error threshold with this error.
    pub reached_threshold: bool,
    /// The error message matched the critical list.
    pub is_critical: bool,
}

/// Per-peer error bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerErrorRecord {
    pub consecutive_errors: u32,
    /// Timestamps of recent errors, pruned to the configured window.
    pub error_timestamps: VecDeque<Instant>,
    pub last_success_at: Option<Instant>,
    pub last_error_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl PeerErrorRecord {
    fn new() -> Self {
        PeerErrorRecord {
            consecutive_errors: 0,
            error_timestamps: VecDeque::new(),
            last_success_at: None,
            last_error_at: None,
            last_error: None,
        }
    }
}

/// The most recent critical error the counter saw.
#[derive(Debug, Clone)]
pub struct CriticalError {
    pub peer: PeerId,
    pub message: String,
    pub at: SystemTime,
}

struct CounterInner {
    peers: HashMap<PeerId, PeerErrorRecord>,
    last_critical: Option<CriticalError>,
}

/// Thread-safe sliding-window error counter.
///
/// Records are created lazily on the first error or success for a peer and
/// removed by [`reset`](ErrorCounter::reset) /
/// [`reset_peer`](ErrorCounter::reset_peer).
pub struct ErrorCounter {
    threshold: u32,
    window: std::time::Duration,
    /// Lower-cased critical substrings.
    critical: Vec<String>,
    inner: Mutex<CounterInner>,
}

impl ErrorCounter {
    pub fn new(config: &HealthConfig) -> Self {
        ErrorCounter {
            threshold: config.error_threshold,
            window: config.error_window,
            critical: config
                .critical_errors
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            inner: Mutex::new(CounterInner {
                peers: HashMap::new(),
                last_critical: None,
            }),
        }
    }

    /// Records a send error. An empty message means "no error" and is
    /// ignored entirely.
    pub fn record_error(&self, peer: &PeerId, message: &str) -> ErrorObservation {
        if message.is_empty() {
            return ErrorObservation { reached_threshold: false, is_critical: false };
        }
        let now = Instant::now();
        let lowered = message.to_lowercase();
        let is_critical = self.critical.iter().any(|c| lowered.contains(c.as_str()));

        let mut inner = self.inner.lock();
        let record = inner
            .peers
            .entry(peer.clone())
            .or_insert_with(PeerErrorRecord::new);
        record.error_timestamps.push_back(now);
        while let Some(front) = record.error_timestamps.front() {
            if now.duration_since(*front) > self.window {
                record.error_timestamps.pop_front();
            } else {
                break;
            }
        }
        record.consecutive_errors += 1;
        record.last_error_at = Some(now);
        record.last_error = Some(message.to_string());
        let reached_threshold = record.consecutive_errors >= self.threshold;

        if is_critical {
            inner.last_critical = Some(CriticalError {
                peer: peer.clone(),
                message: message.to_string(),
                at: SystemTime::now(),
            });
        }

        ErrorObservation { reached_threshold, is_critical }
    }

    /// Records a successful send, clearing the peer's consecutive-error
    /// streak.
    pub fn record_success(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        let record = inner
            .peers
            .entry(peer.clone())
            .or_insert_with(PeerErrorRecord::new);
        record.consecutive_errors = 0;
        record.last_success_at = Some(Instant::now());
    }

    /// Peers at or above the error threshold.
    pub fn failing_peers(&self) -> Vec<PeerId> {
        self.inner
            .lock()
            .peers
            .iter()
            .filter(|(_, r)| r.consecutive_errors >= self.threshold)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Peers with no outstanding error streak.
    pub fn healthy_peers(&self) -> Vec<PeerId> {
        self.inner
            .lock()
            .peers
            .iter()
            .filter(|(_, r)| r.consecutive_errors == 0)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Number of peers the counter currently tracks.
    pub fn known_peers(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn peer_error_count(&self, peer: &PeerId) -> u32 {
        self.inner
            .lock()
            .peers
            .get(peer)
            .map(|r| r.consecutive_errors)
            .unwrap_or(0)
    }

    pub fn last_critical(&self) -> Option<CriticalError> {
        self.inner.lock().last_critical.clone()
    }

    /// Drops all state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.peers.clear();
        inner.last_critical = None;
    }

    /// Drops the record of one peer.
    pub fn reset_peer(&self, peer: &PeerId) {
        self.inner.lock().peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> ErrorCounter {
        let mut cfg = HealthConfig::default();
        cfg.error_threshold = 3;
        ErrorCounter::new(&cfg)
    }

    #[test]
    fn threshold_is_reached_on_consecutive_errors() {
        let c = counter();
        let peer = PeerId::random();
        assert!(!c.record_error(&peer, "timed out").reached_threshold);
        assert!(!c.record_error(&peer, "timed out").reached_threshold);
        let obs = c.record_error(&peer, "timed out");
        assert!(obs.reached_threshold);
        assert_eq!(c.peer_error_count(&peer), 3);
        assert_eq!(c.failing_peers(), vec![peer]);
    }

    #[test]
    fn success_clears_the_streak() {
        let c = counter();
        let peer = PeerId::random();
        for _ in 0..3 {
            c.record_error(&peer, "timed out");
        }
        assert_eq!(c.failing_peers().len(), 1);
        c.record_success(&peer);
        assert!(c.failing_peers().is_empty());
        assert_eq!(c.healthy_peers(), vec![peer]);
    }

    #[test]
    fn critical_errors_match_case_insensitively() {
        let c = counter();
        let peer = PeerId::random();
        let obs = c.record_error(&peer, "dial tcp: Network Is Unreachable");
        assert!(obs.is_critical);
        let critical = c.last_critical().unwrap();
        assert_eq!(critical.peer, peer);

        let obs = c.record_error(&peer, "some ordinary timeout");
        assert!(!obs.is_critical);
    }

    #[test]
    fn empty_message_is_ignored() {
        let c = counter();
        let peer = PeerId::random();
        let obs = c.record_error(&peer, "");
        assert!(!obs.reached_threshold && !obs.is_critical);
        assert_eq!(c.known_peers(), 0);
    }

    #[test]
    fn reset_peer_forgets_only_that_peer() {
        let c = counter();
        let a = PeerId::random();
        let b = PeerId::random();
        c.record_error(&a, "x");
        c.record_error(&b, "x");
        c.reset_peer(&a);
        assert_eq!(c.peer_error_count(&a), 0);
        assert_eq!(c.peer_error_count(&b), 1);
        c.reset();
        assert_eq!(c.known_peers(), 0);
    }
}
