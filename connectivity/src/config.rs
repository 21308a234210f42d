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

use std::time::Duration;
use thiserror::Error;

/// Error messages that indicate an environmental fault rather than a
/// peer-local one. Matched case-insensitively as substrings.
pub const DEFAULT_CRITICAL_ERRORS: &[&str] = &[
    "network is unreachable",
    "no route to host",
    "connection refused",
    "host is down",
];

/// Configuration of the health monitor and its error counter.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive send errors to a peer before it counts as failing.
    pub error_threshold: u32,
    /// Sliding window for per-peer error timestamps.
    pub error_window: Duration,
    /// Substrings that classify an error as critical.
    pub critical_errors: Vec<String>,
    /// Grace period during which a pending state change may be overridden
    /// by a newer one.
    pub state_change_debounce: Duration,
    /// Cadence of the prober, when one is attached.
    pub probe_interval: Duration,
    /// Recovery failures tolerated before the monitor drops to `Down`
    /// permanently (until a success resets the counter).
    pub max_recovery_attempts: u32,
    /// Buffered health changes per subscriber.
    pub event_channel_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            error_threshold: 3,
            error_window: Duration::from_secs(60),
            critical_errors: DEFAULT_CRITICAL_ERRORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            state_change_debounce: Duration::from_millis(500),
            probe_interval: Duration::from_secs(30),
            max_recovery_attempts: 5,
            event_channel_capacity: 16,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.error_threshold == 0 {
            return Err(ConfigError::Invalid("error_threshold must be at least 1"));
        }
        if self.error_window.is_zero() {
            return Err(ConfigError::Invalid("error_window must be non-zero"));
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::Invalid("probe_interval must be non-zero"));
        }
        if self.event_channel_capacity < 10 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be at least 10",
            ));
        }
        Ok(())
    }
}

/// Configuration of the recovery manager.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Whether recovery runs at all; when disabled, triggers return a
    /// failed result without side effects. The policy belongs to the outer
    /// layer, this crate only honors it.
    pub enabled: bool,
    /// Bounds one full recovery run.
    pub recovery_timeout: Duration,
    /// Rebind the transport when the trigger reason asks for it.
    pub rebind_on_critical_error: bool,
    /// Run address discovery as part of recovery.
    pub rediscover_addresses: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            enabled: true,
            recovery_timeout: Duration::from_secs(30),
            rebind_on_critical_error: true,
            rediscover_addresses: true,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::Invalid("recovery_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// A configuration constraint was violated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(HealthConfig::default().validate().is_ok());
        assert!(RecoveryConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut cfg = HealthConfig::default();
        cfg.error_threshold = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn small_event_capacity_is_rejected() {
        let mut cfg = HealthConfig::default();
        cfg.event_channel_capacity = 4;
        assert!(cfg.validate().is_err());
    }
}
