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

//! Accumulator for network-diagnostic facts.
//!
//! Probe tasks running concurrently append what they observe (UDP
//! reachability, per-server address mappings, relay latencies, port-mapping
//! protocol availability, captive-portal detection); [`ReportBuilder::build`]
//! freezes the facts into an immutable [`Report`], inferring the NAT type
//! when no probe set it explicitly.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// NAT classification.
///
/// Without CHANGE-REQUEST support the full-cone / restricted /
/// port-restricted split cannot be told apart, so every non-symmetric NAT
/// is reported as [`NatType::Full`], best effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    Unknown,
    Full,
    Symmetric,
}

impl Default for NatType {
    fn default() -> Self {
        NatType::Unknown
    }
}

/// The external address one probe server observed for us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMapping {
    pub server: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// UDP reachability over one address family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpReachability {
    pub works: bool,
    pub external_ip: Option<IpAddr>,
    pub external_port: Option<u16>,
}

/// Availability of the port-mapping protocols on the local gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortMapAvailability {
    pub upnp: bool,
    pub natpmp: bool,
    pub pcp: bool,
}

/// An immutable snapshot of everything a probe run learned.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub udp_v4: UdpReachability,
    pub udp_v6: UdpReachability,
    pub ipv4_mappings: Vec<AddressMapping>,
    pub ipv6_mappings: Vec<AddressMapping>,
    pub nat_type: NatType,
    /// Minimum observed latency per relay URL.
    pub relay_latencies: HashMap<String, Duration>,
    /// Relay with the lowest observed latency.
    pub preferred_relay: Option<String>,
    pub port_map: PortMapAvailability,
    pub captive_portal: Option<bool>,
    pub duration: Duration,
}

struct BuilderInner {
    report: Report,
    nat_type_set: bool,
}

/// Concurrency-safe builder for [`Report`]s. Strictly append-only while a
/// probe run is in flight.
pub struct ReportBuilder {
    inner: Mutex<BuilderInner>,
}

impl ReportBuilder {
    pub fn new() -> ReportBuilder {
        ReportBuilder {
            inner: Mutex::new(BuilderInner {
                report: Report::default(),
                nat_type_set: false,
            }),
        }
    }

    pub fn set_udp_v4(&self, works: bool, ip: Option<IpAddr>, port: Option<u16>) {
        let mut inner = self.inner.lock();
        inner.report.udp_v4 = UdpReachability { works, external_ip: ip, external_port: port };
    }

    pub fn set_udp_v6(&self, works: bool, ip: Option<IpAddr>, port: Option<u16>) {
        let mut inner = self.inner.lock();
        inner.report.udp_v6 = UdpReachability { works, external_ip: ip, external_port: port };
    }

    pub fn add_ipv4_mapping(&self, server: impl Into<String>, ip: IpAddr, port: u16) {
        let mut inner = self.inner.lock();
        inner
            .report
            .ipv4_mappings
            .push(AddressMapping { server: server.into(), ip, port });
    }

    pub fn add_ipv6_mapping(&self, server: impl Into<String>, ip: IpAddr, port: u16) {
        let mut inner = self.inner.lock();
        inner
            .report
            .ipv6_mappings
            .push(AddressMapping { server: server.into(), ip, port });
    }

    /// Sets the NAT type explicitly, suppressing inference in
    /// [`build`](Self::build).
    pub fn set_nat_type(&self, nat_type: NatType) {
        let mut inner = self.inner.lock();
        inner.report.nat_type = nat_type;
        inner.nat_type_set = true;
    }

    /// Records a relay latency sample, keeping the minimum per URL, and
    /// re-derives the preferred relay.
    pub fn add_relay_latency(&self, url: impl Into<String>, latency: Duration) {
        let mut inner = self.inner.lock();
        let url = url.into();
        let entry = inner
            .report
            .relay_latencies
            .entry(url)
            .or_insert(latency);
        if latency < *entry {
            *entry = latency;
        }
        let preferred = inner
            .report
            .relay_latencies
            .iter()
            .min_by_key(|(_, lat)| **lat)
            .map(|(url, _)| url.clone());
        inner.report.preferred_relay = preferred;
    }

    pub fn set_port_map_availability(&self, upnp: bool, natpmp: bool, pcp: bool) {
        self.inner.lock().report.port_map = PortMapAvailability { upnp, natpmp, pcp };
    }

    pub fn set_captive_portal(&self, detected: bool) {
        self.inner.lock().report.captive_portal = Some(detected);
    }

    pub fn set_duration(&self, duration: Duration) {
        self.inner.lock().report.duration = duration;
    }

    /// A deep copy of the facts gathered so far, while the run may still
    /// be appending.
    pub fn snapshot(&self) -> Report {
        self.inner.lock().report.clone()
    }

    /// Freezes the report. When no probe set the NAT type, it is inferred:
    /// mappings that disagree across servers mean symmetric NAT; otherwise
    /// any UDP reachability is reported as full-cone (best effort); with
    /// no evidence at all the type stays unknown.
    pub fn build(&self) -> Report {
        let inner = self.inner.lock();
        let mut report = inner.report.clone();
        if !inner.nat_type_set {
            report.nat_type = infer_nat_type(&report);
        }
        report
    }
}

impl Default for ReportBuilder {
    fn default() -> Self {
        ReportBuilder::new()
    }
}

fn infer_nat_type(report: &Report) -> NatType {
    let mappings: Vec<&AddressMapping> = report
        .ipv4_mappings
        .iter()
        .chain(report.ipv6_mappings.iter())
        .collect();
    if mappings.len() >= 2 {
        let first = (&mappings[0].ip, mappings[0].port);
        if mappings.iter().any(|m| (&m.ip, m.port) != first) {
            return NatType::Symmetric;
        }
    }
    if report.udp_v4.works || report.udp_v6.works {
        return NatType::Full;
    }
    NatType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn infers_symmetric_from_diverging_mappings() {
        let builder = ReportBuilder::new();
        builder.add_ipv4_mapping("stun-a", ip("203.0.113.7"), 4000);
        builder.add_ipv4_mapping("stun-b", ip("203.0.113.7"), 4001);
        let report = builder.build();
        assert_eq!(report.nat_type, NatType::Symmetric);
    }

    #[test]
    fn infers_full_cone_from_agreeing_mappings() {
        let builder = ReportBuilder::new();
        builder.set_udp_v4(true, Some(ip("203.0.113.7")), Some(4000));
        builder.add_ipv4_mapping("stun-a", ip("203.0.113.7"), 4000);
        builder.add_ipv4_mapping("stun-b", ip("203.0.113.7"), 4000);
        let report = builder.build();
        assert_eq!(report.nat_type, NatType::Full);
    }

    #[test]
    fn no_evidence_means_unknown() {
        let report = ReportBuilder::new().build();
        assert_eq!(report.nat_type, NatType::Unknown);
    }

    #[test]
    fn explicit_nat_type_suppresses_inference() {
        let builder = ReportBuilder::new();
        builder.add_ipv4_mapping("stun-a", ip("203.0.113.7"), 4000);
        builder.add_ipv4_mapping("stun-b", ip("198.51.100.2"), 4000);
        builder.set_nat_type(NatType::Full);
        assert_eq!(builder.build().nat_type, NatType::Full);
    }

    #[test]
    fn relay_latency_keeps_minimum_and_preference() {
        let builder = ReportBuilder::new();
        builder.add_relay_latency("relay-a", Duration::from_millis(80));
        builder.add_relay_latency("relay-b", Duration::from_millis(20));
        builder.add_relay_latency("relay-a", Duration::from_millis(10));
        builder.add_relay_latency("relay-a", Duration::from_millis(50));

        let report = builder.build();
        assert_eq!(report.relay_latencies["relay-a"], Duration::from_millis(10));
        assert_eq!(report.relay_latencies["relay-b"], Duration::from_millis(20));
        assert_eq!(report.preferred_relay.as_deref(), Some("relay-a"));
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let builder = ReportBuilder::new();
        builder.add_relay_latency("relay-a", Duration::from_millis(5));
        let snapshot = builder.snapshot();
        builder.add_relay_latency("relay-b", Duration::from_millis(1));
        assert_eq!(snapshot.relay_latencies.len(), 1);
        assert_eq!(builder.build().relay_latencies.len(), 2);
    }
}
