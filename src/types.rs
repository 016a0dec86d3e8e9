use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::ports::{PortClass, PortTable, Protocol};

/// IP family of a candidate address.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn all() -> Vec<AddressFamily> {
        vec![AddressFamily::V4, AddressFamily::V6]
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("ipv4"),
            AddressFamily::V6 => f.write_str("ipv6"),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "4" | "v4" | "ipv4" => Ok(AddressFamily::V4),
            "6" | "v6" | "ipv6" => Ok(AddressFamily::V6),
            other => Err(format!("unknown address family: {other}")),
        }
    }
}

/// One address prefix under evaluation.
///
/// `raw` keeps the pool entry as written (possibly CIDR); `address` is the part
/// before the `/`, which is what actually gets probed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub raw: String,
    pub address: IpAddr,
    pub family: AddressFamily,
}

/// A single (address, port, protocol) measurement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTask {
    pub target: SocketAddr,
    pub protocol: Protocol,
}

impl ProbeTask {
    pub fn new(candidate: &Candidate, port: u16, protocol: Protocol) -> Self {
        Self {
            target: SocketAddr::new(candidate.address, port),
            protocol,
        }
    }

    pub fn port(&self) -> u16 {
        self.target.port()
    }
}

/// Fields parsed out of a `/cdn-cgi/trace` body.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceEvidence {
    /// Three-letter point-of-presence code (`colo=`).
    pub pop_code: Option<String>,
    /// Two-letter location code (`loc=`).
    pub location_code: Option<String>,
}

impl TraceEvidence {
    /// Parse trace fields from a response body. Malformed or missing fields are
    /// left empty; returns `None` when nothing usable was found.
    pub fn parse(body: &str) -> Option<Self> {
        let mut evidence = TraceEvidence::default();
        for line in body.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "colo" if is_upper_code(value, 3) => evidence.pop_code = Some(value.to_string()),
                "loc" if is_upper_code(value, 2) => {
                    evidence.location_code = Some(value.to_string())
                }
                _ => {}
            }
        }
        if evidence.pop_code.is_none() && evidence.location_code.is_none() {
            None
        } else {
            Some(evidence)
        }
    }
}

fn is_upper_code(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_uppercase())
}

/// Which prober strategy produced an outcome.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStrategy {
    Trace,
    Connect,
}

/// Total latency and its connect/response phases, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySplit {
    pub total_ms: f64,
    pub connect_ms: f64,
    pub response_ms: f64,
}

impl LatencySplit {
    pub const CONNECT_SHARE: f64 = 0.6;
    pub const RESPONSE_SHARE: f64 = 0.4;

    /// Phase timings taken from real timestamps.
    pub fn measured(connect: Duration, total: Duration) -> Self {
        let total_ms = duration_ms(total);
        let connect_ms = duration_ms(connect).min(total_ms);
        Self {
            total_ms,
            connect_ms,
            response_ms: total_ms - connect_ms,
        }
    }

    /// Fixed 60/40 estimate from a single round trip.
    pub fn estimated(total_ms: f64) -> Self {
        Self {
            total_ms,
            connect_ms: total_ms * Self::CONNECT_SHARE,
            response_ms: total_ms * Self::RESPONSE_SHARE,
        }
    }
}

pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

/// Result of one completed `ProbeTask`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortProbeOutcome {
    pub port: u16,
    pub success: bool,
    pub total_latency_ms: f64,
    pub connect_latency_ms: f64,
    pub response_latency_ms: f64,
    pub evidence: Option<TraceEvidence>,
    pub strategy: Option<ProbeStrategy>,
    #[serde(default)]
    pub timed_out: bool,
    pub error: Option<String>,
}

impl PortProbeOutcome {
    pub fn success(
        port: u16,
        latency: LatencySplit,
        strategy: ProbeStrategy,
        evidence: Option<TraceEvidence>,
    ) -> Self {
        Self {
            port,
            success: true,
            total_latency_ms: latency.total_ms,
            connect_latency_ms: latency.connect_ms,
            response_latency_ms: latency.response_ms,
            evidence,
            strategy: Some(strategy),
            timed_out: false,
            error: None,
        }
    }

    pub fn failure(port: u16, timed_out: bool, error: impl Into<String>) -> Self {
        Self {
            port,
            success: false,
            total_latency_ms: f64::INFINITY,
            connect_latency_ms: f64::INFINITY,
            response_latency_ms: f64::INFINITY,
            evidence: None,
            strategy: None,
            timed_out,
            error: Some(error.into()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Success,
    Timeout,
    Failed,
}

impl CandidateStatus {
    pub fn is_success(self) -> bool {
        matches!(self, CandidateStatus::Success)
    }
}

/// How a region identifier was obtained, strongest first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    PopCode,
    LocationCode,
    GeoLookup,
    LatencyHeuristic,
    Unknown,
}

impl Provenance {
    /// True for tiers backed by data returned by the endpoint itself.
    pub fn is_direct_evidence(self) -> bool {
        matches!(self, Provenance::PopCode | Provenance::LocationCode)
    }

    pub fn label(self) -> &'static str {
        match self {
            Provenance::PopCode => "pop_code",
            Provenance::LocationCode => "location_code",
            Provenance::GeoLookup => "geo_lookup",
            Provenance::LatencyHeuristic => "latency_heuristic",
            Provenance::Unknown => "unknown",
        }
    }
}

pub const UNKNOWN_REGION: &str = "unknown";

/// Open ports of a candidate, split by port class.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PortGroups {
    pub plain: Vec<u16>,
    pub secure: Vec<u16>,
}

impl PortGroups {
    pub fn all(&self) -> impl Iterator<Item = u16> + '_ {
        self.plain.iter().chain(self.secure.iter()).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.secure.is_empty()
    }
}

/// Finalized per-candidate result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CandidateResult {
    pub candidate: Candidate,
    pub status: CandidateStatus,
    pub best: Option<PortProbeOutcome>,
    /// Successful outcomes ordered by ascending latency.
    pub successes: Vec<PortProbeOutcome>,
    pub region: String,
    pub region_source: Provenance,
    pub port_groups: PortGroups,
    pub ports_tested: usize,
}

impl CandidateResult {
    /// Build a result once every port of the candidate has settled.
    pub fn from_outcomes(
        candidate: Candidate,
        outcomes: Vec<PortProbeOutcome>,
        table: &PortTable,
    ) -> Self {
        let ports_tested = outcomes.len();
        let all_timed_out = outcomes.iter().all(|o| !o.success && o.timed_out);

        let mut port_groups = PortGroups::default();
        for o in outcomes.iter().filter(|o| o.success) {
            match table.class_of(o.port) {
                PortClass::Plain => port_groups.plain.push(o.port),
                PortClass::Secure => port_groups.secure.push(o.port),
            }
        }

        let mut successes: Vec<PortProbeOutcome> =
            outcomes.into_iter().filter(|o| o.success).collect();
        // stable: the earlier port wins a latency tie
        successes.sort_by(|a, b| a.total_latency_ms.total_cmp(&b.total_latency_ms));

        let status = if !successes.is_empty() {
            CandidateStatus::Success
        } else if ports_tested > 0 && all_timed_out {
            CandidateStatus::Timeout
        } else {
            CandidateStatus::Failed
        };

        Self {
            candidate,
            status,
            best: successes.first().cloned(),
            successes,
            region: UNKNOWN_REGION.to_string(),
            region_source: Provenance::Unknown,
            port_groups,
            ports_tested,
        }
    }

    /// Result for a candidate whose probing task died before producing outcomes.
    pub fn failed(candidate: Candidate) -> Self {
        Self {
            candidate,
            status: CandidateStatus::Failed,
            best: None,
            successes: Vec::new(),
            region: UNKNOWN_REGION.to_string(),
            region_source: Provenance::Unknown,
            port_groups: PortGroups::default(),
            ports_tested: 0,
        }
    }

    pub fn best_latency_ms(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.total_latency_ms)
    }
}

/// Progress counters `(completed, total, failures)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
    pub failures: u64,
}

impl Progress {
    pub fn successes(&self) -> u64 {
        self.completed.saturating_sub(self.failures)
    }

    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.completed * 100 / self.total
        }
    }
}

/// Everything a finished (or cancelled) run produced.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScanReport {
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub progress: Progress,
    /// Results in completion order.
    pub results: Vec<CandidateResult>,
}

impl ScanReport {
    /// Share of completed candidates that succeeded, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.progress.completed == 0 {
            0.0
        } else {
            self.progress.successes() as f64 * 100.0 / self.progress.completed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn candidate() -> Candidate {
        Candidate {
            raw: "203.0.113.0/24".into(),
            address: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 0)),
            family: AddressFamily::V4,
        }
    }

    #[test]
    fn trace_body_yields_pop_and_location() {
        let body = "fl=12f34\nh=203.0.113.0\nip=198.51.100.7\ncolo=SJC\nloc=US\ntls=off\n";
        let ev = TraceEvidence::parse(body).unwrap();
        assert_eq!(ev.pop_code.as_deref(), Some("SJC"));
        assert_eq!(ev.location_code.as_deref(), Some("US"));
    }

    #[test]
    fn malformed_trace_fields_are_ignored() {
        assert_eq!(TraceEvidence::parse("colo=sj\nloc=USA\n"), None);
        let ev = TraceEvidence::parse("colo=lax\nloc=DE").unwrap();
        assert_eq!(ev.pop_code, None);
        assert_eq!(ev.location_code.as_deref(), Some("DE"));
    }

    #[test]
    fn estimated_split_is_sixty_forty() {
        let s = LatencySplit::estimated(100.0);
        assert!((s.connect_ms - 60.0).abs() < 1e-9);
        assert!((s.response_ms - 40.0).abs() < 1e-9);
    }

    #[test]
    fn measured_split_uses_timestamps() {
        let s = LatencySplit::measured(Duration::from_millis(30), Duration::from_millis(50));
        assert!((s.connect_ms - 30.0).abs() < 1e-6);
        assert!((s.response_ms - 20.0).abs() < 1e-6);
    }

    #[test]
    fn best_is_lowest_latency_success() {
        let table = PortTable::cdn_default();
        let outcomes = vec![
            PortProbeOutcome::success(80, LatencySplit::estimated(70.0), ProbeStrategy::Trace, None),
            PortProbeOutcome::failure(8080, true, "timed out"),
            PortProbeOutcome::success(443, LatencySplit::estimated(40.0), ProbeStrategy::Trace, None),
            PortProbeOutcome::success(2053, LatencySplit::estimated(40.0), ProbeStrategy::Connect, None),
        ];
        let r = CandidateResult::from_outcomes(candidate(), outcomes, &table);
        assert_eq!(r.status, CandidateStatus::Success);
        assert_eq!(r.best.as_ref().map(|b| b.port), Some(443));
        assert_eq!(r.successes.len(), 3);
        assert_eq!(r.port_groups.plain, vec![80]);
        assert_eq!(r.port_groups.secure, vec![443, 2053]);
        assert_eq!(r.ports_tested, 4);
    }

    #[test]
    fn status_distinguishes_timeout_from_failure() {
        let table = PortTable::cdn_default();
        let timed_out = vec![
            PortProbeOutcome::failure(80, true, "timed out"),
            PortProbeOutcome::failure(443, true, "timed out"),
        ];
        let r = CandidateResult::from_outcomes(candidate(), timed_out, &table);
        assert_eq!(r.status, CandidateStatus::Timeout);
        assert!(r.best.is_none());

        let mixed = vec![
            PortProbeOutcome::failure(80, true, "timed out"),
            PortProbeOutcome::failure(443, false, "connection refused"),
        ];
        let r = CandidateResult::from_outcomes(candidate(), mixed, &table);
        assert_eq!(r.status, CandidateStatus::Failed);
    }

    #[test]
    fn family_parses_common_spellings() {
        assert_eq!("ipv6".parse::<AddressFamily>().unwrap(), AddressFamily::V6);
        assert_eq!("4".parse::<AddressFamily>().unwrap(), AddressFamily::V4);
        assert!("ipx".parse::<AddressFamily>().is_err());
    }
}
