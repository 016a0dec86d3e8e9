//! Filtering, ordering and export shaping of finished results. Nothing here
//! mutates its input; calling `rank` twice on the same results gives the same list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};

use crate::regions::{self, Continent};
use crate::types::{AddressFamily, CandidateResult, PortGroups, Provenance};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Excellent,
    Good,
    Average,
    Poor,
}

impl LatencyClass {
    /// Bucket a latency by its share of the configured maximum.
    pub fn classify(latency_ms: f64, max_latency_ms: f64) -> Self {
        if !latency_ms.is_finite() || max_latency_ms <= 0.0 {
            return LatencyClass::Poor;
        }
        let ratio = latency_ms / max_latency_ms;
        if ratio < 0.5 {
            LatencyClass::Excellent
        } else if ratio < 0.8 {
            LatencyClass::Good
        } else if ratio < 1.0 {
            LatencyClass::Average
        } else {
            LatencyClass::Poor
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LatencyClass::Excellent => "excellent",
            LatencyClass::Good => "good",
            LatencyClass::Average => "average",
            LatencyClass::Poor => "poor",
        }
    }
}

/// Filters and caps for `rank`. Empty lists mean "no filter".
#[derive(Debug, Clone, Default)]
pub struct RankOptions {
    pub families: Vec<AddressFamily>,
    pub regions: Vec<String>,
    pub continents: Vec<Continent>,
    /// Drop entries slower than this, in addition to the class threshold.
    pub max_latency_ms: Option<f64>,
    /// Keep at most this many entries per region.
    pub region_cap: Option<usize>,
}

impl RankOptions {
    fn keeps(&self, result: &CandidateResult, latency_ms: f64) -> bool {
        if !self.families.is_empty() && !self.families.contains(&result.candidate.family) {
            return false;
        }
        if !self.regions.is_empty()
            && !self.regions.iter().any(|r| r.eq_ignore_ascii_case(&result.region))
        {
            return false;
        }
        if let Some(max) = self.max_latency_ms {
            if latency_ms > max {
                return false;
            }
        }
        if !self.continents.is_empty() {
            match regions::continent_of(&result.region) {
                Some(c) if self.continents.contains(&c) => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RankedEntry {
    pub address: IpAddr,
    pub raw: String,
    pub family: AddressFamily,
    pub region: String,
    pub region_name: String,
    pub provenance: Provenance,
    pub latency_ms: f64,
    pub connect_latency_ms: f64,
    pub response_latency_ms: f64,
    /// Open ports, plain group first.
    pub ports: Vec<u16>,
    pub port_groups: PortGroups,
    pub class: LatencyClass,
    pub pop_code: Option<String>,
}

impl RankedEntry {
    fn from_result(result: &CandidateResult, threshold_ms: f64) -> Option<Self> {
        let best = result.best.as_ref()?;
        let pop_code = result
            .successes
            .iter()
            .find_map(|o| o.evidence.as_ref()?.pop_code.clone());
        Some(Self {
            address: result.candidate.address,
            raw: result.candidate.raw.clone(),
            family: result.candidate.family,
            region: result.region.clone(),
            region_name: regions::display_name(&result.region).to_string(),
            provenance: result.region_source,
            latency_ms: best.total_latency_ms,
            connect_latency_ms: best.connect_latency_ms,
            response_latency_ms: best.response_latency_ms,
            ports: result.port_groups.all().collect(),
            port_groups: result.port_groups.clone(),
            class: LatencyClass::classify(best.total_latency_ms, threshold_ms),
            pop_code,
        })
    }
}

/// Successful results that pass `options`, fastest first, capped per region.
///
/// `threshold_ms` is the configured max latency used for classing.
pub fn rank(results: &[CandidateResult], options: &RankOptions, threshold_ms: f64) -> Vec<RankedEntry> {
    let mut entries: Vec<RankedEntry> = results
        .iter()
        .filter(|r| r.status.is_success())
        .filter_map(|r| {
            let entry = RankedEntry::from_result(r, threshold_ms)?;
            options.keeps(r, entry.latency_ms).then_some(entry)
        })
        .collect();

    entries.sort_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms));

    if let Some(cap) = options.region_cap {
        let mut per_region: HashMap<String, usize> = HashMap::new();
        entries.retain(|e| {
            let n = per_region.entry(e.region.clone()).or_insert(0);
            *n += 1;
            *n <= cap
        });
    }
    entries
}

/// Group ranked entries by region, regions ordered by their fastest entry.
pub fn group_by_region(entries: &[RankedEntry]) -> Vec<(&str, Vec<&RankedEntry>)> {
    let mut groups: Vec<(&str, Vec<&RankedEntry>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for e in entries {
        match index.get(e.region.as_str()) {
            Some(&i) => groups[i].1.push(e),
            None => {
                index.insert(e.region.as_str(), groups.len());
                groups.push((e.region.as_str(), vec![e]));
            }
        }
    }
    groups
}

/// Which port groups to export.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSelection {
    pub plain: bool,
    pub secure: bool,
}

impl Default for PortSelection {
    fn default() -> Self {
        Self { plain: true, secure: true }
    }
}

impl PortSelection {
    pub fn ports<'a>(&self, groups: &'a PortGroups) -> impl Iterator<Item = u16> + 'a {
        let plain: &'a [u16] = if self.plain { &groups.plain } else { &[] };
        let secure: &'a [u16] = if self.secure { &groups.secure } else { &[] };
        plain.iter().chain(secure).copied()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub address: IpAddr,
    pub port: u16,
    pub region: String,
    pub latency_ms: f64,
}

impl ExportRow {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

fn entry_rows(e: &RankedEntry, selection: PortSelection) -> impl Iterator<Item = ExportRow> + '_ {
    selection.ports(&e.port_groups).map(move |port| ExportRow {
        address: e.address,
        port,
        region: e.region.clone(),
        latency_ms: e.latency_ms,
    })
}

/// One row per (entry, open port in the selected groups), in ranked order.
pub fn export_rows(entries: &[RankedEntry], selection: PortSelection) -> Vec<ExportRow> {
    entries.iter().flat_map(|e| entry_rows(e, selection)).collect()
}

/// Plain-text export: a comment header, then `address:port#region` lines grouped
/// by region.
pub fn render_export(
    entries: &[RankedEntry],
    selection: PortSelection,
    generated_at: &str,
    threshold_ms: f64,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# generated {generated_at}");
    let _ = writeln!(out, "# latency threshold {threshold_ms:.0} ms");
    for (region, group) in group_by_region(entries) {
        let rows: Vec<ExportRow> = group.into_iter().flat_map(|e| entry_rows(e, selection)).collect();
        if rows.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n# {} ({region})", regions::display_name(region));
        for row in rows {
            let _ = writeln!(out, "{}#{}", row.endpoint(), row.region);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortTable;
    use crate::types::{Candidate, LatencySplit, PortProbeOutcome, ProbeStrategy};

    fn result(raw: &str, region: &str, ports: &[(u16, f64)]) -> CandidateResult {
        let address: IpAddr = raw.split('/').next().unwrap().parse().unwrap();
        let candidate = Candidate {
            raw: raw.into(),
            address,
            family: AddressFamily::of(&address),
        };
        let outcomes = ports
            .iter()
            .map(|&(p, ms)| {
                PortProbeOutcome::success(p, LatencySplit::estimated(ms), ProbeStrategy::Trace, None)
            })
            .collect();
        let mut r = CandidateResult::from_outcomes(candidate, outcomes, &PortTable::cdn_default());
        r.region = region.into();
        r.region_source = Provenance::PopCode;
        r
    }

    #[test]
    fn classes_follow_threshold_share() {
        assert_eq!(LatencyClass::classify(40.0, 200.0), LatencyClass::Excellent);
        assert_eq!(LatencyClass::classify(100.0, 200.0), LatencyClass::Good);
        assert_eq!(LatencyClass::classify(180.0, 200.0), LatencyClass::Average);
        assert_eq!(LatencyClass::classify(200.0, 200.0), LatencyClass::Poor);
        assert_eq!(LatencyClass::classify(f64::INFINITY, 200.0), LatencyClass::Poor);
    }

    #[test]
    fn continent_filter_drops_unknown_regions() {
        let results = vec![
            result("192.0.2.0/24", "jp", &[(443, 30.0)]),
            result("198.51.100.0/24", "unknown", &[(443, 20.0)]),
            result("203.0.113.0/24", "de", &[(443, 10.0)]),
        ];
        let opts = RankOptions { continents: vec![Continent::Asia], ..Default::default() };
        let ranked = rank(&results, &opts, 200.0);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].region, "jp");
    }

    #[test]
    fn export_respects_port_selection() {
        let results = vec![result("192.0.2.0/24", "us", &[(80, 30.0), (443, 35.0)])];
        let ranked = rank(&results, &RankOptions::default(), 200.0);
        let secure_only = PortSelection { plain: false, secure: true };
        let rows = export_rows(&ranked, secure_only);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].endpoint().to_string(), "192.0.2.0:443");
        assert_eq!(export_rows(&ranked, PortSelection::default()).len(), 2);
    }

    #[test]
    fn text_export_groups_by_region() {
        let results = vec![
            result("192.0.2.0/24", "us", &[(443, 30.0)]),
            result("2001:db8::/32", "jp", &[(2053, 20.0)]),
            result("198.51.100.0/24", "us", &[(80, 50.0)]),
        ];
        let ranked = rank(&results, &RankOptions::default(), 200.0);
        let text = render_export(&ranked, PortSelection::default(), "2026-01-01T00:00:00Z", 200.0);
        let lines: Vec<&str> = text.lines().filter(|l| !l.is_empty() && !l.starts_with('#')).collect();
        assert_eq!(
            lines,
            vec!["[2001:db8::]:2053#jp", "192.0.2.0:443#us", "198.51.100.0:80#us"]
        );
        assert!(text.starts_with("# generated 2026-01-01T00:00:00Z\n# latency threshold 200 ms\n"));
    }
}
