use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::candidates::Sampling;
use crate::error::RunError;
use crate::ports::{self, PortTable};
use crate::regions;
use crate::types::AddressFamily;

pub const DEFAULT_MAX_LATENCY_MS: u64 = 200;
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_BATCH_DELAY_MS: u64 = 1_000;
pub const DEFAULT_PLAUSIBILITY_FLOOR_MS: f64 = 5.0;
/// Ceiling of the plausibility window, as a multiple of the max latency.
pub const PLAUSIBILITY_CEILING_FACTOR: f64 = 2.0;
pub const QUICK_REGION_CAP: usize = 5;

pub const DEFAULT_CONFIG_FILE: &str = "edge-scan.yaml";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Keep a handful of the best candidates per region.
    Quick,
    /// Keep every successful candidate.
    #[default]
    Full,
}

impl ScanMode {
    pub fn default_region_cap(self) -> Option<usize> {
        match self {
            ScanMode::Quick => Some(QUICK_REGION_CAP),
            ScanMode::Full => None,
        }
    }
}

/// How the scheduler admits candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discipline {
    /// Keep exactly `concurrency` candidates in flight, refilling on each completion.
    #[default]
    Streaming,
    /// Run `concurrency`-sized batches to completion, pausing `delay` between them.
    Batched { delay: Duration },
}

/// Latency band in which a measured round trip is trusted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlausibilityWindow {
    pub floor_ms: f64,
    pub ceiling_ms: f64,
}

impl PlausibilityWindow {
    pub fn new(floor_ms: f64, max_latency_ms: u64) -> Self {
        Self {
            floor_ms,
            ceiling_ms: max_latency_ms as f64 * PLAUSIBILITY_CEILING_FACTOR,
        }
    }

    /// A completed exchange only has to clear the floor.
    pub fn accepts_completed(&self, ms: f64) -> bool {
        ms >= self.floor_ms
    }

    /// A transport error counts as a disguised success only inside the band.
    pub fn accepts_disguised(&self, ms: f64) -> bool {
        ms >= self.floor_ms && ms <= self.ceiling_ms
    }
}

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_latency_ms: u64,
    pub max_candidates: Option<usize>,
    pub sampling: Sampling,
    pub concurrency: usize,
    pub timeout: Duration,
    pub retry_timeout: Duration,
    /// Enabled ports in configured order.
    pub ports: Vec<u16>,
    pub port_table: PortTable,
    pub families: Vec<AddressFamily>,
    /// Region filter applied at ranking time; empty keeps every region.
    pub regions: Vec<String>,
    pub discipline: Discipline,
    pub geo_lookup: bool,
    /// Host for SNI and the `Host` header; the bare address is used when unset.
    pub trace_host: Option<String>,
    pub mode: ScanMode,
    pub region_cap: Option<usize>,
    pub plausibility_floor_ms: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            max_candidates: None,
            sampling: Sampling::Ordered,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry_timeout: Duration::from_millis(DEFAULT_RETRY_TIMEOUT_MS),
            ports: ports::default_enabled_ports(),
            port_table: PortTable::cdn_default(),
            families: AddressFamily::all(),
            regions: Vec::new(),
            discipline: Discipline::Streaming,
            geo_lookup: false,
            trace_host: None,
            mode: ScanMode::Full,
            region_cap: None,
            plausibility_floor_ms: DEFAULT_PLAUSIBILITY_FLOOR_MS,
        }
    }
}

impl RunConfig {
    pub fn window(&self) -> PlausibilityWindow {
        PlausibilityWindow::new(self.plausibility_floor_ms, self.max_latency_ms)
    }

    /// Per-region cap for ranking: explicit value, else the mode default.
    pub fn effective_region_cap(&self) -> Option<usize> {
        self.region_cap.or(self.mode.default_region_cap())
    }

    /// Check ranges and normalize lists. Empty port and family lists fall back to
    /// 80/443 and both families.
    pub fn validated(mut self) -> Result<Self, RunError> {
        if self.concurrency == 0 {
            return Err(RunError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.timeout.is_zero() || self.retry_timeout.is_zero() {
            return Err(RunError::InvalidConfig("timeouts must be greater than zero".into()));
        }
        if self.max_latency_ms == 0 {
            return Err(RunError::InvalidConfig("max latency must be greater than zero".into()));
        }
        if self.plausibility_floor_ms < 0.0 {
            return Err(RunError::InvalidConfig("plausibility floor cannot be negative".into()));
        }
        if self.region_cap == Some(0) {
            return Err(RunError::InvalidConfig("per-region cap must be at least 1".into()));
        }
        if self.ports.is_empty() {
            self.ports = ports::FALLBACK_PORTS.to_vec();
        }
        if self.families.is_empty() {
            self.families = AddressFamily::all();
        }
        self.families.sort();
        self.families.dedup();
        for r in self.regions.iter_mut() {
            *r = regions::normalize_id(r);
        }
        self.regions.retain(|r| !r.is_empty());
        Ok(self)
    }
}

/// Optional YAML layer; every field overrides the built-in default and is itself
/// overridden by an explicit CLI flag.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub ipv4_list: Option<PathBuf>,
    pub ipv6_list: Option<PathBuf>,
    pub max_latency_ms: Option<u64>,
    pub max_candidates: Option<usize>,
    pub shuffle: Option<bool>,
    pub seed: Option<u64>,
    pub concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub retry_timeout_ms: Option<u64>,
    pub ports: Option<String>,
    pub secure_ports: Option<String>,
    pub families: Option<Vec<AddressFamily>>,
    pub regions: Option<Vec<String>>,
    pub batched: Option<bool>,
    pub batch_delay_ms: Option<u64>,
    pub geo_lookup: Option<bool>,
    pub trace_host: Option<String>,
    pub mode: Option<ScanMode>,
    pub top_k: Option<usize>,
}

/// Load the YAML config at `path`, or `edge-scan.yaml` from the working directory
/// when no path is given and that file exists.
pub fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() {
                p.to_path_buf()
            } else {
                return Ok(None);
            }
        }
    };
    let s = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(Some(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_band() {
        let w = PlausibilityWindow::new(5.0, 200);
        assert!(!w.accepts_completed(3.0));
        assert!(w.accepts_completed(12_000.0));
        assert!(w.accepts_disguised(5.0));
        assert!(w.accepts_disguised(400.0));
        assert!(!w.accepts_disguised(400.5));
        assert!(!w.accepts_disguised(4.9));
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let cfg = RunConfig { concurrency: 0, ..RunConfig::default() };
        assert!(matches!(cfg.validated(), Err(RunError::InvalidConfig(_))));
    }

    #[test]
    fn validation_fills_empty_lists() {
        let cfg = RunConfig {
            ports: Vec::new(),
            families: Vec::new(),
            regions: vec![" US ".into(), "".into(), "GB".into()],
            ..RunConfig::default()
        }
        .validated()
        .unwrap();
        assert_eq!(cfg.ports, vec![80, 443]);
        assert_eq!(cfg.families, AddressFamily::all());
        assert_eq!(cfg.regions, vec!["us".to_string(), "uk".to_string()]);
    }

    #[test]
    fn quick_mode_caps_regions() {
        let cfg = RunConfig { mode: ScanMode::Quick, ..RunConfig::default() };
        assert_eq!(cfg.effective_region_cap(), Some(QUICK_REGION_CAP));
        let cfg = RunConfig { region_cap: Some(2), ..cfg };
        assert_eq!(cfg.effective_region_cap(), Some(2));
        assert_eq!(RunConfig::default().effective_region_cap(), None);
    }

    #[test]
    fn yaml_config_parses() {
        let yaml = r#"
max_latency_ms: 300
concurrency: 5
ports: "80,443,2053"
families: [v4]
regions: [us, hk]
batched: true
mode: quick
"#;
        let cfg: FileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.max_latency_ms, Some(300));
        assert_eq!(cfg.families, Some(vec![AddressFamily::V4]));
        assert_eq!(cfg.mode, Some(ScanMode::Quick));
        assert_eq!(cfg.batched, Some(true));
    }
}
