use anyhow::{anyhow, Result};
use ipnet::IpNet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::RunError;
use crate::types::{AddressFamily, Candidate};

/// Parse one pool entry (`203.0.113.0/24`, `2606:4700::/32` or a bare address).
///
/// The probed address is the address part of the prefix as written.
pub fn parse_candidate(entry: &str) -> Result<Candidate> {
    let raw = entry.trim();
    if raw.is_empty() {
        return Err(anyhow!("empty entry"));
    }
    let address: IpAddr = if raw.contains('/') {
        raw.parse::<IpNet>()
            .map_err(|e| anyhow!("invalid CIDR {raw}: {e}"))?
            .addr()
    } else {
        raw.parse::<IpAddr>()
            .map_err(|e| anyhow!("invalid IP {raw}: {e}"))?
    };
    Ok(Candidate {
        raw: raw.to_string(),
        address,
        family: AddressFamily::of(&address),
    })
}

/// How to choose which candidates to test when a cap is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sampling {
    /// Keep pool order.
    #[default]
    Ordered,
    /// Shuffle before capping; a seed makes the sample reproducible.
    Shuffled { seed: Option<u64> },
}

/// Normalized, deduplicated candidate list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidatePool {
    candidates: Vec<Candidate>,
}

impl CandidatePool {
    /// Build a pool from newline-delimited lists. Blank lines and `#` comments are
    /// skipped, unparsable lines are logged and dropped, duplicates keep their first
    /// occurrence.
    pub fn from_lists<'a>(lists: impl IntoIterator<Item = &'a str>) -> Self {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for list in lists {
            for line in list.lines() {
                let entry = line.split('#').next().map(str::trim).unwrap_or("");
                if entry.is_empty() {
                    continue;
                }
                match parse_candidate(entry) {
                    Ok(c) => {
                        if seen.insert(c.raw.clone()) {
                            candidates.push(c);
                        }
                    }
                    Err(e) => warn!("skipping pool entry: {e}"),
                }
            }
        }
        Self { candidates }
    }

    /// Read the per-family list files. Any unreadable file is a run-level error.
    pub fn load(paths: &[&Path]) -> Result<Self, RunError> {
        let mut contents = Vec::with_capacity(paths.len());
        for path in paths {
            let text = fs::read_to_string(path).map_err(|source| RunError::PoolLoad {
                path: path.to_path_buf(),
                source,
            })?;
            debug!(path = %path.display(), lines = text.lines().count(), "loaded candidate list");
            contents.push(text);
        }
        Ok(Self::from_lists(contents.iter().map(String::as_str)))
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    pub fn count_family(&self, family: AddressFamily) -> usize {
        self.candidates.iter().filter(|c| c.family == family).count()
    }

    /// Pick the candidates for a run: keep the enabled families, optionally
    /// shuffle, then apply the cap.
    pub fn select(
        &self,
        families: &[AddressFamily],
        max: Option<usize>,
        sampling: Sampling,
    ) -> Result<Vec<Candidate>, RunError> {
        if self.candidates.is_empty() {
            return Err(RunError::EmptyPool);
        }
        let mut picked: Vec<Candidate> = self
            .candidates
            .iter()
            .filter(|c| families.contains(&c.family))
            .cloned()
            .collect();
        if picked.is_empty() {
            return Err(RunError::FilteredOut(families.to_vec()));
        }
        if let Sampling::Shuffled { seed } = sampling {
            let mut rng = match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            };
            picked.shuffle(&mut rng);
        }
        if let Some(max) = max {
            picked.truncate(max.max(1));
        }
        Ok(picked)
    }
}
