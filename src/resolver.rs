//! Region resolution as an ordered chain of sources; the first answer wins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::geo::GeoCache;
use crate::regions;
use crate::types::{CandidateResult, PortProbeOutcome, Provenance, UNKNOWN_REGION};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub region: String,
    pub provenance: Provenance,
}

impl Resolution {
    pub fn new(region: impl Into<String>, provenance: Provenance) -> Self {
        Self { region: region.into(), provenance }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_REGION, Provenance::Unknown)
    }
}

/// What a source gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionInput<'a> {
    pub address: IpAddr,
    /// Successful outcomes, lowest latency first.
    pub successes: &'a [PortProbeOutcome],
}

impl<'a> ResolutionInput<'a> {
    pub fn from_result(result: &'a CandidateResult) -> Self {
        Self {
            address: result.candidate.address,
            successes: &result.successes,
        }
    }

    pub fn best_latency_ms(&self) -> Option<f64> {
        self.successes.first().map(|o| o.total_latency_ms)
    }
}

#[async_trait]
pub trait RegionSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn resolve(&self, input: &ResolutionInput<'_>) -> Option<Resolution>;
}

/// Tier 1: `colo=` code through the static PoP table.
#[derive(Debug, Default, Clone, Copy)]
pub struct PopCodeSource;

#[async_trait]
impl RegionSource for PopCodeSource {
    fn name(&self) -> &'static str {
        "pop_code"
    }

    async fn resolve(&self, input: &ResolutionInput<'_>) -> Option<Resolution> {
        input
            .successes
            .iter()
            .filter_map(|o| o.evidence.as_ref()?.pop_code.as_deref())
            .find_map(regions::region_for_pop)
            .map(|region| Resolution::new(region, Provenance::PopCode))
    }
}

/// Tier 2: `loc=` code used as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocationCodeSource;

#[async_trait]
impl RegionSource for LocationCodeSource {
    fn name(&self) -> &'static str {
        "location_code"
    }

    async fn resolve(&self, input: &ResolutionInput<'_>) -> Option<Resolution> {
        input
            .successes
            .iter()
            .find_map(|o| o.evidence.as_ref()?.location_code.as_deref())
            .map(|loc| Resolution::new(regions::normalize_id(loc), Provenance::LocationCode))
    }
}

/// Tier 3: external geolocation, consulted only for candidates that answered.
#[derive(Debug, Clone)]
pub struct GeoLookupSource {
    cache: Arc<GeoCache>,
}

impl GeoLookupSource {
    pub fn new(cache: Arc<GeoCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl RegionSource for GeoLookupSource {
    fn name(&self) -> &'static str {
        "geo_lookup"
    }

    async fn resolve(&self, input: &ResolutionInput<'_>) -> Option<Resolution> {
        if input.successes.is_empty() {
            return None;
        }
        self.cache
            .lookup(input.address)
            .await
            .map(|code| Resolution::new(regions::normalize_id(&code), Provenance::GeoLookup))
    }
}

/// Tier 4: latency ladder guess. Tagged so it is never mistaken for evidence.
#[derive(Debug, Clone, Copy)]
pub struct LatencyLadderSource {
    max_latency_ms: f64,
}

impl LatencyLadderSource {
    pub fn new(max_latency_ms: u64) -> Self {
        Self { max_latency_ms: max_latency_ms as f64 }
    }
}

#[async_trait]
impl RegionSource for LatencyLadderSource {
    fn name(&self) -> &'static str {
        "latency_ladder"
    }

    async fn resolve(&self, input: &ResolutionInput<'_>) -> Option<Resolution> {
        let latency = input.best_latency_ms()?;
        regions::ladder_region(latency, self.max_latency_ms)
            .map(|region| Resolution::new(region, Provenance::LatencyHeuristic))
    }
}

pub struct RegionResolver {
    sources: Vec<Box<dyn RegionSource>>,
}

impl RegionResolver {
    pub fn new(sources: Vec<Box<dyn RegionSource>>) -> Self {
        Self { sources }
    }

    /// PoP code, location code, geolocation (when a cache is given), latency ladder.
    pub fn standard(max_latency_ms: u64, geo: Option<Arc<GeoCache>>) -> Self {
        let mut sources: Vec<Box<dyn RegionSource>> =
            vec![Box::new(PopCodeSource), Box::new(LocationCodeSource)];
        if let Some(cache) = geo {
            sources.push(Box::new(GeoLookupSource::new(cache)));
        }
        sources.push(Box::new(LatencyLadderSource::new(max_latency_ms)));
        Self::new(sources)
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub async fn resolve(&self, result: &CandidateResult) -> Resolution {
        if !result.status.is_success() {
            return Resolution::unknown();
        }
        let input = ResolutionInput::from_result(result);
        for source in &self.sources {
            if let Some(resolution) = source.resolve(&input).await {
                debug!(
                    address = %input.address,
                    source = source.name(),
                    region = %resolution.region,
                    "region resolved"
                );
                return resolution;
            }
        }
        Resolution::unknown()
    }
}

impl std::fmt::Debug for RegionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionResolver")
            .field("sources", &self.source_names())
            .finish()
    }
}
