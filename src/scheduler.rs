use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Discipline, RunConfig};
use crate::error::RunError;
use crate::geo::{GeoCache, IpApiLocator};
use crate::prober::{Prober, TcpProber};
use crate::resolver::RegionResolver;
use crate::types::{Candidate, CandidateResult, ProbeTask, Progress, ScanReport};

/// Process-wide run bookkeeping. Clones share the same counters.
///
/// Only one run can hold it at a time; `begin` hands out a `RunGuard` that
/// releases it on drop, including when the run future is dropped mid-way.
#[derive(Clone, Debug, Default)]
pub struct RunState {
    inner: Arc<RunStateInner>,
}

#[derive(Debug, Default)]
struct RunStateInner {
    running: AtomicBool,
    completed: AtomicU64,
    failures: AtomicU64,
    total: AtomicU64,
    cancel: Mutex<CancellationToken>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the state for a new run of `total` candidates and reset the counters.
    pub fn begin(&self, total: u64) -> Result<RunGuard, RunError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RunError::AlreadyRunning);
        }
        self.inner.completed.store(0, Ordering::Release);
        self.inner.failures.store(0, Ordering::Release);
        self.inner.total.store(total, Ordering::Release);
        let token = CancellationToken::new();
        *self.lock_token() = token.clone();
        Ok(RunGuard {
            state: self.clone(),
            token,
        })
    }

    /// Stop admitting candidates; in-flight ones still finish.
    pub fn cancel(&self) {
        self.lock_token().cancel();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock_token().is_cancelled()
    }

    /// Counter snapshot. `failures` never exceeds `completed`, even mid-run.
    pub fn progress(&self) -> Progress {
        // read in the reverse order of `RunGuard::record`
        let failures = self.inner.failures.load(Ordering::Acquire);
        let completed = self.inner.completed.load(Ordering::Acquire);
        Progress {
            completed,
            total: self.inner.total.load(Ordering::Acquire),
            failures,
        }
    }

    fn lock_token(&self) -> MutexGuard<'_, CancellationToken> {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held for the lifetime of one run.
#[derive(Debug)]
pub struct RunGuard {
    state: RunState,
    token: CancellationToken,
}

impl RunGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn record(&self, success: bool) {
        self.state.inner.completed.fetch_add(1, Ordering::AcqRel);
        if !success {
            self.state.inner.failures.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.inner.running.store(false, Ordering::Release);
    }
}

/// Probe every enabled port of one candidate, in probe order, then resolve its region.
pub async fn probe_candidate<P: Prober + ?Sized>(
    prober: &P,
    resolver: &RegionResolver,
    config: &RunConfig,
    candidate: Candidate,
) -> CandidateResult {
    let table = &config.port_table;
    let mut outcomes = Vec::with_capacity(config.ports.len());
    for port in table.probe_order(&config.ports) {
        let task = ProbeTask::new(&candidate, port, table.protocol_of(port));
        outcomes.push(prober.probe(&task).await);
    }
    let mut result = CandidateResult::from_outcomes(candidate, outcomes, table);
    let resolution = resolver.resolve(&result).await;
    result.region = resolution.region;
    result.region_source = resolution.provenance;
    result
}

/// Drives candidates through a `Prober` under the configured discipline.
pub struct Scheduler<P: Prober> {
    prober: Arc<P>,
    resolver: Arc<RegionResolver>,
    config: Arc<RunConfig>,
}

impl Scheduler<TcpProber> {
    /// Real sockets, the standard resolver chain, and ipapi.co when geolocation is on.
    pub fn from_config(config: RunConfig) -> Result<Self> {
        let prober = TcpProber::new(&config).context("failed to initialise prober")?;
        let geo = if config.geo_lookup {
            let locator = IpApiLocator::new(config.timeout)
                .context("failed to initialise geolocation client")?;
            Some(Arc::new(GeoCache::new(Arc::new(locator))))
        } else {
            None
        };
        let resolver = RegionResolver::standard(config.max_latency_ms, geo);
        Ok(Self::new(prober, resolver, config))
    }
}

impl<P: Prober> Scheduler<P> {
    pub fn new(prober: P, resolver: RegionResolver, config: RunConfig) -> Self {
        Self {
            prober: Arc::new(prober),
            resolver: Arc::new(resolver),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run(&self, candidates: Vec<Candidate>, state: &RunState) -> Result<ScanReport, RunError> {
        self.run_with_sink(candidates, state, None).await
    }

    /// Run to completion or cancellation. Each finished candidate is also sent to
    /// `sink` as soon as it settles.
    pub async fn run_with_sink(
        &self,
        candidates: Vec<Candidate>,
        state: &RunState,
        sink: Option<UnboundedSender<CandidateResult>>,
    ) -> Result<ScanReport, RunError> {
        self.check(&candidates)?;
        let guard = state.begin(candidates.len() as u64)?;
        self.run_claimed(candidates, &guard, sink).await
    }

    /// Run under a guard the caller already obtained from `RunState::begin`.
    /// The state stays claimed until the caller drops the guard.
    pub async fn run_claimed(
        &self,
        candidates: Vec<Candidate>,
        guard: &RunGuard,
        sink: Option<UnboundedSender<CandidateResult>>,
    ) -> Result<ScanReport, RunError> {
        self.check(&candidates)?;
        let started_at = now_rfc3339();
        let clock = Instant::now();
        info!(
            candidates = candidates.len(),
            ports = self.config.ports.len(),
            concurrency = self.config.concurrency,
            discipline = ?self.config.discipline,
            "scan started"
        );

        let results = match self.config.discipline {
            Discipline::Streaming => self.run_streaming(candidates, guard, sink.as_ref()).await,
            Discipline::Batched { delay } => {
                self.run_batched(candidates, delay, guard, sink.as_ref()).await
            }
        };

        let cancelled = guard.token().is_cancelled();
        let progress = guard.state.progress();

        let report = ScanReport {
            started_at,
            finished_at: now_rfc3339(),
            duration_ms: clock.elapsed().as_millis() as u64,
            cancelled,
            progress,
            results,
        };
        info!(
            completed = progress.completed,
            total = progress.total,
            failures = progress.failures,
            cancelled,
            duration_ms = report.duration_ms,
            "scan finished"
        );
        Ok(report)
    }

    fn check(&self, candidates: &[Candidate]) -> Result<(), RunError> {
        if candidates.is_empty() {
            return Err(RunError::EmptyPool);
        }
        if self.config.ports.is_empty() {
            return Err(RunError::NoPorts);
        }
        Ok(())
    }

    /// Keep `concurrency` candidates in flight, admitting the next one as soon as
    /// any finishes.
    async fn run_streaming(
        &self,
        candidates: Vec<Candidate>,
        guard: &RunGuard,
        sink: Option<&UnboundedSender<CandidateResult>>,
    ) -> Vec<CandidateResult> {
        let limit = self.config.concurrency.max(1);
        let mut results = Vec::with_capacity(candidates.len());
        let mut pending = candidates.into_iter();
        let mut set = JoinSet::new();

        loop {
            while set.len() < limit && !guard.token().is_cancelled() {
                match pending.next() {
                    Some(c) => self.spawn_candidate(&mut set, c),
                    None => break,
                }
            }
            match set.join_next().await {
                Some(joined) => self.settle(joined, guard, sink, &mut results),
                None => break,
            }
        }
        results
    }

    /// Run fixed-size batches to completion with a pause in between.
    async fn run_batched(
        &self,
        candidates: Vec<Candidate>,
        delay: std::time::Duration,
        guard: &RunGuard,
        sink: Option<&UnboundedSender<CandidateResult>>,
    ) -> Vec<CandidateResult> {
        let limit = self.config.concurrency.max(1);
        let token = guard.token().clone();
        let mut results = Vec::with_capacity(candidates.len());
        let mut pending = candidates.into_iter().peekable();
        let mut first = true;

        while pending.peek().is_some() && !token.is_cancelled() {
            if !first {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = time::sleep(delay) => {}
                }
            }
            first = false;

            let mut set = JoinSet::new();
            for _ in 0..limit {
                if token.is_cancelled() {
                    break;
                }
                match pending.next() {
                    Some(c) => self.spawn_candidate(&mut set, c),
                    None => break,
                }
            }
            debug!(size = set.len(), "batch dispatched");
            while let Some(joined) = set.join_next().await {
                self.settle(joined, guard, sink, &mut results);
            }
        }
        results
    }

    fn spawn_candidate(&self, set: &mut JoinSet<CandidateResult>, candidate: Candidate) {
        let prober = self.prober.clone();
        let resolver = self.resolver.clone();
        let config = self.config.clone();
        set.spawn(async move {
            let fallback = candidate.clone();
            // inner task so a panic still maps back to its candidate
            let work = tokio::spawn(async move {
                probe_candidate(prober.as_ref(), &resolver, &config, candidate).await
            });
            match work.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(candidate = %fallback.raw, "candidate task failed: {e}");
                    CandidateResult::failed(fallback)
                }
            }
        });
    }

    fn settle(
        &self,
        joined: Result<CandidateResult, tokio::task::JoinError>,
        guard: &RunGuard,
        sink: Option<&UnboundedSender<CandidateResult>>,
        results: &mut Vec<CandidateResult>,
    ) {
        let result = match joined {
            Ok(r) => r,
            Err(e) => {
                warn!("candidate task lost: {e}");
                guard.record(false);
                return;
            }
        };
        guard.record(result.status.is_success());
        debug!(
            candidate = %result.candidate.raw,
            status = ?result.status,
            latency_ms = result.best_latency_ms(),
            region = %result.region,
            "candidate settled"
        );
        if let Some(tx) = sink {
            let _ = tx.send(result.clone());
        }
        results.push(result);
    }
}

pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_until_guard_drops() {
        let state = RunState::new();
        let guard = state.begin(3).unwrap();
        assert!(state.is_running());
        assert!(matches!(state.begin(1), Err(RunError::AlreadyRunning)));
        drop(guard);
        assert!(!state.is_running());
        assert!(state.begin(1).is_ok());
    }

    #[test]
    fn begin_resets_counters_and_token() {
        let state = RunState::new();
        {
            let guard = state.begin(2).unwrap();
            guard.record(true);
            guard.record(false);
            state.cancel();
            assert!(guard.token().is_cancelled());
        }
        assert_eq!(state.progress(), Progress { completed: 2, total: 2, failures: 1 });

        let guard = state.begin(5).unwrap();
        assert!(!guard.token().is_cancelled());
        assert_eq!(state.progress(), Progress { completed: 0, total: 5, failures: 0 });
    }

    #[test]
    fn failures_never_overtake_completed() {
        let state = RunState::new();
        let guard = state.begin(20_000).unwrap();
        let reader = state.clone();
        let watcher = std::thread::spawn(move || {
            for _ in 0..20_000 {
                let p = reader.progress();
                assert!(p.failures <= p.completed, "{p:?}");
            }
        });
        for _ in 0..20_000 {
            guard.record(false);
        }
        watcher.join().unwrap();
        assert_eq!(state.progress().failures, 20_000);
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let ts = now_rfc3339();
        assert!(OffsetDateTime::parse(&ts, &well_known::Rfc3339).is_ok());
    }
}
