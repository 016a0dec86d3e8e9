use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_scan_rs::candidates::{CandidatePool, Sampling};
use edge_scan_rs::config::{self, Discipline, FileConfig, RunConfig, ScanMode};
use edge_scan_rs::ports::{self, PortTable};
use edge_scan_rs::ranker::{self, PortSelection, RankOptions, RankedEntry};
use edge_scan_rs::regions::{self, Continent};
use edge_scan_rs::scheduler::{now_rfc3339, RunState, Scheduler};
use edge_scan_rs::server::{self, AppState};
use edge_scan_rs::types::{AddressFamily, CandidateResult, ScanReport};

/// edge-scan-rs: concurrent CDN edge prober with region inference and ranked export.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "edge-scan-rs",
    version,
    about = "Concurrent CDN edge prober: multi-port latency checks, layered region inference and ranked export.",
    long_about = None
)]
struct Cli {
    /// IPv4 candidate list (one prefix or address per line).
    #[arg(long = "ipv4-list")]
    ipv4_list: Option<PathBuf>,

    /// IPv6 candidate list (one prefix or address per line).
    #[arg(long = "ipv6-list")]
    ipv6_list: Option<PathBuf>,

    /// YAML config file. `edge-scan.yaml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Latency threshold in milliseconds.
    #[arg(long = "max-latency-ms")]
    max_latency_ms: Option<u64>,

    /// Test at most this many candidates.
    #[arg(long = "max-candidates")]
    max_candidates: Option<usize>,

    /// Shuffle the pool before applying --max-candidates.
    #[arg(long, default_value_t = false)]
    shuffle: bool,

    /// Seed for --shuffle (implies it).
    #[arg(long)]
    seed: Option<u64>,

    /// Candidates probed at the same time.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Trace probe timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Fallback connect probe timeout in milliseconds.
    #[arg(long = "retry-timeout-ms")]
    retry_timeout_ms: Option<u64>,

    /// Enabled ports, e.g. "80,443,2052-2053". Defaults to every CDN port.
    #[arg(long)]
    ports: Option<String>,

    /// Ports that speak TLS. Defaults to 443, 2053, 2083, 2087, 2096, 8443.
    #[arg(long = "secure-ports")]
    secure_ports: Option<String>,

    /// Address family to test (ipv4 / ipv6). Repeatable; defaults to both.
    #[arg(long = "family")]
    families: Vec<AddressFamily>,

    /// Keep only these regions (e.g. us, hk). Repeatable.
    #[arg(long = "region")]
    regions: Vec<String>,

    /// Keep only regions on these continents (e.g. europe, north-america). Repeatable.
    #[arg(long = "continent")]
    continents: Vec<Continent>,

    /// Drop results slower than this many milliseconds.
    #[arg(long = "latency-ceiling-ms")]
    latency_ceiling_ms: Option<f64>,

    /// quick keeps the 5 best per region, full keeps everything.
    #[arg(long, value_enum)]
    mode: Option<ScanMode>,

    /// Keep at most this many results per region (overrides --mode).
    #[arg(long = "top-k")]
    top_k: Option<usize>,

    /// Probe in fixed batches with a pause in between instead of streaming.
    #[arg(long, default_value_t = false)]
    batched: bool,

    /// Pause between batches in milliseconds.
    #[arg(long = "batch-delay-ms")]
    batch_delay_ms: Option<u64>,

    /// Ask ipapi.co for the country when an endpoint returns no trace data.
    #[arg(long = "geo-lookup", default_value_t = false)]
    geo_lookup: bool,

    /// Host name for SNI and the Host header of trace requests.
    #[arg(long = "trace-host")]
    trace_host: Option<String>,

    /// Port group(s) written to the text export.
    #[arg(long = "export-ports", value_enum, default_value_t = ExportPorts::Both)]
    export_ports: ExportPorts,

    /// Write the report and ranked results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write `address:port#region` lines grouped by region to this path.
    #[arg(long)]
    export: Option<PathBuf>,

    /// Serve the status API instead of running a single scan.
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Bind address for --serve.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportPorts {
    Plain,
    Secure,
    Both,
}

impl From<ExportPorts> for PortSelection {
    fn from(e: ExportPorts) -> Self {
        match e {
            ExportPorts::Plain => PortSelection { plain: true, secure: false },
            ExportPorts::Secure => PortSelection { plain: false, secure: true },
            ExportPorts::Both => PortSelection::default(),
        }
    }
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    generated_at: String,
    threshold_ms: u64,
    success_rate: f64,
    ranked: &'a [RankedEntry],
    report: &'a ScanReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let file = config::load_file_config(cli.config.as_deref())?.unwrap_or_default();
    let (cfg, lists) = build_config(&cli, &file)?;

    print_config(&cli, &cfg, &lists);
    for r in &cfg.regions {
        if !regions::is_known(r) {
            warn!(region = %r, "region filter is not a known region id");
        }
    }

    let paths: Vec<&Path> = lists.iter().map(PathBuf::as_path).collect();
    let pool = CandidatePool::load(&paths)?;
    info!(
        candidates = pool.len(),
        ipv4 = pool.count_family(AddressFamily::V4),
        ipv6 = pool.count_family(AddressFamily::V6),
        "candidate pool loaded"
    );

    let state = RunState::new();

    if cli.serve {
        let app = AppState::new(cfg, pool, state.clone());
        tokio::select! {
            res = server::spawn_server(&cli.bind, app) => res?,
            _ = tokio::signal::ctrl_c() => {
                state.cancel();
                info!("shutting down");
            }
        }
        return Ok(());
    }

    let candidates = pool.select(&cfg.families, cfg.max_candidates, cfg.sampling)?;
    let scheduler = Scheduler::from_config(cfg.clone())?;

    // Ctrl-C stops admission; in-flight candidates still finish.
    let cancel_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling: waiting for in-flight candidates...");
            cancel_state.cancel();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(rx, state.clone()));
    let report = scheduler.run_with_sink(candidates, &state, Some(tx)).await?;
    let _ = printer.await;

    let options = RankOptions {
        families: cfg.families.clone(),
        regions: cfg.regions.clone(),
        continents: cli.continents.clone(),
        max_latency_ms: cli.latency_ceiling_ms,
        region_cap: cfg.effective_region_cap(),
    };
    let threshold = cfg.max_latency_ms as f64;
    let ranked = ranker::rank(&report.results, &options, threshold);

    print_results_table(&ranked);
    print_summary(&report, ranked.len());

    if let Some(path) = cli.output.as_deref() {
        let doc = JsonOutput {
            generated_at: now_rfc3339(),
            threshold_ms: cfg.max_latency_ms,
            success_rate: report.success_rate(),
            ranked: &ranked,
            report: &report,
        };
        if let Err(e) = write_results_json(path, &doc) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }

    if let Some(path) = cli.export.as_deref() {
        let text = ranker::render_export(&ranked, cli.export_ports.into(), &now_rfc3339(), threshold);
        fs::write(path, text).with_context(|| format!("failed to write export {}", path.display()))?;
        println!("Wrote export to {}", path.display());
    }

    Ok(())
}

/// Merge CLI flags over the YAML layer over built-in defaults.
fn build_config(cli: &Cli, file: &FileConfig) -> Result<(RunConfig, Vec<PathBuf>)> {
    let mut cfg = RunConfig::default();

    let lists: Vec<PathBuf> = [
        cli.ipv4_list.clone().or_else(|| file.ipv4_list.clone()),
        cli.ipv6_list.clone().or_else(|| file.ipv6_list.clone()),
    ]
    .into_iter()
    .flatten()
    .collect();
    if lists.is_empty() {
        bail!("no candidate lists given; pass --ipv4-list and/or --ipv6-list");
    }

    if let Some(v) = cli.max_latency_ms.or(file.max_latency_ms) {
        cfg.max_latency_ms = v;
    }
    cfg.max_candidates = cli.max_candidates.or(file.max_candidates);

    let seed = cli.seed.or(file.seed);
    if cli.shuffle || file.shuffle.unwrap_or(false) || seed.is_some() {
        cfg.sampling = Sampling::Shuffled { seed };
    }

    if let Some(v) = cli.concurrency.or(file.concurrency) {
        cfg.concurrency = v;
    }
    if let Some(v) = cli.timeout_ms.or(file.timeout_ms) {
        cfg.timeout = Duration::from_millis(v);
    }
    if let Some(v) = cli.retry_timeout_ms.or(file.retry_timeout_ms) {
        cfg.retry_timeout = Duration::from_millis(v);
    }

    if let Some(s) = cli.ports.as_deref().or(file.ports.as_deref()) {
        cfg.ports = ports::parse_ports_str(s).context("invalid --ports")?;
    }
    if let Some(s) = cli.secure_ports.as_deref().or(file.secure_ports.as_deref()) {
        let secure = ports::parse_ports_str(s).context("invalid --secure-ports")?;
        cfg.port_table = PortTable::with_secure(secure);
    }

    cfg.families = if !cli.families.is_empty() {
        cli.families.clone()
    } else {
        file.families.clone().unwrap_or_default()
    };
    cfg.regions = if !cli.regions.is_empty() {
        cli.regions.clone()
    } else {
        file.regions.clone().unwrap_or_default()
    };

    if cli.batched || file.batched.unwrap_or(false) {
        let delay = cli
            .batch_delay_ms
            .or(file.batch_delay_ms)
            .unwrap_or(config::DEFAULT_BATCH_DELAY_MS);
        cfg.discipline = Discipline::Batched { delay: Duration::from_millis(delay) };
    }

    cfg.geo_lookup = cli.geo_lookup || file.geo_lookup.unwrap_or(false);
    cfg.trace_host = cli.trace_host.clone().or_else(|| file.trace_host.clone());
    if let Some(m) = cli.mode.or(file.mode) {
        cfg.mode = m;
    }
    cfg.region_cap = cli.top_k.or(file.top_k);

    Ok((cfg.validated()?, lists))
}

fn print_config(cli: &Cli, cfg: &RunConfig, lists: &[PathBuf]) {
    println!("edge-scan-rs configuration:");
    for l in lists {
        println!("  list         : {}", l.display());
    }
    println!("  max_latency  : {} ms", cfg.max_latency_ms);
    println!(
        "  candidates   : {}",
        cfg.max_candidates
            .map(|n| n.to_string())
            .unwrap_or_else(|| "<all>".to_string())
    );
    println!("  concurrency  : {}", cfg.concurrency);
    println!("  timeout_ms   : {}", cfg.timeout.as_millis());
    println!("  retry_ms     : {}", cfg.retry_timeout.as_millis());
    println!("  ports        : {:?}", cfg.port_table.probe_order(&cfg.ports));
    println!(
        "  families     : {}",
        cfg.families.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
    );
    println!(
        "  regions      : {}",
        if cfg.regions.is_empty() { "<all>".to_string() } else { cfg.regions.join(", ") }
    );
    println!("  discipline   : {:?}", cfg.discipline);
    println!("  mode         : {:?}", cfg.mode);
    println!("  geo_lookup   : {}", cfg.geo_lookup);
    println!(
        "  output       : {}",
        cli.output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<CandidateResult>, state: RunState) {
    while let Some(r) = rx.recv().await {
        let p = state.progress();
        let latency = r
            .best_latency_ms()
            .map(|ms| format!("{ms:.0} ms"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "[{:>3}%] {}/{}  {:<20} {:?} {} {}",
            p.percent(),
            p.completed,
            p.total,
            r.candidate.raw,
            r.status,
            latency,
            r.region
        );
    }
}

fn print_results_table(entries: &[RankedEntry]) {
    let port_list = |e: &RankedEntry| {
        e.ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",")
    };
    let mut addr_w = "address".len();
    let mut ports_w = "ports".len();
    let mut region_w = "region".len();
    for e in entries {
        addr_w = addr_w.max(e.address.to_string().len());
        ports_w = ports_w.max(port_list(e).len().min(40));
        region_w = region_w.max(e.region.len());
    }
    let lat_w = "latency_ms".len();
    let src_w = "latency_heuristic".len();
    let class_w = "excellent".len();

    println!("\nRanked endpoints: {}", entries.len());
    println!(
        "{:<addr_w$}  {:>lat_w$}  {:<region_w$}  {:<src_w$}  {:<class_w$}  {:<ports_w$}",
        "address", "latency_ms", "region", "source", "class", "ports",
    );
    println!(
        "{:-<addr_w$}  {:-<lat_w$}  {:-<region_w$}  {:-<src_w$}  {:-<class_w$}  {:-<ports_w$}",
        "", "", "", "", "", "",
    );
    for e in entries {
        let mut ports = port_list(e);
        if ports.len() > 40 {
            ports.truncate(40);
        }
        println!(
            "{:<addr_w$}  {:>lat_w$.1}  {:<region_w$}  {:<src_w$}  {:<class_w$}  {:<ports_w$}",
            e.address.to_string(),
            e.latency_ms,
            e.region,
            e.provenance.label(),
            e.class.label(),
            ports,
        );
    }
}

fn print_summary(report: &ScanReport, ranked: usize) {
    let p = report.progress;
    println!(
        "\nTested {}/{} candidates in {:.1}s: {} succeeded, {} failed ({:.1}% success), {} ranked{}",
        p.completed,
        p.total,
        report.duration_ms as f64 / 1000.0,
        p.successes(),
        p.failures,
        report.success_rate(),
        ranked,
        if report.cancelled { " [cancelled]" } else { "" }
    );
}

fn write_results_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
