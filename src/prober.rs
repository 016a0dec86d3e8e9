//! Per-port measurement.
//!
//! Every port gets the trace probe first: connect (plus TLS on secure ports),
//! `GET /cdn-cgi/trace`, and parse whatever PoP/location fields come back. When
//! that errors or times out the connect probe runs with the shorter retry timeout
//! and only cares whether something answered. All timings then go through the
//! plausibility window before an outcome counts as a success.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_native_tls::TlsConnector;
use tracing::debug;

use crate::config::{PlausibilityWindow, RunConfig};
use crate::ports::Protocol;
use crate::types::{
    duration_ms, LatencySplit, PortProbeOutcome, ProbeStrategy, ProbeTask, TraceEvidence,
};

pub const TRACE_PATH: &str = "/cdn-cgi/trace";

/// Upper bound on how much of a trace reply is read.
pub const TRACE_READ_LIMIT: usize = 16 * 1024;

#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Measure one port. Never fails: problems become a failed outcome.
    async fn probe(&self, task: &ProbeTask) -> PortProbeOutcome;
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("transport error after {elapsed_ms:.1} ms: {source}")]
    Transport {
        elapsed_ms: f64,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake failed after {elapsed_ms:.1} ms: {source}")]
    Tls {
        elapsed_ms: f64,
        #[source]
        source: native_tls::Error,
    },
    #[error("failed to build TLS connector: {0}")]
    Connector(#[from] native_tls::Error),
}

impl ProbeError {
    /// Time spent before the error surfaced, when it was measured.
    pub fn elapsed_ms(&self) -> Option<f64> {
        match self {
            ProbeError::Transport { elapsed_ms, .. } | ProbeError::Tls { elapsed_ms, .. } => {
                Some(*elapsed_ms)
            }
            ProbeError::Timeout(_) | ProbeError::Connector(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout(_))
    }
}

/// A trace exchange that ran to completion.
#[derive(Debug, Clone)]
struct TraceReply {
    latency: LatencySplit,
    evidence: Option<TraceEvidence>,
}

/// The real prober: raw HTTP/1.1 over tokio sockets, TLS via native-tls.
#[derive(Clone)]
pub struct TcpProber {
    timeout: Duration,
    retry_timeout: Duration,
    window: PlausibilityWindow,
    trace_host: Option<String>,
    tls: TlsConnector,
}

impl TcpProber {
    pub fn new(config: &RunConfig) -> Result<Self, ProbeError> {
        // Edge certificates never match a bare address; only reachability matters.
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .use_sni(config.trace_host.is_some())
            .build()?;
        Ok(Self {
            timeout: config.timeout,
            retry_timeout: config.retry_timeout,
            window: config.window(),
            trace_host: config.trace_host.clone(),
            tls: TlsConnector::from(connector),
        })
    }

    fn host_header(&self, target: SocketAddr) -> String {
        match &self.trace_host {
            Some(h) => h.clone(),
            None if target.is_ipv6() => format!("[{}]", target.ip()),
            None => target.ip().to_string(),
        }
    }

    fn tls_domain(&self, target: SocketAddr) -> String {
        self.trace_host
            .clone()
            .unwrap_or_else(|| target.ip().to_string())
    }

    async fn trace(&self, task: &ProbeTask) -> Result<TraceReply, ProbeError> {
        match time::timeout(self.timeout, self.trace_exchange(task)).await {
            Ok(res) => res,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }

    async fn trace_exchange(&self, task: &ProbeTask) -> Result<TraceReply, ProbeError> {
        let start = Instant::now();
        let transport = |source: io::Error| ProbeError::Transport {
            elapsed_ms: duration_ms(start.elapsed()),
            source,
        };
        let request = format!(
            "GET {TRACE_PATH} HTTP/1.1\r\nHost: {}\r\nUser-Agent: edge-scan-rs\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            self.host_header(task.target)
        );

        let stream = TcpStream::connect(task.target).await.map_err(transport)?;
        let _ = stream.set_nodelay(true);

        let (connected, reply) = match task.protocol {
            Protocol::Http => {
                let mut stream = stream;
                let connected = start.elapsed();
                let reply = exchange(&mut stream, request.as_bytes()).await;
                (connected, reply)
            }
            Protocol::Https => {
                let mut stream = self
                    .tls
                    .connect(&self.tls_domain(task.target), stream)
                    .await
                    .map_err(|source| ProbeError::Tls {
                        elapsed_ms: duration_ms(start.elapsed()),
                        source,
                    })?;
                let connected = start.elapsed();
                let reply = exchange(&mut stream, request.as_bytes()).await;
                (connected, reply)
            }
        };
        let raw = reply.map_err(transport)?;
        let total = start.elapsed();

        Ok(TraceReply {
            latency: LatencySplit::measured(connected, total),
            evidence: TraceEvidence::parse(&response_body(&raw)),
        })
    }

    /// Fallback reachability check. Plain ports get a `HEAD /` and any first byte
    /// (or a clean close) counts; secure ports only need the TCP connect.
    async fn connect_probe(&self, task: &ProbeTask) -> Result<f64, ProbeError> {
        let fut = async {
            let start = Instant::now();
            let transport = |source: io::Error| ProbeError::Transport {
                elapsed_ms: duration_ms(start.elapsed()),
                source,
            };
            let mut stream = TcpStream::connect(task.target).await.map_err(transport)?;
            if task.protocol == Protocol::Http {
                let request = format!(
                    "HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                    self.host_header(task.target)
                );
                stream.write_all(request.as_bytes()).await.map_err(transport)?;
                let mut first = [0u8; 1];
                stream.read(&mut first).await.map_err(transport)?;
            }
            Ok::<f64, ProbeError>(duration_ms(start.elapsed()))
        };
        match time::timeout(self.retry_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ProbeError::Timeout(self.retry_timeout)),
        }
    }

    async fn fallback(&self, task: &ProbeTask, first: &ProbeError) -> PortProbeOutcome {
        let port = task.port();
        match self.connect_probe(task).await {
            Ok(ms) if self.window.accepts_completed(ms) => PortProbeOutcome::success(
                port,
                LatencySplit::estimated(ms),
                ProbeStrategy::Connect,
                None,
            ),
            Ok(ms) => PortProbeOutcome::failure(port, false, below_floor(ms)),
            Err(e) => match e.elapsed_ms() {
                Some(ms) if self.window.accepts_disguised(ms) => PortProbeOutcome::success(
                    port,
                    LatencySplit::estimated(ms),
                    ProbeStrategy::Connect,
                    None,
                ),
                _ => PortProbeOutcome::failure(
                    port,
                    e.is_timeout(),
                    format!("trace probe: {first}; connect probe: {e}"),
                ),
            },
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, task: &ProbeTask) -> PortProbeOutcome {
        let port = task.port();
        let outcome = match self.trace(task).await {
            Ok(reply) if self.window.accepts_completed(reply.latency.total_ms) => {
                PortProbeOutcome::success(port, reply.latency, ProbeStrategy::Trace, reply.evidence)
            }
            // a completed but impossibly fast exchange is discarded, not retried
            Ok(reply) => PortProbeOutcome::failure(port, false, below_floor(reply.latency.total_ms)),
            Err(e) => match e.elapsed_ms() {
                Some(ms) if self.window.accepts_disguised(ms) => PortProbeOutcome::success(
                    port,
                    LatencySplit::estimated(ms),
                    ProbeStrategy::Trace,
                    None,
                ),
                _ => {
                    debug!(target = %task.target, "trace probe failed, falling back: {e}");
                    self.fallback(task, &e).await
                }
            },
        };
        debug!(
            target = %task.target,
            success = outcome.success,
            latency_ms = outcome.total_latency_ms,
            strategy = ?outcome.strategy,
            "port probed"
        );
        outcome
    }
}

impl std::fmt::Debug for TcpProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpProber")
            .field("timeout", &self.timeout)
            .field("retry_timeout", &self.retry_timeout)
            .field("window", &self.window)
            .field("trace_host", &self.trace_host)
            .finish_non_exhaustive()
    }
}

fn below_floor(ms: f64) -> String {
    format!("round trip of {ms:.1} ms is below the plausibility floor")
}

/// Write the request and read the reply until close or `TRACE_READ_LIMIT`.
async fn exchange<S>(stream: &mut S, request: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await?;
    stream.flush().await?;
    let mut buf = Vec::with_capacity(1024);
    (&mut *stream)
        .take(TRACE_READ_LIMIT as u64)
        .read_to_end(&mut buf)
        .await?;
    if buf.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed without a response",
        ));
    }
    Ok(buf)
}

/// Body of a raw HTTP response; the whole text when no header break is found.
fn response_body(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match text.split_once("\r\n\r\n") {
        Some((_, body)) => body.to_string(),
        None => text.into_owned(),
    }
}
