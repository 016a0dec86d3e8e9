use edge_scan_rs::config::RunConfig;
use edge_scan_rs::ports::Protocol;
use edge_scan_rs::prober::{Prober, TcpProber};
use edge_scan_rs::types::{ProbeStrategy, ProbeTask};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const TRACE_BODY: &str = "fl=1f1\nh=example\nip=192.0.2.1\nts=1700000000.0\nvisit_scheme=http\ncolo=SJC\nloc=US\ntls=off\n";

async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 2048];
    let mut got = Vec::new();
    loop {
        let n = stream.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
        if got.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&got).into_owned()
}

fn http_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Spawn a loopback server running `handle` for every accepted connection.
async fn spawn_server<F, Fut>(handle: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle(stream));
        }
    });
    addr
}

fn task(target: SocketAddr, protocol: Protocol) -> ProbeTask {
    ProbeTask { target, protocol }
}

fn config(floor_ms: f64, max_latency_ms: u64, timeout_ms: u64) -> RunConfig {
    RunConfig {
        plausibility_floor_ms: floor_ms,
        max_latency_ms,
        timeout: Duration::from_millis(timeout_ms),
        retry_timeout: Duration::from_millis(timeout_ms),
        ..RunConfig::default()
    }
}

#[tokio::test]
async fn trace_reply_yields_evidence_and_measured_split() {
    let addr = spawn_server(|mut s| async move {
        let head = read_head(&mut s).await;
        assert!(head.starts_with("GET /cdn-cgi/trace HTTP/1.1\r\n"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = s.write_all(http_response(TRACE_BODY).as_bytes()).await;
        let _ = s.shutdown().await;
    })
    .await;

    let prober = TcpProber::new(&config(5.0, 200, 2_000)).unwrap();
    let out = prober.probe(&task(addr, Protocol::Http)).await;

    assert!(out.success, "{:?}", out.error);
    assert_eq!(out.strategy, Some(ProbeStrategy::Trace));
    assert!(out.total_latency_ms >= 20.0);
    assert!(out.connect_latency_ms <= out.total_latency_ms);
    let ev = out.evidence.unwrap();
    assert_eq!(ev.pop_code.as_deref(), Some("SJC"));
    assert_eq!(ev.location_code.as_deref(), Some("US"));
}

#[tokio::test]
async fn closed_port_is_a_plain_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let prober = TcpProber::new(&config(50.0, 200, 1_000)).unwrap();
    let out = prober.probe(&task(addr, Protocol::Http)).await;

    assert!(!out.success);
    assert!(!out.timed_out);
    assert!(out.total_latency_ms.is_infinite());
    assert!(out.error.is_some());
}

#[tokio::test]
async fn silent_server_times_out_on_both_strategies() {
    let addr = spawn_server(|s| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(s);
    })
    .await;

    let prober = TcpProber::new(&config(5.0, 50, 150)).unwrap();
    let out = prober.probe(&task(addr, Protocol::Http)).await;

    assert!(!out.success);
    assert!(out.timed_out);
}

#[tokio::test]
async fn early_close_inside_window_is_a_disguised_success() {
    let addr = spawn_server(|s| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(s);
    })
    .await;

    let prober = TcpProber::new(&config(5.0, 200, 2_000)).unwrap();
    let out = prober.probe(&task(addr, Protocol::Http)).await;

    assert!(out.success, "{:?}", out.error);
    assert_eq!(out.strategy, Some(ProbeStrategy::Trace));
    assert!(out.evidence.is_none());
    // no phase timestamps for a failed exchange: fixed 60/40 estimate
    assert!((out.connect_latency_ms - out.total_latency_ms * 0.6).abs() < 1e-6);
}

#[tokio::test]
async fn failed_tls_handshake_inside_window_is_a_disguised_success() {
    let addr = spawn_server(|s| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(s);
    })
    .await;

    let prober = TcpProber::new(&config(5.0, 200, 2_000)).unwrap();
    let out = prober.probe(&task(addr, Protocol::Https)).await;

    assert!(out.success, "{:?}", out.error);
    assert!(out.total_latency_ms >= 20.0);
}

#[tokio::test]
async fn fast_trace_error_falls_back_to_connect_probe() {
    let addr = spawn_server(|mut s| async move {
        let head = read_head(&mut s).await;
        if head.starts_with("HEAD ") {
            tokio::time::sleep(Duration::from_millis(80)).await;
            let _ = s.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;
        }
        // trace requests are dropped straight away
    })
    .await;

    let prober = TcpProber::new(&config(50.0, 200, 2_000)).unwrap();
    let out = prober.probe(&task(addr, Protocol::Http)).await;

    assert!(out.success, "{:?}", out.error);
    assert_eq!(out.strategy, Some(ProbeStrategy::Connect));
    assert!(out.total_latency_ms >= 80.0);
    assert!(out.evidence.is_none());
}

#[tokio::test]
async fn completed_exchange_below_floor_is_discarded() {
    let addr = spawn_server(|mut s| async move {
        let _ = read_head(&mut s).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = s.write_all(http_response(TRACE_BODY).as_bytes()).await;
        let _ = s.shutdown().await;
    })
    .await;

    // floor above anything loopback can produce
    let prober = TcpProber::new(&config(1_000.0, 200, 3_000)).unwrap();
    let out = prober.probe(&task(addr, Protocol::Http)).await;

    assert!(!out.success);
    assert!(!out.timed_out);
    assert!(out.evidence.is_none());
}

#[tokio::test]
async fn slow_complete_reply_is_still_a_success() {
    let addr = spawn_server(|mut s| async move {
        let _ = read_head(&mut s).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        let _ = s.write_all(http_response(TRACE_BODY).as_bytes()).await;
        let _ = s.shutdown().await;
    })
    .await;

    // ceiling is 2 x 50 = 100 ms, but a finished exchange only needs the floor
    let prober = TcpProber::new(&config(5.0, 50, 2_000)).unwrap();
    let out = prober.probe(&task(addr, Protocol::Http)).await;

    assert!(out.success, "{:?}", out.error);
    assert!(out.total_latency_ms >= 250.0);
}
