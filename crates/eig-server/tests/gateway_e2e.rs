//! End-to-end gateway scenarios over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use eig_backend::{StubBackend, StubEngineSpec};
use eig_core::config::{ModelConfig, ServerConfig};
use eig_core::metrics::GatewayMetrics;
use eig_core::types::{BindingDesc, DType, Direction};
use eig_proto::{RequestInput, encode_request};
use eig_server::{Gateway, ModelManager, bind_http, serve_http};

// ─── Harness ─────────────────────────────────────────────────────────────────

struct TestGateway {
    addr: SocketAddr,
    http_addr: SocketAddr,
    metrics: Arc<GatewayMetrics>,
    backend: Arc<StubBackend>,
    shutdown: CancellationToken,
    _models_dir: tempfile::TempDir,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn classifier_spec() -> StubEngineSpec {
    StubEngineSpec {
        bindings: vec![
            BindingDesc {
                name: "data".into(),
                direction: Direction::Input,
                dtype: DType::Fp32,
                shape: vec![1, 3, 4, 4],
            },
            BindingDesc {
                name: "prob".into(),
                direction: Direction::Output,
                dtype: DType::Fp32,
                shape: vec![1, 10],
            },
        ],
    }
}

async fn start(
    concurrency: usize,
    enqueue_delay: Option<Duration>,
    read_timeout_ms: u64,
) -> TestGateway {
    let models_dir = tempfile::tempdir().unwrap();
    let engine = models_dir.path().join("m.eng");
    std::fs::write(&engine, classifier_spec().to_bytes()).unwrap();

    let backend = Arc::new(StubBackend::with_enqueue_delay(enqueue_delay));
    let metrics = Arc::new(GatewayMetrics::new());
    let manager = ModelManager::new(
        backend.clone(),
        &[ModelConfig {
            id: "m".into(),
            engine,
            concurrency,
        }],
    );
    let server = ServerConfig {
        port: 0,
        http_port: 0,
        max_clients: 64,
        read_timeout_ms,
        write_timeout_ms: 5_000,
        queue_depth: 64,
    };

    let bound = Gateway::new(server, manager, metrics.clone()).bind().unwrap();
    let addr = SocketAddr::from(([127, 0, 0, 1], bound.local_addr().port()));
    let shutdown = CancellationToken::new();
    tokio::spawn(bound.serve(shutdown.clone()));

    let http_listener = bind_http(0).await.unwrap();
    let http_addr = SocketAddr::from(([127, 0, 0, 1], http_listener.local_addr().unwrap().port()));
    tokio::spawn(serve_http(http_listener, metrics.clone(), shutdown.clone()));

    TestGateway {
        addr,
        http_addr,
        metrics,
        backend,
        shutdown,
        _models_dir: models_dir,
    }
}

/// 192 bytes of fp32 ones — the classifier's full input tensor.
fn ones_blob() -> Vec<u8> {
    1.0f32
        .to_le_bytes()
        .iter()
        .copied()
        .cycle()
        .take(192)
        .collect()
}

fn classify_request(req_id: u32, model: &str) -> Vec<u8> {
    let blob = ones_blob();
    encode_request(
        req_id,
        model,
        &[RequestInput {
            dtype: DType::Fp32,
            shape: vec![1, 3, 4, 4],
            blob: &blob,
        }],
    )
    .unwrap()
}

async fn read_response(stream: &mut TcpStream) -> std::io::Result<(u32, u32, Vec<Vec<u8>>)> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;

    let le32 = |at: usize| u32::from_le_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]]);
    let req_id = le32(0);
    let status = le32(4);
    let n_outputs = le32(8) as usize;

    let mut lens = Vec::with_capacity(n_outputs);
    for i in 0..n_outputs {
        lens.push(le32(12 + 4 * i) as usize);
    }
    let mut outputs = Vec::with_capacity(n_outputs);
    let mut at = 12 + 4 * n_outputs;
    for len in lens {
        outputs.push(frame[at..at + len].to_vec());
        at += len;
    }
    Ok((req_id, status, outputs))
}

async fn send_and_receive(
    addr: SocketAddr,
    wire: &[u8],
) -> std::io::Result<(u32, u32, Vec<Vec<u8>>)> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(wire).await?;
    read_response(&mut stream).await
}

/// Metrics are recorded after the response hits the socket, so poll
/// briefly instead of racing the server task.
async fn wait_for_counts(metrics: &GatewayMetrics, ok: u64, err: u64) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let snap = metrics.snapshot();
        if snap.requests_ok == ok && snap.requests_err == err {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "counters stuck at ok={} err={}, want ok={ok} err={err}",
            snap.requests_ok,
            snap.requests_err
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_classify_returns_deterministic_output() {
    let gw = start(2, None, 30_000).await;

    let (req_id, status, outputs) = send_and_receive(gw.addr, &classify_request(11, "m"))
        .await
        .unwrap();

    assert_eq!(req_id, 11);
    assert_eq!(status, 0);
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].len(), 40);

    let blob = ones_blob();
    let expect = StubBackend::fill_byte(&[&blob]);
    assert!(outputs[0].iter().all(|&b| b == expect));
    assert_eq!(gw.backend.engine_loads(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_magic_gets_status_1_and_the_connection_dies() {
    let gw = start(1, None, 30_000).await;

    let mut wire = classify_request(0, "m");
    wire[4..8].copy_from_slice(b"XXXX");

    let mut stream = TcpStream::connect(gw.addr).await.unwrap();
    stream.write_all(&wire).await.unwrap();
    let (_, status, outputs) = read_response(&mut stream).await.unwrap();
    assert_eq!(status, 1);
    assert!(outputs.is_empty());

    // No further frames are accepted on this connection: the next read
    // sees either a clean close or a reset.
    let _ = stream.write_all(&classify_request(1, "m")).await;
    let mut probe = [0u8; 1];
    let dead = matches!(stream.read(&mut probe).await, Ok(0) | Err(_));
    assert!(dead);

    wait_for_counts(&gw.metrics, 0, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_model_echoes_req_id_with_status_2() {
    let gw = start(1, None, 30_000).await;

    let (req_id, status, outputs) =
        send_and_receive(gw.addr, &classify_request(0xDEAD_BEEF, "nope"))
            .await
            .unwrap();

    assert_eq!(req_id, 0xDEAD_BEEF);
    assert_eq!(status, 2);
    assert!(outputs.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_limit_batches_inflight_requests() {
    let gw = start(2, Some(Duration::from_millis(100)), 30_000).await;

    let started = Instant::now();
    let mut tasks = Vec::new();
    for i in 0..5u32 {
        let addr = gw.addr;
        tasks.push(tokio::spawn(async move {
            send_and_receive(addr, &classify_request(i, "m")).await
        }));
    }
    for task in tasks {
        let (_, status, _) = task.await.unwrap().unwrap();
        assert_eq!(status, 0);
    }
    let elapsed = started.elapsed();

    // ceil(5 / 2) waves of 100 ms each; generous ceiling for CI jitter.
    assert!(elapsed >= Duration::from_millis(300), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");

    assert!(gw.backend.peak_concurrent_enqueues() <= 2);
    wait_for_counts(&gw.metrics, 5, 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_client_is_cut_off_after_the_read_timeout() {
    let gw = start(1, None, 200).await;

    let mut stream = TcpStream::connect(gw.addr).await.unwrap();
    // Declare a 100-byte frame but deliver only half of it.
    stream.write_all(&100u32.to_le_bytes()).await.unwrap();
    stream.write_all(&[0u8; 50]).await.unwrap();

    // Server gives up without replying and closes.
    let mut probe = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut probe))
        .await
        .expect("server should close the connection");
    assert!(matches!(read, Ok(0) | Err(_)));

    wait_for_counts(&gw.metrics, 0, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metrics_endpoint_reports_terminal_outcomes() {
    let gw = start(2, None, 30_000).await;

    for i in 0..3 {
        let (_, status, _) = send_and_receive(gw.addr, &classify_request(i, "m"))
            .await
            .unwrap();
        assert_eq!(status, 0);
    }
    for i in 0..2 {
        let (_, status, _) = send_and_receive(gw.addr, &classify_request(i, "nope"))
            .await
            .unwrap();
        assert_eq!(status, 2);
    }
    wait_for_counts(&gw.metrics, 3, 2).await;

    let base = format!("http://{}", gw.http_addr);
    let body = reqwest::get(format!("{base}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("eig_requests_total 3\n"), "body: {body}");
    assert!(body.contains("eig_errors_total 2\n"), "body: {body}");

    let health = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok\n");

    let ready = reqwest::get(format!("{base}/readyz")).await.unwrap();
    assert_eq!(ready.status(), 200);
    assert_eq!(ready.text().await.unwrap(), "ready\n");

    let missing = reqwest::get(format!("{base}/nope")).await.unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_connection_carries_many_frames() {
    let gw = start(1, None, 30_000).await;

    let mut stream = TcpStream::connect(gw.addr).await.unwrap();
    for i in 0..3u32 {
        stream.write_all(&classify_request(i, "m")).await.unwrap();
        let (req_id, status, outputs) = read_response(&mut stream).await.unwrap();
        assert_eq!(req_id, i);
        assert_eq!(status, 0);
        assert_eq!(outputs.len(), 1);
    }
    wait_for_counts(&gw.metrics, 3, 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_frames_are_rejected_up_front() {
    let gw = start(1, None, 30_000).await;

    let mut stream = TcpStream::connect(gw.addr).await.unwrap();
    let huge = (64u32 << 20) + 1;
    stream.write_all(&huge.to_le_bytes()).await.unwrap();

    let (req_id, status, outputs) = read_response(&mut stream).await.unwrap();
    assert_eq!(req_id, 0);
    assert_eq!(status, 1);
    assert!(outputs.is_empty());

    let mut probe = [0u8; 1];
    let dead = matches!(stream.read(&mut probe).await, Ok(0) | Err(_));
    assert!(dead);
    wait_for_counts(&gw.metrics, 0, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undersized_input_blob_is_a_shape_mismatch() {
    let gw = start(1, None, 30_000).await;

    let short = vec![1u8; 100];
    let wire = encode_request(
        5,
        "m",
        &[RequestInput {
            dtype: DType::Fp32,
            shape: vec![1, 3, 4, 4],
            blob: &short,
        }],
    )
    .unwrap();

    let (req_id, status, outputs) = send_and_receive(gw.addr, &wire).await.unwrap();
    assert_eq!(req_id, 5);
    assert_eq!(status, 3);
    assert!(outputs.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enqueue_failure_surfaces_status_4() {
    let gw = start(1, None, 30_000).await;
    gw.backend.set_fail_enqueue(true);

    let (_, status, outputs) = send_and_receive(gw.addr, &classify_request(1, "m"))
        .await
        .unwrap();
    assert_eq!(status, 4);
    assert!(outputs.is_empty());

    // The pool slot was released; the model serves again once the
    // device recovers.
    gw.backend.set_fail_enqueue(false);
    let (_, status, _) = send_and_receive(gw.addr, &classify_request(2, "m"))
        .await
        .unwrap();
    assert_eq!(status, 0);
}
