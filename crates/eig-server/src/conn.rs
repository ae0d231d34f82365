//! Per-connection request loop.
//!
//! Each accepted socket runs: read one length-prefixed frame under the
//! read timeout, hand the bytes to the blocking pool for parse → route →
//! infer → serialize, write the response under the write timeout. A
//! successful exchange keeps the connection open for the next frame; any
//! error answers with a status-only frame when framing allows it, then
//! closes. Metrics are updated on each request's terminal outcome.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use eig_core::metrics::GatewayMetrics;
use eig_proto::{MAX_FRAME_LEN, encode_response, parse_request, read_req_id};

use crate::manager::ModelManager;

pub(crate) struct GatewayState {
    pub manager: ModelManager,
    pub metrics: Arc<GatewayMetrics>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// Terminal result of one frame: the bytes to send back plus what to log.
struct FrameOutcome {
    wire: Vec<u8>,
    status: u32,
    req_id: u32,
    model: Option<String>,
    latency_ms: u64,
    detail: Option<String>,
}

impl FrameOutcome {
    fn failure(req_id: u32, status: u32, model: Option<String>, detail: String) -> Self {
        Self {
            wire: status_frame(req_id, status),
            status,
            req_id,
            model,
            latency_ms: 0,
            detail: Some(detail),
        }
    }
}

/// Status-only response frame; infallible for empty output sets.
fn status_frame(req_id: u32, status: u32) -> Vec<u8> {
    encode_response(req_id, status, &[]).unwrap_or_default()
}

pub(crate) async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<GatewayState>,
) {
    debug!(%peer, "connection accepted");

    loop {
        // Outer length prefix. A clean EOF here is the peer hanging up
        // between frames, not an error.
        let mut len_buf = [0u8; 4];
        match timeout(state.read_timeout, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Ok(Err(e)) => {
                state.metrics.record_err();
                warn!(%peer, error = %e, "frame length read failed");
                break;
            }
            Err(_) => {
                state.metrics.record_err();
                warn!(%peer, "read timeout waiting for frame");
                break;
            }
        }

        let frame_len = u32::from_le_bytes(len_buf);
        if frame_len > MAX_FRAME_LEN {
            state.metrics.record_err();
            warn!(%peer, frame_len, cap = MAX_FRAME_LEN, "oversized frame rejected");
            let _ = timeout(state.write_timeout, stream.write_all(&status_frame(0, 1))).await;
            break;
        }

        let mut frame = vec![0u8; frame_len as usize];
        match timeout(state.read_timeout, stream.read_exact(&mut frame)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                state.metrics.record_err();
                warn!(%peer, error = %e, "frame body read failed");
                break;
            }
            Err(_) => {
                state.metrics.record_err();
                warn!(%peer, frame_len, "read timeout inside frame body");
                break;
            }
        }

        // Parse, route, and execute on the blocking pool; device sync
        // and pool checkout both block.
        let task_state = state.clone();
        let outcome = match tokio::task::spawn_blocking(move || process_frame(frame, task_state))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                state.metrics.record_err();
                warn!(%peer, error = %e, "frame task aborted");
                break;
            }
        };

        let written = match timeout(state.write_timeout, stream.write_all(&outcome.wire)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "response write failed");
                false
            }
            Err(_) => {
                warn!(%peer, "response write timed out");
                false
            }
        };

        if outcome.status == 0 && written {
            let total = state.metrics.record_ok(outcome.latency_ms);
            info!(
                req_id = outcome.req_id,
                model = outcome.model.as_deref().unwrap_or(""),
                latency_ms = outcome.latency_ms,
                "request complete"
            );
            if total % 100 == 0 {
                let snap = state.metrics.snapshot();
                info!(
                    n = snap.requests_ok,
                    errors = snap.requests_err,
                    avg_ms = snap.avg_latency_ms,
                    min_ms = snap.min_latency_ms,
                    max_ms = snap.peak_latency_ms,
                    qps_approx = if snap.avg_latency_ms > 0 {
                        1000 / snap.avg_latency_ms
                    } else {
                        0
                    },
                    "throughput summary"
                );
            }
            continue;
        }

        state.metrics.record_err();
        if outcome.status != 0 {
            warn!(
                req_id = outcome.req_id,
                status = outcome.status,
                model = outcome.model.as_deref().unwrap_or(""),
                detail = outcome.detail.as_deref().unwrap_or(""),
                "request failed"
            );
        }
        break;
    }

    // Half-close the write side first, then drop the socket.
    let _ = stream.shutdown().await;
    debug!(%peer, "connection closed");
}

fn process_frame(frame: Vec<u8>, state: Arc<GatewayState>) -> FrameOutcome {
    let request = match parse_request(&frame) {
        Ok(request) => request,
        Err(e) => {
            return FrameOutcome::failure(read_req_id(&frame), e.status_code(), None, e.to_string());
        }
    };
    let req_id = request.req_id;
    let model = request.model_id.to_string();

    let runner = match state.manager.get_or_load(&model) {
        Ok(runner) => runner,
        Err(e) => {
            return FrameOutcome::failure(req_id, e.status_code(), Some(model), e.to_string());
        }
    };

    let mut host_outputs: Vec<Vec<u8>> = runner
        .outputs()
        .iter()
        .map(|binding| vec![0u8; binding.byte_len()])
        .collect();

    let started = Instant::now();
    if let Err(e) = runner.infer(&request.blobs, &mut host_outputs) {
        return FrameOutcome::failure(req_id, e.status_code(), Some(model), e.to_string());
    }
    let latency_ms = started.elapsed().as_millis() as u64;

    let views: Vec<&[u8]> = host_outputs.iter().map(Vec::as_slice).collect();
    match encode_response(req_id, 0, &views) {
        Ok(wire) => FrameOutcome {
            wire,
            status: 0,
            req_id,
            model: Some(model),
            latency_ms,
            detail: None,
        },
        Err(e) => FrameOutcome::failure(req_id, 4, Some(model), e.to_string()),
    }
}
