//! Acceptor loop and lifecycle.
//!
//! One non-blocking listener feeds the runtime's readiness reactor.
//! In-flight connections are capped by a semaphore sized `max_clients`;
//! the permit is claimed before `accept` so the backlog absorbs bursts
//! beyond the cap. Shutdown cancels the token: the loop exits, the
//! listener closes, and live connections get one write-timeout budget
//! to flush before the tracker is abandoned.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use eig_core::config::ServerConfig;
use eig_core::metrics::GatewayMetrics;

use crate::conn::{GatewayState, serve_connection};
use crate::error::ServerError;
use crate::manager::ModelManager;

/// An unbound gateway: configuration plus shared state.
pub struct Gateway {
    server: ServerConfig,
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(server: ServerConfig, manager: ModelManager, metrics: Arc<GatewayMetrics>) -> Self {
        let state = Arc::new(GatewayState {
            manager,
            metrics,
            read_timeout: Duration::from_millis(server.read_timeout_ms),
            write_timeout: Duration::from_millis(server.write_timeout_ms),
        });
        Self { server, state }
    }

    /// Binds the listener with the configured backlog depth.
    pub fn bind(self) -> Result<BoundGateway, ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.server.port));
        let bind_err = |source: std::io::Error| ServerError::Bind { addr, source };

        let socket = TcpSocket::new_v4().map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket
            .listen(self.server.queue_depth)
            .map_err(ServerError::Listen)?;
        let local_addr = listener.local_addr().map_err(ServerError::Listen)?;

        info!(addr = %local_addr, "gateway listening");
        Ok(BoundGateway {
            listener,
            local_addr,
            server: self.server,
            state: self.state,
        })
    }
}

/// A gateway with its listener bound; ready to serve.
pub struct BoundGateway {
    listener: tokio::net::TcpListener,
    local_addr: SocketAddr,
    server: ServerConfig,
    state: Arc<GatewayState>,
}

impl BoundGateway {
    /// Actual listen address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) {
        let BoundGateway {
            listener,
            local_addr: _,
            server,
            state,
        } = self;

        let clients = Arc::new(Semaphore::new(server.max_clients));
        let tracker = TaskTracker::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = clients.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    tracker.spawn(async move {
                        serve_connection(stream, peer, state).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    // Accept failures (fd exhaustion and friends) drop
                    // that connection only; the server stays up.
                    warn!(error = %e, "accept failed");
                }
            }
        }

        drop(listener);
        tracker.close();
        let drain = Duration::from_millis(server.write_timeout_ms);
        if tokio::time::timeout(drain, tracker.wait()).await.is_err() {
            warn!("connections still active at shutdown deadline");
        }
        info!("gateway stopped");
    }
}
