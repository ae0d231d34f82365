//! Edge inference gateway — CLI entrypoint.
//!
//! ```bash
//! eig -c config/models.yaml
//! eig -c config/models.yaml -p 8008 --http-port 8080
//! EIG_PORT=9009 eig
//! ```
//!
//! Exit codes: 0 normal shutdown, 1 bad invocation or config,
//! 2 bind/listen failure.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use eig_backend::{AcceleratorBackend, StubBackend};
use eig_core::config::GatewayConfig;
use eig_core::metrics::GatewayMetrics;
use eig_server::{Gateway, ModelManager, ServerError, bind_http, serve_http};

/// Inference gateway for edge accelerators: binary tensor protocol over
/// TCP, health and metrics over HTTP.
#[derive(Parser, Debug)]
#[command(name = "eig", version, about)]
struct Cli {
    /// Model registry path.
    #[arg(short = 'c', long = "config", default_value = "config/models.yaml")]
    config: PathBuf,

    /// TCP port for the inference protocol (overrides config and env).
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// HTTP port for /healthz, /readyz, /metrics (overrides config and env).
    #[arg(long = "http-port")]
    http_port: Option<u16>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    let mut config = match GatewayConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "config load failed");
            std::process::exit(1);
        }
    };
    // Precedence: CLI flag > environment > registry file.
    config.apply_env_overrides();
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(port) = cli.http_port {
        config.server.http_port = port;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    match runtime.block_on(run(config)) {
        Ok(()) => info!("shutdown complete"),
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(2);
        }
    }
}

async fn run(config: GatewayConfig) -> Result<(), ServerError> {
    let backend: Arc<dyn AcceleratorBackend> = Arc::new(StubBackend::new());
    info!(
        backend = backend.name(),
        models = config.models.len(),
        port = config.server.port,
        http_port = config.server.http_port,
        "starting edge inference gateway"
    );

    let metrics = Arc::new(GatewayMetrics::new());
    let manager = ModelManager::new(backend, &config.models);

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let http_listener = bind_http(config.server.http_port).await?;
    let bound = Gateway::new(config.server, manager, metrics.clone()).bind()?;

    let http_task = tokio::spawn(serve_http(http_listener, metrics, shutdown.clone()));

    bound.serve(shutdown.clone()).await;

    // The accept loop is down; make sure the HTTP side follows.
    shutdown.cancel();
    let _ = http_task.await;
    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGINT");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        }
        shutdown.cancel();
    });
}
