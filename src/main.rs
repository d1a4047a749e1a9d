use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::Request;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::HttpServer;
use turnstile::ratelimit::AdmissionControl;

/// Per-client token bucket admission control in front of an HTTP service.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Turnstile admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        rate = config.rate_limiter.rate,
        bucket = config.rate_limiter.bucket,
        ip_header = ?config.rate_limiter.ip_header,
        max_keys = config.rate_limiter.max_keys,
        ttl_secs = config.rate_limiter.ttl_secs,
        "Configuration loaded"
    );

    let control = Arc::new(AdmissionControl::from_config(&config.rate_limiter)?);
    info!("Admission control initialized");

    let server = HttpServer::new(config.server.listen_addr, control, downstream())
        .with_sweep_interval(config.server.sweep_interval());

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile stopped");
    Ok(())
}

/// The service protected by admission control.
fn downstream() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback(|req: Request| async move { format!("{} {}\n", req.method(), req.uri()) })
}

/// Resolves once the process is asked to stop, letting in-flight requests
/// drain before the listener closes.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for interrupts; only SIGTERM stops turnstile");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let source = tokio::select! {
        _ = interrupt => "interrupt",
        _ = terminate => "SIGTERM",
    };
    info!(signal = source, "Draining connections before stopping admission control");
}
