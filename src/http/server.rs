//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::middleware::AdmissionLayer;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::AdmissionControl;

/// HTTP server that puts admission control in front of a router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission control instance
    control: Arc<AdmissionControl>,
    /// The downstream application
    router: Router,
    /// How often expired limiters are swept, if at all
    sweep_interval: Option<Duration>,
}

impl HttpServer {
    /// Create a new server protecting `router`.
    pub fn new(addr: SocketAddr, control: Arc<AdmissionControl>, router: Router) -> Self {
        Self {
            addr,
            control,
            router,
            sweep_interval: None,
        }
    }

    /// Periodically purge expired limiters while serving.
    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// The downstream router wrapped in the admission layer.
    pub fn app(&self) -> Router {
        self.router
            .clone()
            .layer(AdmissionLayer::new(self.control.clone()))
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Starting HTTP server with admission control");

        let sweeper = self
            .sweep_interval
            .map(|interval| spawn_sweeper(self.control.clone(), interval));

        let result = axum::serve(
            listener,
            self.app()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        });

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        info!(addr = %local_addr, "HTTP server stopped");
        result
    }
}

/// Spawn a task that purges expired limiters every `interval`.
pub fn spawn_sweeper(control: Arc<AdmissionControl>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let purged = control.cache().purge_expired();
            if purged > 0 {
                debug!(
                    purged = purged,
                    remaining = control.cache().len(),
                    "Swept expired limiters"
                );
            }
        }
    })
}
