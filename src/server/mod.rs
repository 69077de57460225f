//! HTTP server for the gateway
//!
//! Provides:
//! - The accept loop and per-connection HTTP/1.1 serving
//! - Route handling for `/v1/chat/completions`, `/v1/models`, `/health`, `/metrics`
//! - Graceful shutdown with connection draining

mod handler;
mod shutdown;

pub use handler::*;
pub use shutdown::*;

use crate::config::Config;
use crate::error::{ParleyError, Result};
use crate::gateway::GatewayService;
use crate::observability::Observability;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// The Parley server
pub struct Server {
    config: Config,
    handler: Arc<RequestHandler>,
    observability: Arc<Observability>,
    shutdown: ShutdownCoordinator,
}

impl Server {
    /// Build the gateway and its dependencies from configuration
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing {} v{}", crate::NAME, crate::VERSION);

        let observability = Arc::new(Observability::new(&config.observability)?);
        let gateway = GatewayService::from_config(&config, observability.metrics.clone()).await?;
        info!(
            models = gateway.list_models().data.len(),
            backend = ?config.rate_limit.backend,
            "Gateway ready"
        );

        Ok(Self::with_gateway(config, Arc::new(gateway), observability))
    }

    /// Serve an already assembled gateway
    pub fn with_gateway(
        config: Config,
        gateway: Arc<GatewayService>,
        observability: Arc<Observability>,
    ) -> Self {
        let handler = Arc::new(RequestHandler::new(
            gateway,
            observability.clone(),
            config.server.max_body_size,
        ));
        let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout);
        Self {
            config,
            handler,
            observability,
            shutdown,
        }
    }

    pub fn drain_handle(&self) -> DrainHandle {
        self.shutdown.drain_handle().clone()
    }

    /// Bind the configured listen address and serve until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen)
            .await
            .map_err(|e| {
                ParleyError::Config(format!(
                    "Failed to bind {}: {}",
                    self.config.server.listen, e
                ))
            })?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` resolves, then drain
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        info!(address = %addr, "Listening");

        tokio::pin!(signal);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        self.observability.metrics.record_error("accept");
                    }
                },
                _ = &mut signal => break,
            }
        }

        drop(listener);
        info!(
            active = self.shutdown.drain_handle().active_connections(),
            "Shutting down"
        );
        if self.shutdown.shutdown().await {
            info!("All connections drained");
        } else {
            warn!("Some connections were forcefully closed");
        }
        info!("Server stopped");
        Ok(())
    }

    fn accept(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let drain = self.shutdown.drain_handle().clone();
        let guard = match drain.connection_guard() {
            Some(guard) => guard,
            None => {
                debug!(client = %peer, "Rejecting connection, server is draining");
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        self.observability.metrics.record_connection();
        let handler = self.handler.clone();
        let observability = self.observability.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = handler
                .serve_connection(stream, peer, async move { drain.draining().await })
                .await
            {
                debug!(client = %peer, error = %e, "Connection ended with error");
                observability.metrics.record_error("connection");
            }
            observability.metrics.record_connection_closed();
        });
    }
}
