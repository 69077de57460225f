//! Graceful shutdown with connection draining
//!
//! On shutdown the accept loop stops, idle keep-alive connections are told to
//! close after their current request, and in-flight completions (including
//! open SSE streams) get until the shutdown timeout to finish.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Shared view of the draining state
#[derive(Clone)]
pub struct DrainHandle {
    inner: Arc<DrainState>,
}

struct DrainState {
    draining: AtomicBool,
    active_connections: AtomicUsize,
    /// Signalled when the last connection closes
    drained: Notify,
    /// Flips to `true` once draining starts
    drain_tx: watch::Sender<bool>,
}

impl DrainHandle {
    pub fn new() -> Self {
        let (drain_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(DrainState {
                draining: AtomicBool::new(false),
                active_connections: AtomicUsize::new(0),
                drained: Notify::new(),
                drain_tx,
            }),
        }
    }

    /// Track a new connection. `None` once draining has started.
    pub fn connection_guard(&self) -> Option<ConnectionGuard> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return None;
        }

        self.inner.active_connections.fetch_add(1, Ordering::SeqCst);
        Some(ConnectionGuard {
            state: self.inner.clone(),
        })
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Receiver that observes the start of draining
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.drain_tx.subscribe()
    }

    /// Resolve once draining has started
    pub async fn draining(&self) {
        let mut rx = self.subscribe();
        // An error means the sender is gone, which cannot happen while `self` lives
        let _ = rx.wait_for(|draining| *draining).await;
    }

    /// Start draining and wait for connections to close.
    ///
    /// Returns `true` if every connection closed within `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.inner.draining.store(true, Ordering::SeqCst);
        self.inner.drain_tx.send_replace(true);

        let active = self.active_connections();
        info!(active, "Draining connections");

        match tokio::time::timeout(timeout, self.wait_for_drain()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.active_connections(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Drain timeout exceeded"
                );
                false
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            let active = self.active_connections();
            if active == 0 {
                return;
            }
            debug!(active, "Waiting for connections to close");

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }
}

impl Default for DrainHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts one open connection until dropped
pub struct ConnectionGuard {
    state: Arc<DrainState>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.state.active_connections.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.state.drained.notify_waiters();
        }
    }
}

/// Owns the drain handle and the shutdown timeout
pub struct ShutdownCoordinator {
    drain_handle: DrainHandle,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            drain_handle: DrainHandle::new(),
            shutdown_timeout,
        }
    }

    pub fn drain_handle(&self) -> &DrainHandle {
        &self.drain_handle
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Drain with the configured timeout
    pub async fn shutdown(&self) -> bool {
        self.drain_handle.drain(self.shutdown_timeout).await
    }
}

/// Resolve on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
