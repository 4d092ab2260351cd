//! Graceful Shutdown Handling
//!
//! A single process-wide cancellation signal shared by every listener and
//! session. Supports SIGTERM and SIGINT and lets active sessions drain for a
//! bounded grace period.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info};
use crate::Result;

/// Shutdown coordinator that owns the cancellation signal
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: Arc<watch::Sender<bool>>,
    /// Grace period sessions get once the signal fires
    timeout: Duration,
}

/// Receiving side of the cancellation signal.
///
/// A signal subscribed after the coordinator fired still observes it.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    shutdown_rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            timeout,
        }
    }

    /// Get a shutdown signal for components to listen on
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            shutdown_rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Grace period granted to sessions after shutdown starts
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fire the cancellation signal
    pub fn trigger(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Shutdown signal sent to all listeners and sessions");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then fire the cancellation signal
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }
}

impl ShutdownSignal {
    /// Resolve once shutdown has been triggered
    pub async fn recv(&mut self) {
        let closed = self.shutdown_rx.wait_for(|fired| *fired).await.is_err();
        if closed {
            // Coordinator dropped without firing: nothing will ever shut us down.
            debug!("Shutdown coordinator dropped");
            std::future::pending::<()>().await;
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}
