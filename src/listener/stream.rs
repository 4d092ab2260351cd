//! Stream Accept Loop
//!
//! Accepts TCP and unix domain socket connections and dispatches one session
//! task per connection.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use crate::config::ProxyRule;
use crate::connection::ConnectionHandler;
use crate::resource::SessionLimiter;
use crate::shutdown::ShutdownSignal;
use crate::transport::{configure_tcp, ProxyStream};

/// Back-off after a failed accept, e.g. when the process is out of descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// A bound listening resource for a stream rule
#[derive(Debug)]
pub(crate) enum StreamListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, std::path::PathBuf),
}

impl StreamListener {
    async fn accept(&self) -> io::Result<(ProxyStream, String)> {
        match self {
            StreamListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((ProxyStream::Tcp(stream), addr.to_string()))
            }
            #[cfg(unix)]
            StreamListener::Unix(listener, path) => {
                let (stream, addr) = listener.accept().await?;
                let client = addr
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| format!("unix:{}", path.display()));
                Ok((ProxyStream::Unix(stream), client))
            }
        }
    }

    /// Remove the socket file a unix listener created
    fn cleanup(self) {
        #[cfg(unix)]
        if let StreamListener::Unix(listener, path) = self {
            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("Failed to remove socket file {}: {}", path.display(), e);
            }
        }
    }
}

/// Main connection acceptance loop
pub(crate) async fn accept_loop(
    listener: StreamListener,
    rule: Arc<ProxyRule>,
    limiter: SessionLimiter,
    handler: ConnectionHandler,
    mut shutdown: ShutdownSignal,
) {
    info!("Starting connection acceptance loop for {}", rule);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, client)) => {
                        debug!("Accepted connection from {} on {}", client, rule.name);

                        if let ProxyStream::Tcp(tcp) = &stream {
                            if let Err(e) = configure_tcp(tcp, &rule.settings) {
                                warn!("Failed to configure socket for {}: {}", client, e);
                            }
                        }

                        let slot = match limiter.try_acquire() {
                            Ok(slot) => slot,
                            Err(e) => {
                                debug!("Rejecting connection from {}: {}", client, e);
                                stream.reset();
                                continue;
                            }
                        };

                        let handler = handler.clone();
                        let session_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            // Keep the slot for the lifetime of the session
                            let _slot = slot;
                            handler.handle(stream, client, session_shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection on {}: {}", rule.name, e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Received shutdown signal, stopping connection acceptance on {}", rule.name);
                break;
            }
        }
    }

    listener.cleanup();
    info!("Connection acceptance loop stopped for {}", rule.name);
}
