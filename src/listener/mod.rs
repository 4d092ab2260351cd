//! Listener Manager
//!
//! Binds one listening resource per rule and runs its accept or receive loop.
//! A rule that fails to bind is reported and skipped; the other rules keep
//! serving.

mod stream;
mod udp;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Address, Protocol, ProxyRule};
use crate::connection::ConnectionHandler;
use crate::error::ProxyError;
use crate::metrics::ListenerStats;
use crate::resource::SessionLimiter;
use crate::shutdown::ShutdownCoordinator;

use self::stream::StreamListener;
use self::udp::UdpRelay;

/// How often the manager re-checks the active session count while draining
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where a listener actually bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl BoundAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundAddr::Inet(addr) => Some(*addr),
            BoundAddr::Unix(_) => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            BoundAddr::Inet(_) => None,
            BoundAddr::Unix(path) => Some(path.as_path()),
        }
    }
}

impl fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddr::Inet(addr) => write!(f, "{}", addr),
            BoundAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A running listener
#[derive(Debug)]
pub struct ListenerHandle {
    rule: Arc<ProxyRule>,
    local_addr: BoundAddr,
    stats: Arc<ListenerStats>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn rule(&self) -> &ProxyRule {
        &self.rule
    }

    pub fn local_addr(&self) -> &BoundAddr {
        &self.local_addr
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for the accept loop to stop
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Listener task for {} failed: {}", self.rule.name, e);
        }
    }
}

/// Owns the listeners of all rules
#[derive(Debug, Clone)]
pub struct ListenerManager {
    shutdown: ShutdownCoordinator,
}

impl ListenerManager {
    pub fn new(shutdown: ShutdownCoordinator) -> Self {
        Self { shutdown }
    }

    /// Bind the listening resource of `rule` and start serving it
    pub async fn start(&self, rule: ProxyRule) -> Result<ListenerHandle, ProxyError> {
        let rule = Arc::new(rule);
        let stats = Arc::new(ListenerStats::default());
        let limiter = SessionLimiter::new(
            rule.name.clone(),
            rule.settings.max_sessions,
            Arc::clone(&stats),
        );
        let signal = self.shutdown.subscribe();
        let bind_error = |source: io::Error| ProxyError::Bind {
            address: rule.listen.to_string(),
            source,
        };

        let (local_addr, task) = match (rule.protocol, &rule.listen) {
            (Protocol::Tcp, Address::Socket(addr)) => {
                let handler = self.handler(&rule, &stats)?;
                let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
                let local = listener.local_addr().map_err(bind_error)?;
                let task = tokio::spawn(stream::accept_loop(
                    StreamListener::Tcp(listener),
                    Arc::clone(&rule),
                    limiter,
                    handler,
                    signal,
                ));
                (BoundAddr::Inet(local), task)
            }
            #[cfg(unix)]
            (Protocol::Unix, Address::Unix(path)) => {
                let handler = self.handler(&rule, &stats)?;
                let listener = tokio::net::UnixListener::bind(path).map_err(bind_error)?;
                let task = tokio::spawn(stream::accept_loop(
                    StreamListener::Unix(listener, path.clone()),
                    Arc::clone(&rule),
                    limiter,
                    handler,
                    signal,
                ));
                (BoundAddr::Unix(path.clone()), task)
            }
            (Protocol::Udp, Address::Socket(addr)) => {
                let socket = UdpSocket::bind(addr).await.map_err(bind_error)?;
                let local = socket.local_addr().map_err(bind_error)?;
                let relay = UdpRelay::new(
                    socket,
                    Arc::clone(&rule),
                    Arc::clone(&stats),
                    limiter,
                    signal,
                );
                (BoundAddr::Inet(local), tokio::spawn(relay.run()))
            }
            _ => {
                return Err(bind_error(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot listen on {} over {}", rule.listen, rule.protocol),
                )))
            }
        };

        info!("Listening on {} ({}), forwarding to {}", local_addr, rule.protocol, rule.target);

        Ok(ListenerHandle {
            rule,
            local_addr,
            stats,
            task,
        })
    }

    /// Start every rule. Bind failures are logged and the rule is skipped.
    pub async fn start_all(&self, rules: Vec<ProxyRule>) -> Vec<ListenerHandle> {
        let mut handles = Vec::with_capacity(rules.len());
        for rule in rules {
            let name = rule.name.clone();
            match self.start(rule).await {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Failed to start listener for {}: {}", name, e),
            }
        }
        handles
    }

    /// Stop accepting, then give in-flight sessions the shutdown grace period.
    ///
    /// Returns `true` when every session closed in time.
    pub async fn shutdown(&self, handles: Vec<ListenerHandle>) -> bool {
        self.shutdown.trigger();

        let stats: Vec<Arc<ListenerStats>> = handles.iter().map(|h| h.stats()).collect();
        for handle in handles {
            handle.join().await;
        }

        // Sessions bound their own drain by the grace period; allow a little
        // slack for the final teardown.
        let timeout = self.shutdown.timeout() + Duration::from_secs(1);
        self.wait_for_sessions_to_close(&stats, timeout).await
    }

    /// Wait until no listener has an active session, or `timeout` passes
    pub async fn wait_for_sessions_to_close(
        &self,
        stats: &[Arc<ListenerStats>],
        timeout: Duration,
    ) -> bool {
        let start = Instant::now();

        loop {
            let active: u64 = stats.iter().map(|s| s.active()).sum();
            if active == 0 {
                info!("All sessions closed gracefully");
                return true;
            }

            if start.elapsed() >= timeout {
                warn!("Timeout waiting for sessions to close, {} still active", active);
                return false;
            }

            debug!("Waiting for {} active sessions to close", active);
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    fn handler(
        &self,
        rule: &Arc<ProxyRule>,
        stats: &Arc<ListenerStats>,
    ) -> Result<ConnectionHandler, ProxyError> {
        ConnectionHandler::new(Arc::clone(rule), self.shutdown.timeout(), Arc::clone(stats))
    }
}
