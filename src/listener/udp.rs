//! Datagram Relay
//!
//! One listening socket per rule. Each distinct client source address gets its
//! own session with a dedicated outbound socket connected to the target, so
//! replies can be routed back to the right client. Sessions evict themselves
//! from the table after the idle timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::config::ProxyRule;
use crate::error::ProxyError;
use crate::metrics::ListenerStats;
use crate::relay::{idle_expired, ActivityTracker, CloseReason, RelaySession, SessionState};
use crate::resource::{SessionLimiter, SessionSlot};
use crate::shutdown::ShutdownSignal;
use crate::transport::{dial_udp, resolve_udp_target};

/// Largest payload a UDP datagram can carry
const MAX_DATAGRAM_SIZE: usize = 65_535;

#[derive(Debug)]
struct UdpSessionHandle {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: Mutex<HashMap<SocketAddr, UdpSessionHandle>>,
    next_id: AtomicU64,
}

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, UdpSessionHandle>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove `source` only if it still belongs to session `id`
    fn evict(&self, source: &SocketAddr, id: u64) {
        let mut sessions = self.lock();
        if sessions.get(source).map(|handle| handle.id) == Some(id) {
            sessions.remove(source);
        }
    }
}

/// Receive loop of a datagram rule
pub(crate) struct UdpRelay {
    socket: Arc<UdpSocket>,
    rule: Arc<ProxyRule>,
    stats: Arc<ListenerStats>,
    limiter: SessionLimiter,
    table: Arc<SessionTable>,
    shutdown: ShutdownSignal,
}

impl UdpRelay {
    pub(crate) fn new(
        socket: UdpSocket,
        rule: Arc<ProxyRule>,
        stats: Arc<ListenerStats>,
        limiter: SessionLimiter,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            rule,
            stats,
            limiter,
            table: Arc::new(SessionTable::default()),
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        info!("Starting datagram receive loop for {}", self.rule);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, source)) => {
                        self.dispatch(source, Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some
                        // platforms; they do not invalidate the socket.
                        debug!("Datagram receive error on {}: {}", self.rule.name, e);
                    }
                },
                _ = shutdown.recv() => {
                    info!(
                        "Received shutdown signal, stopping datagram relay on {}",
                        self.rule.name
                    );
                    break;
                }
            }
        }

        info!("Datagram receive loop stopped for {}", self.rule.name);
    }

    /// Route one client datagram into its session, creating the session when
    /// the source is new. Never waits: target resolution and dialing happen
    /// on the session task.
    fn dispatch(&self, source: SocketAddr, payload: Bytes) {
        // Enqueue under the table lock so eviction cannot race a delivery.
        let mut sessions = self.table.lock();
        let payload = match sessions.get(&source) {
            Some(handle) => match handle.tx.try_send(payload) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    self.stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Session queue for {} is full, dropping datagram", source);
                    return;
                }
                // Session is ending; start a fresh one below.
                Err(TrySendError::Closed(payload)) => payload,
            },
            None => payload,
        };

        let slot = match self.limiter.try_acquire() {
            Ok(slot) => slot,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", source, e);
                return;
            }
        };

        let (tx, rx) = mpsc::channel(self.rule.settings.udp_queue_depth);
        // A fresh queue always has room for the first datagram.
        let _ = tx.try_send(payload);

        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        sessions.insert(source, UdpSessionHandle { id, tx });
        drop(sessions);

        let task = UdpSessionTask {
            id,
            source,
            listener: Arc::clone(&self.socket),
            rx,
            session: Arc::new(RelaySession::new(
                self.rule.name.clone(),
                source.to_string(),
                self.rule.target.to_string(),
            )),
            rule: Arc::clone(&self.rule),
            stats: Arc::clone(&self.stats),
            table: Arc::clone(&self.table),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(task.run(slot));
    }
}

struct UdpSessionTask {
    id: u64,
    source: SocketAddr,
    listener: Arc<UdpSocket>,
    rx: mpsc::Receiver<Bytes>,
    session: Arc<RelaySession>,
    rule: Arc<ProxyRule>,
    stats: Arc<ListenerStats>,
    table: Arc<SessionTable>,
    shutdown: ShutdownSignal,
}

impl UdpSessionTask {
    async fn run(mut self, slot: SessionSlot) {
        let mut shutdown = self.shutdown.clone();
        let dialed = tokio::select! {
            result = self.connect() => Some(result),
            _ = shutdown.recv() => None,
        };
        let reason = match dialed {
            Some(Ok(outbound)) => self.relay(outbound).await,
            Some(Err(e)) => {
                self.leave_table();
                CloseReason::DialFailed(e.to_string())
            }
            None => {
                self.leave_table();
                CloseReason::Shutdown
            }
        };

        let outcome = self.session.finish(reason);
        self.stats.record_outcome(&outcome);
        self.session.log_outcome(&outcome);
        drop(slot);
    }

    /// Resolve the target and open the outbound socket of this session
    async fn connect(&self) -> Result<UdpSocket, ProxyError> {
        let settings = &self.rule.settings;
        let target = resolve_udp_target(&self.rule.target, settings.dial_timeout).await?;
        dial_udp(target).await
    }

    async fn relay(&mut self, outbound: UdpSocket) -> CloseReason {
        let activity = ActivityTracker::new();
        activity.touch();
        self.session.set_state(SessionState::Relaying);

        let deadline = self.rule.settings.session_deadline.map(|d| Instant::now() + d);
        let deadline_expired = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline_expired);

        let idle_timeout = self.rule.settings.idle_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        let reason = loop {
            tokio::select! {
                datagram = self.rx.recv() => match datagram {
                    Some(payload) => match outbound.send(&payload).await {
                        Ok(n) => {
                            activity.touch();
                            self.session.add_bytes_up(n as u64);
                        }
                        Err(e) => {
                            self.leave_table();
                            break CloseReason::Error(format!("send to target: {}", e));
                        }
                    },
                    None => {
                        self.leave_table();
                        break CloseReason::Completed;
                    }
                },
                received = outbound.recv(&mut buf) => match received {
                    Ok(n) => {
                        activity.touch();
                        match self.listener.send_to(&buf[..n], self.source).await {
                            Ok(sent) => self.session.add_bytes_down(sent as u64),
                            Err(e) => {
                                self.leave_table();
                                break CloseReason::Error(format!("send to client: {}", e));
                            }
                        }
                    }
                    Err(e) => {
                        // Typically ECONNREFUSED after an ICMP port unreachable.
                        debug!(
                            session_id = %self.session.session_id,
                            "Target receive error: {}",
                            e
                        );
                    }
                },
                _ = idle_expired(&activity, idle_timeout) => {
                    let mut sessions = self.table.lock();
                    // A datagram slipped in before eviction; keep serving it.
                    if !self.rx.is_empty() {
                        activity.touch();
                        continue;
                    }
                    if sessions.get(&self.source).map(|handle| handle.id) == Some(self.id) {
                        sessions.remove(&self.source);
                    }
                    drop(sessions);
                    self.rx.close();
                    break CloseReason::IdleTimeout;
                },
                _ = &mut deadline_expired => {
                    self.leave_table();
                    break CloseReason::Deadline;
                }
                _ = self.shutdown.recv() => {
                    self.leave_table();
                    break CloseReason::Shutdown;
                }
            }
        };

        self.session.set_state(SessionState::Closing);
        reason
    }

    /// Evict this session from the table, then drop whatever it had queued.
    ///
    /// Datagrams are only enqueued under the table lock, so nothing can reach
    /// the queue after the eviction and every discarded datagram is counted.
    fn leave_table(&mut self) {
        self.table.evict(&self.source, self.id);
        self.rx.close();

        let mut dropped = 0u64;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            self.stats.datagrams_dropped.fetch_add(dropped, Ordering::Relaxed);
            debug!(
                session_id = %self.session.session_id,
                "Discarded {} queued datagrams from {}",
                dropped,
                self.source
            );
        }
    }
}
