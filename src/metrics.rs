//! Listener Metrics
//!
//! Per-listener counters and a periodic stats reporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::relay::{CloseReason, SessionOutcome};
use crate::shutdown::ShutdownSignal;

/// Statistics for a listener
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Sessions created (accepted connections or new UDP sources).
    pub sessions_accepted: AtomicU64,
    /// Sessions currently holding a slot.
    pub sessions_active: AtomicU64,
    /// Sessions refused because the rule's session limit was reached.
    pub sessions_rejected: AtomicU64,
    /// Sessions whose target could not be dialed.
    pub dial_failures: AtomicU64,
    /// Sessions closed for inactivity.
    pub idle_timeouts: AtomicU64,
    /// Sessions torn down by an I/O error.
    pub session_errors: AtomicU64,
    /// Datagrams dropped because a UDP session queue was full.
    pub datagrams_dropped: AtomicU64,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub rule: String,
    pub sessions_accepted: u64,
    pub sessions_active: u64,
    pub sessions_rejected: u64,
    pub dial_failures: u64,
    pub idle_timeouts: u64,
    pub session_errors: u64,
    pub datagrams_dropped: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl ListenerStats {
    pub fn active(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    /// Fold a finished session into the counters
    pub fn record_outcome(&self, outcome: &SessionOutcome) {
        self.bytes_up.fetch_add(outcome.bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(outcome.bytes_down, Ordering::Relaxed);

        match outcome.reason {
            CloseReason::DialFailed(_) => {
                self.dial_failures.fetch_add(1, Ordering::Relaxed);
            }
            CloseReason::IdleTimeout => {
                self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            CloseReason::Error(_) => {
                self.session_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self, rule: &str) -> StatsSnapshot {
        StatsSnapshot {
            rule: rule.to_string(),
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            idle_timeouts: self.idle_timeouts.load(Ordering::Relaxed),
            session_errors: self.session_errors.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

/// Log a snapshot of every listener each `interval` until shutdown
pub fn spawn_stats_reporter(
    listeners: Vec<(String, Arc<ListenerStats>)>,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (rule, stats) in &listeners {
                        let snapshot = stats.snapshot(rule);
                        info!(
                            rule = %snapshot.rule,
                            active = snapshot.sessions_active,
                            accepted = snapshot.sessions_accepted,
                            rejected = snapshot.sessions_rejected,
                            dial_failures = snapshot.dial_failures,
                            idle_timeouts = snapshot.idle_timeouts,
                            bytes_up = snapshot.bytes_up,
                            bytes_down = snapshot.bytes_down,
                            "Listener stats"
                        );
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
