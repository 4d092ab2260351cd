//! Relay Session

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a session: `Connecting -> Relaying -> Closing -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Relaying,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Relaying,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Both directions reached EOF.
    Completed,
    /// No bytes flowed for the idle timeout.
    IdleTimeout,
    /// The absolute session deadline passed.
    Deadline,
    /// The remaining direction did not finish within the drain grace period.
    DrainTimeout,
    /// Process shutdown.
    Shutdown,
    /// The target could not be dialed.
    DialFailed(String),
    /// I/O error on either endpoint.
    Error(String),
}

impl CloseReason {
    /// Whether the operator should hear about this at warn level
    pub fn is_failure(&self) -> bool {
        matches!(self, CloseReason::DialFailed(_) | CloseReason::Error(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Completed => write!(f, "completed"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Deadline => write!(f, "session deadline"),
            CloseReason::DrainTimeout => write!(f, "drain timeout"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::DialFailed(e) => write!(f, "dial failed: {}", e),
            CloseReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Final result of a session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub reason: CloseReason,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration: Duration,
}

/// Represents an active relay session
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub rule: String,
    pub client: String,
    pub target: String,
    pub start_time: Instant,
    state: AtomicU8,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl RelaySession {
    /// Create a new session in the `Connecting` state
    pub fn new(
        rule: impl Into<String>,
        client: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let session = Self {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            rule: rule.into(),
            client: client.into(),
            target: target.into(),
            start_time: Instant::now(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        };
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session.session_id, session.client, session.target
        );
        session
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`. States only advance; stale transitions are ignored.
    pub fn set_state(&self, next: SessionState) {
        let previous = self.state.fetch_max(next as u8, Ordering::AcqRel);
        if previous < next as u8 {
            debug!(
                session_id = %self.session_id,
                "Session state {:?} -> {:?}",
                SessionState::from_u8(previous),
                next
            );
        }
    }

    /// Get bytes transferred upstream (client to target)
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Get bytes transferred downstream (target to client)
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Mark the session closed and produce its outcome
    pub fn finish(&self, reason: CloseReason) -> SessionOutcome {
        self.set_state(SessionState::Closed);
        SessionOutcome {
            reason,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            duration: self.duration(),
        }
    }

    /// Log session completion; failures are logged at warn level
    pub fn log_outcome(&self, outcome: &SessionOutcome) {
        let duration_ms = outcome.duration.as_millis() as u64;
        if outcome.reason.is_failure() {
            warn!(
                session_id = %self.session_id,
                rule = %self.rule,
                client = %self.client,
                target = %self.target,
                duration_ms,
                bytes_up = outcome.bytes_up,
                bytes_down = outcome.bytes_down,
                reason = %outcome.reason,
                "Relay session failed"
            );
        } else {
            info!(
                session_id = %self.session_id,
                rule = %self.rule,
                client = %self.client,
                target = %self.target,
                duration_ms,
                bytes_up = outcome.bytes_up,
                bytes_down = outcome.bytes_down,
                reason = %outcome.reason,
                "Relay session closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_only_advances() {
        let session = RelaySession::new("tcp:0.0.0.0:9000", "127.0.0.1:5000", "127.0.0.1:9001");
        assert_eq!(session.state(), SessionState::Connecting);

        session.set_state(SessionState::Closing);
        session.set_state(SessionState::Relaying);
        assert_eq!(session.state(), SessionState::Closing);

        let outcome = session.finish(CloseReason::Completed);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(outcome.reason, CloseReason::Completed);
    }

    #[test]
    fn test_outcome_carries_byte_counts() {
        let session = RelaySession::new("rule", "client", "target");
        session.add_bytes_up(1024);
        session.add_bytes_down(2048);
        session.add_bytes_down(1);
        assert_eq!(session.session_id.len(), 32);

        let outcome = session.finish(CloseReason::Deadline);
        assert_eq!(outcome.bytes_up, 1024);
        assert_eq!(outcome.bytes_down, 2049);
        assert_eq!(outcome.reason, CloseReason::Deadline);
    }

    #[test]
    fn test_close_reason_severity() {
        assert!(!CloseReason::IdleTimeout.is_failure());
        assert!(!CloseReason::Shutdown.is_failure());
        assert!(CloseReason::Error("broken pipe".into()).is_failure());
    }
}
