//! Relay Engine

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, warn};

use super::session::{CloseReason, RelaySession, SessionOutcome, SessionState};
use crate::config::SessionSettings;
use crate::shutdown::ShutdownSignal;

/// Direction of a relay task within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to target
    Upstream,
    /// Target to client
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "upstream"),
            Direction::Downstream => write!(f, "downstream"),
        }
    }
}

/// Last time any byte moved in a session, shared by both directions
#[derive(Debug)]
pub struct ActivityTracker {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once `activity` has been idle for `idle_timeout`
pub async fn idle_expired(activity: &ActivityTracker, idle_timeout: Duration) {
    loop {
        let idle = activity.idle_for();
        if idle >= idle_timeout {
            return;
        }
        sleep(idle_timeout - idle).await;
    }
}

async fn deadline_expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Copy bytes from `reader` to `writer` through a bounded buffer until EOF.
///
/// EOF is forwarded as a half-close of `writer`. Returns the number of bytes
/// copied.
pub async fn pump<R, W, F>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    activity: &ActivityTracker,
    mut on_bytes: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            match writer.shutdown().await {
                Ok(()) => {}
                // Peer already gone; nothing left to half-close.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e),
            }
            return Ok(total);
        }

        activity.touch();
        writer.write_all(&buf[..n]).await?;
        activity.touch();

        total += n as u64;
        on_bytes(n as u64);
    }
}

fn join_result(result: Result<io::Result<u64>, JoinError>) -> io::Result<u64> {
    result.unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e)))
}

enum FirstEvent {
    Finished(Direction, io::Result<u64>),
    Expired(CloseReason),
    Shutdown,
}

/// Pumps both directions of a session and drives it from `Relaying` to `Closed`
#[derive(Debug, Clone)]
pub struct RelayEngine {
    buffer_size: usize,
    idle_timeout: Duration,
    drain_timeout: Duration,
    session_deadline: Option<Duration>,
    shutdown_grace: Duration,
}

impl RelayEngine {
    /// Create a new relay engine from rule settings
    pub fn new(settings: &SessionSettings, shutdown_grace: Duration) -> Self {
        Self {
            buffer_size: settings.buffer_size,
            idle_timeout: settings.idle_timeout,
            drain_timeout: settings.drain_timeout,
            session_deadline: settings.session_deadline,
            shutdown_grace,
        }
    }

    /// Relay bidirectionally between `inbound` and `outbound` until the
    /// session closes.
    ///
    /// One task per direction. The first direction to hit EOF half-closes its
    /// destination and the other direction may keep flowing for the drain
    /// period; an error in either direction closes both immediately.
    pub async fn relay<A, B>(
        &self,
        session: Arc<RelaySession>,
        inbound: A,
        outbound: B,
        mut shutdown: ShutdownSignal,
    ) -> SessionOutcome
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let activity = Arc::new(ActivityTracker::new());
        let (in_read, in_write) = tokio::io::split(inbound);
        let (out_read, out_write) = tokio::io::split(outbound);

        let mut upstream =
            self.spawn_direction(Direction::Upstream, in_read, out_write, &session, &activity);
        let mut downstream =
            self.spawn_direction(Direction::Downstream, out_read, in_write, &session, &activity);

        session.set_state(SessionState::Relaying);
        let deadline = self.session_deadline.map(|d| Instant::now() + d);

        let first = tokio::select! {
            result = &mut upstream => {
                FirstEvent::Finished(Direction::Upstream, join_result(result))
            }
            result = &mut downstream => {
                FirstEvent::Finished(Direction::Downstream, join_result(result))
            }
            _ = idle_expired(&activity, self.idle_timeout) => {
                FirstEvent::Expired(CloseReason::IdleTimeout)
            }
            _ = deadline_expired(deadline) => FirstEvent::Expired(CloseReason::Deadline),
            _ = shutdown.recv() => FirstEvent::Shutdown,
        };

        session.set_state(SessionState::Closing);

        let reason = match first {
            FirstEvent::Finished(direction, Ok(bytes)) => {
                debug!(
                    session_id = %session.session_id,
                    "{} direction reached EOF after {} bytes, draining the other",
                    direction, bytes
                );
                let remaining = match direction {
                    Direction::Upstream => &mut downstream,
                    Direction::Downstream => &mut upstream,
                };
                self.drain(remaining, &activity, deadline).await
            }
            FirstEvent::Finished(direction, Err(e)) => {
                CloseReason::Error(format!("{} relay: {}", direction, e))
            }
            FirstEvent::Expired(reason) => reason,
            FirstEvent::Shutdown => {
                debug!(
                    session_id = %session.session_id,
                    "Shutdown requested, draining for up to {:?}",
                    self.shutdown_grace
                );
                self.drain_both(&mut upstream, &mut downstream, &activity).await
            }
        };

        upstream.abort();
        downstream.abort();

        session.finish(reason)
    }

    fn spawn_direction<R, W>(
        &self,
        direction: Direction,
        reader: R,
        writer: W,
        session: &Arc<RelaySession>,
        activity: &Arc<ActivityTracker>,
    ) -> JoinHandle<io::Result<u64>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = Arc::clone(session);
        let activity = Arc::clone(activity);
        let buffer_size = self.buffer_size;

        tokio::spawn(async move {
            let result = pump(reader, writer, buffer_size, &activity, |n| match direction {
                Direction::Upstream => session.add_bytes_up(n),
                Direction::Downstream => session.add_bytes_down(n),
            })
            .await;

            if let Err(e) = &result {
                debug!(
                    session_id = %session.session_id,
                    "{} relay ended with error: {}",
                    direction,
                    e
                );
            }
            result
        })
    }

    /// Let the still-open direction finish after the other hit EOF
    async fn drain(
        &self,
        remaining: &mut JoinHandle<io::Result<u64>>,
        activity: &ActivityTracker,
        deadline: Option<Instant>,
    ) -> CloseReason {
        tokio::select! {
            result = remaining => match join_result(result) {
                Ok(_) => CloseReason::Completed,
                Err(e) => CloseReason::Error(e.to_string()),
            },
            _ = idle_expired(activity, self.idle_timeout) => CloseReason::IdleTimeout,
            _ = deadline_expired(deadline) => CloseReason::Deadline,
            _ = sleep(self.drain_timeout) => CloseReason::DrainTimeout,
        }
    }

    /// Give both directions the shutdown grace period
    async fn drain_both(
        &self,
        upstream: &mut JoinHandle<io::Result<u64>>,
        downstream: &mut JoinHandle<io::Result<u64>>,
        activity: &ActivityTracker,
    ) -> CloseReason {
        let both = async {
            let (up, down) = tokio::join!(upstream, downstream);
            (join_result(up), join_result(down))
        };

        tokio::select! {
            result = timeout(self.shutdown_grace, both) => match result {
                Ok((Ok(_), Ok(_))) => CloseReason::Completed,
                Ok((Err(e), _)) | Ok((_, Err(e))) => CloseReason::Error(e.to_string()),
                Err(_) => {
                    warn!("Session did not drain within {:?}, forcing close", self.shutdown_grace);
                    CloseReason::Shutdown
                }
            },
            _ = idle_expired(activity, self.idle_timeout) => CloseReason::Shutdown,
        }
    }
}
