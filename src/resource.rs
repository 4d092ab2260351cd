//! Resource Management
//!
//! Enforces the per-rule session limit.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::metrics::ListenerStats;

/// Hands out at most `limit` concurrent session slots for one rule
#[derive(Debug, Clone)]
pub struct SessionLimiter {
    rule: String,
    limit: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

/// A held session slot; releases itself on drop
#[derive(Debug)]
pub struct SessionSlot {
    _permit: OwnedSemaphorePermit,
    stats: Arc<ListenerStats>,
}

impl SessionLimiter {
    pub fn new(rule: impl Into<String>, limit: usize, stats: Arc<ListenerStats>) -> Self {
        Self {
            rule: rule.into(),
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            stats,
        }
    }

    /// Try to acquire a session slot without waiting
    pub fn try_acquire(&self) -> Result<SessionSlot, ProxyError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.stats.sessions_accepted.fetch_add(1, Ordering::Relaxed);
                let active = self.stats.sessions_active.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Acquired session slot for {}, active sessions: {}", self.rule, active);
                Ok(SessionSlot {
                    _permit: permit,
                    stats: Arc::clone(&self.stats),
                })
            }
            Err(_) => {
                self.stats.sessions_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Session limit reached ({}) for {}, rejecting", self.limit, self.rule);
                Err(ProxyError::SessionLimit {
                    rule: self.rule.clone(),
                    limit: self.limit,
                })
            }
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_slot_acquisition() {
        let stats = Arc::new(ListenerStats::default());
        let limiter = SessionLimiter::new("tcp:127.0.0.1:0", 2, Arc::clone(&stats));

        let slot1 = limiter.try_acquire();
        assert!(slot1.is_ok());
        let slot2 = limiter.try_acquire();
        assert!(slot2.is_ok());

        // Third slot should fail
        assert!(matches!(
            limiter.try_acquire(),
            Err(ProxyError::SessionLimit { limit: 2, .. })
        ));
        assert_eq!(stats.active(), 2);

        drop(slot1);
        assert_eq!(stats.active(), 1);
        assert_eq!(limiter.available(), 1);

        let slot3 = limiter.try_acquire();
        assert!(slot3.is_ok());

        let snapshot = stats.snapshot("tcp");
        assert_eq!(snapshot.sessions_accepted, 3);
        assert_eq!(snapshot.sessions_rejected, 1);
    }
}
