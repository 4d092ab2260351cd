//! Data Relay Module
//!
//! Handles bidirectional data relay between client and target.

pub mod engine;
pub mod session;

pub use engine::{idle_expired, pump, ActivityTracker, Direction, RelayEngine};
pub use session::{CloseReason, RelaySession, SessionOutcome, SessionState};
