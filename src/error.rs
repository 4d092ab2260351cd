//! Error Types
//!
//! Typed errors for the proxy core. Application seams (file loading, the
//! binary) wrap these in `anyhow` with context.

use std::io;
use std::time::Duration;

/// Errors raised while turning configuration into proxy rules.
///
/// Always fatal: the process refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no proxy rules configured")]
    NoRules,

    #[error("rule {index}: unrecognized protocol '{value}' (expected tcp, udp or unix)")]
    UnknownProtocol { index: usize, value: String },

    #[error("rule {index}: cannot parse {field} address '{value}': {reason}")]
    InvalidAddress {
        index: usize,
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("rule {index}: listen address {address} is already used by rule {first}")]
    DuplicateListen {
        index: usize,
        first: usize,
        address: String,
    },

    #[error("rule {index}: a {listen} listener cannot forward to a {target} target")]
    IncompatibleProtocols {
        index: usize,
        listen: String,
        target: String,
    },

    #[error("rule {index}: {field} {message}")]
    InvalidSetting {
        index: usize,
        field: &'static str,
        message: String,
    },

    #[error("server.{field} {message}")]
    InvalidServerSetting { field: &'static str, message: String },
}

/// Runtime errors of listeners and sessions.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Listening resource could not be bound. Fatal for the rule only.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Target refused or was unreachable. Fatal for the session only.
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("dialing {target} timed out after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },

    #[error("session limit of {limit} reached for rule {rule}")]
    SessionLimit { rule: String, limit: usize },

    /// TLS client settings of a rule could not be built. Fatal for the rule.
    #[error("invalid TLS client configuration: {0}")]
    TlsConfig(#[source] rustls::Error),
}

impl ProxyError {
    /// Whether the error was caused by the target side of a session.
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, ProxyError::Dial { .. } | ProxyError::DialTimeout { .. })
    }
}
