//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_SESSIONS: usize = 1000;
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_UDP_QUEUE_DEPTH: usize = 64;

pub const MIN_BUFFER_SIZE: usize = 512;
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub defaults: SessionSettings,
    pub rules: Vec<RuleConfig>,
}

/// Process-wide settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Grace period sessions get to drain after a shutdown signal.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub log_level: String,
    /// Period of the per-listener stats report. Disabled when absent.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub stats_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            stats_interval: None,
        }
    }
}

/// Fully resolved per-session settings.
///
/// Used as the `[defaults]` table and as the settings of every resolved rule.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// How long the still-open direction may keep flowing once the other
    /// direction has closed.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    /// Absolute session lifetime, regardless of traffic.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub session_deadline: Option<Duration>,
    pub max_sessions: usize,
    pub keepalive: bool,
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    pub udp_queue_depth: usize,
    /// Wrap connections to a tcp target in TLS.
    pub dial_tls: bool,
    /// Accept any server certificate when dialing with TLS.
    pub tls_skip_verify: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            session_deadline: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            keepalive: true,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            udp_queue_depth: DEFAULT_UDP_QUEUE_DEPTH,
            dial_tls: false,
            tls_skip_verify: false,
        }
    }
}

/// One `[[rules]]` entry as written in the configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub protocol: String,
    pub listen: String,
    pub target: String,
    /// Transport used towards the target; defaults to `protocol`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_protocol: Option<String>,
    #[serde(flatten)]
    pub overrides: SessionOverrides,
}

/// Per-rule overrides of [`SessionSettings`]
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionOverrides {
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub dial_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub drain_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub session_deadline: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<bool>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub keepalive_interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_queue_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_tls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_skip_verify: Option<bool>,
}

impl SessionSettings {
    /// Apply per-rule overrides on top of these settings
    pub fn with_overrides(&self, overrides: &SessionOverrides) -> SessionSettings {
        SessionSettings {
            idle_timeout: overrides.idle_timeout.unwrap_or(self.idle_timeout),
            buffer_size: overrides.buffer_size.unwrap_or(self.buffer_size),
            dial_timeout: overrides.dial_timeout.unwrap_or(self.dial_timeout),
            drain_timeout: overrides.drain_timeout.unwrap_or(self.drain_timeout),
            session_deadline: overrides.session_deadline.or(self.session_deadline),
            max_sessions: overrides.max_sessions.unwrap_or(self.max_sessions),
            keepalive: overrides.keepalive.unwrap_or(self.keepalive),
            keepalive_interval: overrides
                .keepalive_interval
                .unwrap_or(self.keepalive_interval),
            udp_queue_depth: overrides.udp_queue_depth.unwrap_or(self.udp_queue_depth),
            dial_tls: overrides.dial_tls.unwrap_or(self.dial_tls),
            tls_skip_verify: overrides.tls_skip_verify.unwrap_or(self.tls_skip_verify),
        }
    }
}
