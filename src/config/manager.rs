//! Configuration Manager

use super::{Address, Config, Protocol, ProxyRule, RuleConfig, SessionSettings};
use super::types::{MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::error::ConfigError;
use crate::Result;
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration file picked up from the working directory when neither a
/// file nor a single rule is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "iriguchikun.toml";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file.
    ///
    /// The format follows the extension: `.yaml`/`.yml`, `.json`, anything
    /// else is read as TOML.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        let config: Config = match extension.as_deref() {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        };

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        tracing::info!(
            "Configuration loaded and validated successfully ({} rules)",
            config.rules.len()
        );
        Ok(config)
    }

    /// The default configuration file in `dir`, if there is one
    pub fn find_default(dir: &Path) -> Option<PathBuf> {
        let path = dir.join(DEFAULT_CONFIG_FILE);
        path.is_file().then_some(path)
    }

    /// Override configuration values with environment variables if present
    pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
        if let Ok(log_level) = std::env::var("IRIGUCHIKUN_LOG_LEVEL") {
            config.server.log_level = log_level;
        }

        if let Ok(timeout) = std::env::var("IRIGUCHIKUN_SHUTDOWN_TIMEOUT") {
            config.server.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid IRIGUCHIKUN_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Ok(timeout) = std::env::var("IRIGUCHIKUN_IDLE_TIMEOUT") {
            config.defaults.idle_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid IRIGUCHIKUN_IDLE_TIMEOUT: {}", timeout))?;
        }

        if let Ok(buffer_size) = std::env::var("IRIGUCHIKUN_BUFFER_SIZE") {
            config.defaults.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid IRIGUCHIKUN_BUFFER_SIZE: {}", buffer_size))?;
        }

        Ok(())
    }
}

/// Values supplied on the command line; `None` leaves the loaded value alone
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub log_level: Option<String>,
    pub shutdown_timeout: Option<Duration>,
    pub stats_interval: Option<Duration>,
    pub dial_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub session_deadline: Option<Duration>,
    pub buffer_size: Option<usize>,
    pub max_sessions: Option<usize>,
    pub keepalive: Option<bool>,
    pub keepalive_interval: Option<Duration>,
    pub dial_tls: Option<bool>,
    pub tls_skip_verify: Option<bool>,
}

impl Config {
    /// Build a single-rule configuration from listen/dial network and address
    pub fn from_single_rule(
        listen_network: &str,
        listen_addr: &str,
        dial_network: &str,
        dial_addr: &str,
    ) -> Config {
        let target_protocol = if listen_network.eq_ignore_ascii_case(dial_network) {
            None
        } else {
            Some(dial_network.to_string())
        };

        Config {
            rules: vec![RuleConfig {
                name: None,
                protocol: listen_network.to_string(),
                listen: listen_addr.to_string(),
                target: dial_addr.to_string(),
                target_protocol,
                overrides: Default::default(),
            }],
            ..Config::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.validate_server_config()?;
        self.resolve_rules().map(|_| ())
    }

    fn validate_server_config(&self) -> std::result::Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.server.log_level.as_str()) {
            return Err(ConfigError::InvalidServerSetting {
                field: "log_level",
                message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
            });
        }

        if self.server.stats_interval == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidServerSetting {
                field: "stats_interval",
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Turn the `[[rules]]` entries into validated proxy rules, in order
    pub fn resolve_rules(&self) -> std::result::Result<Vec<ProxyRule>, ConfigError> {
        if self.rules.is_empty() {
            return Err(ConfigError::NoRules);
        }

        let mut seen: HashMap<Address, usize> = HashMap::new();
        let mut rules = Vec::with_capacity(self.rules.len());

        for (index, entry) in self.rules.iter().enumerate() {
            let rule = resolve_rule(index, entry, &self.defaults)?;

            if !rule.listen.is_ephemeral() {
                if let Some(&first) = seen.get(&rule.listen) {
                    return Err(ConfigError::DuplicateListen {
                        index,
                        first,
                        address: rule.listen.to_string(),
                    });
                }
                seen.insert(rule.listen.clone(), index);
            }

            rules.push(rule);
        }

        Ok(rules)
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, cli: &CliOverrides) {
        if let Some(log_level) = &cli.log_level {
            self.server.log_level = log_level.clone();
        }

        if let Some(timeout) = cli.shutdown_timeout {
            self.server.shutdown_timeout = timeout;
            tracing::info!("CLI override: shutdown timeout set to {:?}", timeout);
        }

        if let Some(interval) = cli.stats_interval {
            self.server.stats_interval = Some(interval);
        }

        let defaults = &mut self.defaults;
        if let Some(timeout) = cli.dial_timeout {
            defaults.dial_timeout = timeout;
            tracing::info!("CLI override: dial timeout set to {:?}", timeout);
        }

        if let Some(timeout) = cli.idle_timeout {
            defaults.idle_timeout = timeout;
            tracing::info!("CLI override: idle timeout set to {:?}", timeout);
        }

        if let Some(deadline) = cli.session_deadline {
            defaults.session_deadline = Some(deadline);
            tracing::info!("CLI override: session deadline set to {:?}", deadline);
        }

        if let Some(buffer_size) = cli.buffer_size {
            defaults.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(max_sessions) = cli.max_sessions {
            defaults.max_sessions = max_sessions;
            tracing::info!("CLI override: max sessions set to {}", max_sessions);
        }

        if let Some(keepalive) = cli.keepalive {
            defaults.keepalive = keepalive;
        }

        if let Some(interval) = cli.keepalive_interval {
            defaults.keepalive_interval = interval;
        }

        if let Some(dial_tls) = cli.dial_tls {
            defaults.dial_tls = dial_tls;
            tracing::info!("CLI override: TLS dialing {}", if dial_tls { "on" } else { "off" });
        }

        if let Some(skip_verify) = cli.tls_skip_verify {
            defaults.tls_skip_verify = skip_verify;
        }
    }
}

fn resolve_rule(
    index: usize,
    entry: &RuleConfig,
    defaults: &SessionSettings,
) -> std::result::Result<ProxyRule, ConfigError> {
    let protocol = parse_protocol(index, &entry.protocol)?;
    let target_protocol = match &entry.target_protocol {
        Some(value) => parse_protocol(index, value)?,
        None => protocol,
    };

    if protocol.is_stream() != target_protocol.is_stream() {
        return Err(ConfigError::IncompatibleProtocols {
            index,
            listen: protocol.to_string(),
            target: target_protocol.to_string(),
        });
    }

    let listen = Address::parse(protocol, &entry.listen, false).map_err(|reason| {
        ConfigError::InvalidAddress {
            index,
            field: "listen",
            value: entry.listen.clone(),
            reason,
        }
    })?;
    let target = Address::parse(target_protocol, &entry.target, true).map_err(|reason| {
        ConfigError::InvalidAddress {
            index,
            field: "target",
            value: entry.target.clone(),
            reason,
        }
    })?;

    let settings = defaults.with_overrides(&entry.overrides);
    validate_settings(index, &settings)?;
    if settings.dial_tls && target_protocol != Protocol::Tcp {
        return Err(ConfigError::InvalidSetting {
            index,
            field: "dial_tls",
            message: format!("requires a tcp target, not {}", target_protocol),
        });
    }

    let name = entry
        .name
        .clone()
        .unwrap_or_else(|| format!("{}:{}", protocol, listen));

    Ok(ProxyRule {
        name,
        protocol,
        listen,
        target_protocol,
        target,
        settings,
    })
}

fn parse_protocol(index: usize, value: &str) -> std::result::Result<Protocol, ConfigError> {
    value
        .parse::<Protocol>()
        .map_err(|_| ConfigError::UnknownProtocol {
            index,
            value: value.to_string(),
        })
}

fn validate_settings(
    index: usize,
    settings: &SessionSettings,
) -> std::result::Result<(), ConfigError> {
    let invalid = |field: &'static str, message: &str| ConfigError::InvalidSetting {
        index,
        field,
        message: message.to_string(),
    };

    if settings.idle_timeout.is_zero() {
        return Err(invalid("idle_timeout", "must be greater than 0"));
    }
    if settings.dial_timeout.is_zero() {
        return Err(invalid("dial_timeout", "must be greater than 0"));
    }
    if settings.session_deadline == Some(Duration::ZERO) {
        return Err(invalid("session_deadline", "must be greater than 0"));
    }
    if settings.buffer_size < MIN_BUFFER_SIZE || settings.buffer_size > MAX_BUFFER_SIZE {
        return Err(ConfigError::InvalidSetting {
            index,
            field: "buffer_size",
            message: format!(
                "must be between {} and {} bytes",
                MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            ),
        });
    }
    if settings.max_sessions == 0 {
        return Err(invalid("max_sessions", "must be greater than 0"));
    }
    if settings.udp_queue_depth == 0 {
        return Err(invalid("udp_queue_depth", "must be greater than 0"));
    }
    if settings.keepalive && settings.keepalive_interval.is_zero() {
        return Err(invalid("keepalive_interval", "must be greater than 0"));
    }

    Ok(())
}
