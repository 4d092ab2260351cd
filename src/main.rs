//! Iriguchikun - multi-rule TCP/UDP/unix socket forwarding proxy

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use iriguchikun::{
    config::{CliOverrides, ConfigManager},
    metrics::spawn_stats_reporter,
    Config, ListenerManager, ShutdownCoordinator,
};

/// Stats interval used by `--debug`
const DEBUG_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Target of the single rule when no dial address or configuration is given
const DEFAULT_DIAL_ADDR: &str = "127.0.0.1:3306";

type LogFilterHandle = reload::Handle<EnvFilter, Registry>;

/// CLI arguments for iriguchikun
#[derive(Parser, Debug)]
#[command(name = "iriguchikun")]
#[command(about = "Forwarding proxy for TCP, UDP and unix domain sockets")]
#[command(disable_version_flag = true)]
#[command(long_about = "
Forwarding proxy for TCP, UDP and unix domain sockets.

Either load a set of rules from a configuration file (-c), or describe a
single rule with --listen-network/--listen-addr/--dial-network/--dial-addr.
Without either, iriguchikun.toml in the working directory is loaded if it
exists; otherwise the single rule forwards :5444 to 127.0.0.1:3306.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file
4. Built-in defaults

Environment variables:
  IRIGUCHIKUN_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
  IRIGUCHIKUN_SHUTDOWN_TIMEOUT - Shutdown grace period (e.g., 30s)
  IRIGUCHIKUN_IDLE_TIMEOUT     - Default idle timeout (e.g., 1m)
  IRIGUCHIKUN_BUFFER_SIZE      - Default relay buffer size in bytes
")]
pub struct CliArgs {
    /// Print the version and exit
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    /// Listen network for the single-rule mode: tcp, udp or unix
    #[arg(long, default_value = "tcp")]
    pub listen_network: String,

    /// Listen address for the single-rule mode
    #[arg(long, default_value = ":5444")]
    pub listen_addr: String,

    /// Dial network for the single-rule mode: tcp, udp or unix
    #[arg(long, default_value = "tcp")]
    pub dial_network: String,

    /// Dial address for the single-rule mode
    #[arg(long)]
    pub dial_addr: Option<String>,

    /// Dial the target over TLS
    #[arg(long)]
    pub dial_tls: bool,

    /// Accept any certificate when dialing over TLS
    #[arg(long)]
    pub tls_skip_verify: bool,

    /// Timeout for connecting to the target (e.g., 5s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub dial_timeout: Option<Duration>,

    /// Close a session after this long without traffic (e.g., 1m)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub idle_timeout: Option<Duration>,

    /// Absolute lifetime limit of a session (e.g., 1h)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub pipe_deadline: Option<Duration>,

    /// Relay buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Maximum concurrent sessions per rule
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Enable TCP keepalive (true/false)
    #[arg(long)]
    pub keepalive: Option<bool>,

    /// TCP keepalive period (e.g., 10s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub keepalive_period: Option<Duration>,

    /// Grace period for sessions on shutdown (e.g., 30s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Debug logging plus per-second listener stats
    #[arg(long)]
    pub debug: bool,

    /// Validate configuration, print the resolved rules and exit
    #[arg(long)]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            log_level: if self.debug {
                Some("debug".to_string())
            } else {
                self.log_level.clone()
            },
            shutdown_timeout: self.shutdown_timeout,
            stats_interval: self.debug.then_some(DEBUG_STATS_INTERVAL),
            dial_timeout: self.dial_timeout,
            idle_timeout: self.idle_timeout,
            session_deadline: self.pipe_deadline,
            buffer_size: self.buffer_size,
            max_sessions: self.max_sessions,
            keepalive: self.keepalive,
            keepalive_interval: self.keepalive_period,
            dial_tls: self.dial_tls.then_some(true),
            tls_skip_verify: self.tls_skip_verify.then_some(true),
        }
    }

    /// Log level to use until the configuration is loaded
    fn bootstrap_log_level(&self) -> String {
        self.overrides()
            .log_level
            .or_else(|| std::env::var("IRIGUCHIKUN_LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    if args.version {
        println!("version: {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let log_filter = init_tracing(&args.bootstrap_log_level())?;

    let config = load_config(&args, Path::new("."))?;
    apply_log_level(&log_filter, &config.server.log_level)?;

    info!("Starting iriguchikun v{}", env!("CARGO_PKG_VERSION"));

    let rules = config
        .resolve_rules()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid ({} rules)", rules.len());
        for rule in &rules {
            println!("{}", rule);
        }
        return Ok(());
    }

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let manager = ListenerManager::new(shutdown_coordinator.clone());

    let handles = manager.start_all(rules).await;
    if handles.is_empty() {
        bail!("No listener could be started");
    }
    info!("{} listeners running", handles.len());

    let reporter = config.server.stats_interval.map(|interval| {
        let listeners = handles
            .iter()
            .map(|h| (h.rule().name.clone(), h.stats()))
            .collect();
        spawn_stats_reporter(listeners, interval, shutdown_coordinator.subscribe())
    });

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Initiating graceful shutdown...");
    if !manager.shutdown(handles).await {
        error!("Some sessions were still active when the grace period ended");
    }

    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Build the configuration: file or single-rule flags, then env, then CLI.
///
/// With neither `--config` nor `--dial-addr`, the default configuration file
/// in `search_dir` is used, or the single rule with its default target.
fn load_config(args: &CliArgs, search_dir: &Path) -> Result<Config> {
    let single_rule = |dial_addr: &str| {
        Config::from_single_rule(
            &args.listen_network,
            &args.listen_addr,
            &args.dial_network,
            dial_addr,
        )
    };

    let mut config = match (&args.config, &args.dial_addr) {
        (Some(path), _) => ConfigManager::load_from_file(path)?,
        (None, Some(dial_addr)) => single_rule(dial_addr),
        (None, None) => match ConfigManager::find_default(search_dir) {
            Some(path) => ConfigManager::load_from_file(&path)?,
            None => {
                info!(
                    "No configuration given, forwarding {} to {}",
                    args.listen_addr, DEFAULT_DIAL_ADDR
                );
                single_rule(DEFAULT_DIAL_ADDR)
            }
        },
    };

    ConfigManager::apply_env_overrides(&mut config)?;
    config.merge_with_cli_args(&args.overrides());

    config
        .validate()
        .context("Final configuration validation failed")?;
    Ok(config)
}

/// Initialize tracing/logging.
///
/// The filter stays reloadable so the level from the configuration file can
/// take over once it is loaded.
fn init_tracing(log_level: &str) -> Result<LogFilterHandle> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let (env_filter, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .init();

    Ok(handle)
}

/// Switch logging to the configured level; `RUST_LOG` still wins
fn apply_log_level(handle: &LogFilterHandle, log_level: &str) -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        handle
            .reload(EnvFilter::new(log_level))
            .context("Failed to apply the configured log level")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iriguchikun::config::{Protocol, DEFAULT_CONFIG_FILE};

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("iriguchikun").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_configured_level_replaces_bootstrap_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }

        let (filter, handle) = reload::Layer::new(EnvFilter::new("info"));
        let subscriber = Registry::default().with(filter);
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(tracing::Level::INFO));
            assert!(!tracing::enabled!(tracing::Level::DEBUG));

            apply_log_level(&handle, "debug").unwrap();
            assert!(tracing::enabled!(tracing::Level::DEBUG));
        });
    }

    #[test]
    fn test_no_flags_uses_built_in_rule() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&parse(&[]), dir.path()).unwrap();

        let rules = config.resolve_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].protocol, Protocol::Tcp);
        assert_eq!(rules[0].listen.to_string(), "0.0.0.0:5444");
        assert_eq!(rules[0].target.to_string(), DEFAULT_DIAL_ADDR);
    }

    #[test]
    fn test_no_flags_loads_default_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            r#"
[[rules]]
name = "dns"
protocol = "udp"
listen = ":5353"
target = "10.0.0.53:53"
"#,
        )
        .unwrap();

        let config = load_config(&parse(&[]), dir.path()).unwrap();
        let rules = config.resolve_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "dns");
    }

    #[test]
    fn test_dial_addr_takes_precedence_over_default_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "").unwrap();

        let args = parse(&["--dial-addr", "db.internal:5432", "--dial-tls", "--tls-skip-verify"]);
        let config = load_config(&args, dir.path()).unwrap();
        let rules = config.resolve_rules().unwrap();
        assert_eq!(rules[0].target.to_string(), "db.internal:5432");
        assert!(rules[0].settings.dial_tls);
        assert!(rules[0].settings.tls_skip_verify);
    }
}
