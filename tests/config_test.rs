//! Integration tests for configuration loading

use std::io::Write;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use iriguchikun::config::{CliOverrides, ConfigManager, Protocol, DEFAULT_CONFIG_FILE};
use iriguchikun::{Config, ConfigError};

fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_toml_config() {
    let file = write_config(
        ".toml",
        r#"
[server]
shutdown_timeout = "10s"
log_level = "debug"

[defaults]
idle_timeout = "2m"

[[rules]]
name = "web"
protocol = "tcp"
listen = ":8080"
target = "backend.internal:80"
buffer_size = 4096

[[rules]]
protocol = "udp"
listen = "127.0.0.1:5353"
target = "10.0.0.53:53"
"#,
    );

    let config = assert_ok!(ConfigManager::load_from_file(file.path()));
    assert_eq!(config.server.shutdown_timeout, Duration::from_secs(10));
    assert_eq!(config.server.log_level, "debug");

    let rules = config.resolve_rules().unwrap();
    assert_eq!(rules.len(), 2);

    assert_eq!(rules[0].name, "web");
    assert_eq!(rules[0].settings.buffer_size, 4096);
    assert_eq!(rules[0].settings.idle_timeout, Duration::from_secs(120));
    assert_eq!(rules[0].target.to_string(), "backend.internal:80");

    assert_eq!(rules[1].name, "udp:127.0.0.1:5353");
    assert_eq!(rules[1].protocol, Protocol::Udp);
    assert_eq!(rules[1].settings.buffer_size, 32 * 1024);
    assert_eq!(rules[1].settings.idle_timeout, Duration::from_secs(120));
}

#[test]
fn test_load_yaml_config() {
    let file = write_config(
        ".yaml",
        r#"
rules:
  - protocol: unix
    listen: /tmp/iriguchikun-in.sock
    target_protocol: tcp
    target: 127.0.0.1:9000
    idle_timeout: 30s
"#,
    );

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    let rules = config.resolve_rules().unwrap();
    assert_eq!(rules[0].protocol, Protocol::Unix);
    assert_eq!(rules[0].target_protocol, Protocol::Tcp);
    assert_eq!(rules[0].settings.idle_timeout, Duration::from_secs(30));
}

#[test]
fn test_load_json_config() {
    let file = write_config(
        ".json",
        r#"{"rules": [{"protocol": "tcp", "listen": ":9000", "target": "127.0.0.1:9001",
                      "max_sessions": 10}]}"#,
    );

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    let rules = config.resolve_rules().unwrap();
    assert_eq!(rules[0].settings.max_sessions, 10);
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let duplicate = write_config(
        ".toml",
        r#"
[[rules]]
protocol = "tcp"
listen = ":9000"
target = "127.0.0.1:9001"

[[rules]]
protocol = "udp"
listen = "0.0.0.0:9000"
target = "127.0.0.1:9002"
"#,
    );
    assert_err!(ConfigManager::load_from_file(duplicate.path()));

    let unknown = write_config(
        ".toml",
        r#"
[[rules]]
protocol = "sctp"
listen = ":9000"
target = "127.0.0.1:9001"
"#,
    );
    let err = assert_err!(ConfigManager::load_from_file(unknown.path()));
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::UnknownProtocol { .. })
    ));

    let empty = write_config(".toml", "");
    let err = ConfigManager::load_from_file(empty.path()).unwrap_err();
    assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::NoRules)));
}

#[test]
fn test_single_rule_with_overrides() {
    let mut config = Config::from_single_rule("tcp", ":5444", "unix", "/tmp/target.sock");
    config.merge_with_cli_args(&CliOverrides {
        idle_timeout: Some(Duration::from_secs(5)),
        session_deadline: Some(Duration::from_secs(3600)),
        ..Default::default()
    });

    let rules = assert_ok!(config.resolve_rules());
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].name, "tcp:0.0.0.0:5444");
    assert_eq!(rules[0].target_protocol, Protocol::Unix);
    assert_eq!(rules[0].settings.idle_timeout, Duration::from_secs(5));
    assert_eq!(rules[0].settings.session_deadline, Some(Duration::from_secs(3600)));
}

#[test]
fn test_default_file_lookup() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ConfigManager::find_default(dir.path()).is_none());

    // A directory with the same name is not a configuration file.
    std::fs::create_dir(dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
    assert!(ConfigManager::find_default(dir.path()).is_none());
    std::fs::remove_dir(dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();

    std::fs::write(
        dir.path().join(DEFAULT_CONFIG_FILE),
        "[[rules]]\nprotocol = \"tcp\"\nlisten = \":9000\"\ntarget = \"127.0.0.1:9001\"\n",
    )
    .unwrap();
    let path = ConfigManager::find_default(dir.path()).unwrap();
    let config = assert_ok!(ConfigManager::load_from_file(&path));
    assert_eq!(config.rules.len(), 1);
}

#[test]
fn test_tls_settings_from_file() {
    let file = write_config(
        ".toml",
        r#"
[defaults]
tls_skip_verify = true

[[rules]]
protocol = "tcp"
listen = ":9443"
target = "db.internal:5432"
dial_tls = true

[[rules]]
protocol = "tcp"
listen = ":9000"
target = "127.0.0.1:9001"
"#,
    );

    let rules = ConfigManager::load_from_file(file.path())
        .unwrap()
        .resolve_rules()
        .unwrap();
    assert!(rules[0].settings.dial_tls);
    assert!(rules[0].settings.tls_skip_verify);
    assert!(!rules[1].settings.dial_tls);
}
