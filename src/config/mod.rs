//! Configuration Module
//!
//! Handles configuration loading, validation, and resolution into proxy rules.

pub mod manager;
pub mod rule;
pub mod types;

pub use manager::{CliOverrides, ConfigManager, DEFAULT_CONFIG_FILE};
pub use rule::{Address, Protocol, ProxyRule};
pub use types::*;
