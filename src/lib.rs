//! Iriguchikun Library
//!
//! A multi-rule forwarding proxy. Each rule binds a TCP, UDP or unix domain
//! socket listener and relays every session to a fixed target endpoint.

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod relay;
pub mod resource;
pub mod shutdown;
pub mod tls;
pub mod transport;

pub use config::{Config, ProxyRule};
pub use connection::ConnectionHandler;
pub use error::{ConfigError, ProxyError};
pub use listener::{ListenerHandle, ListenerManager};
pub use shutdown::ShutdownCoordinator;

/// Common error type for the proxy
pub type Result<T> = anyhow::Result<T>;
