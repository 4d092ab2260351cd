//! Proxy Rules
//!
//! Validated, immutable form of a `[[rules]]` entry.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use super::SessionSettings;
use crate::error::ConfigError;

/// Transport of one side of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Unix,
}

impl Protocol {
    /// Stream transports carry a connection lifecycle and EOF.
    pub fn is_stream(self) -> bool {
        !matches!(self, Protocol::Udp)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "unix" => Ok(Protocol::Unix),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Unix => write!(f, "unix"),
        }
    }
}

/// Listen or target address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Address {
    Socket(SocketAddr),
    /// Hostname resolved at dial time. Only valid as a target.
    Host { host: String, port: u16 },
    Unix(PathBuf),
}

impl Address {
    /// Parse an address for the given transport.
    ///
    /// `":port"` binds every IPv4 interface. Hostnames are only accepted when
    /// `allow_host` is set.
    pub fn parse(protocol: Protocol, value: &str, allow_host: bool) -> Result<Address, String> {
        let value = value.trim();
        if value.is_empty() {
            return Err("address is empty".to_string());
        }

        if protocol == Protocol::Unix {
            return Ok(Address::Unix(PathBuf::from(value)));
        }

        if let Some(port) = value.strip_prefix(':') {
            let port = port
                .parse::<u16>()
                .map_err(|e| format!("invalid port: {}", e))?;
            return Ok(Address::Socket(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
            )));
        }

        if let Ok(addr) = value.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| "expected host:port".to_string())?;
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port: {}", e))?;
        if host.is_empty() || host.contains(':') || host.contains(char::is_whitespace) {
            return Err("invalid host".to_string());
        }
        if !allow_host {
            return Err("listen addresses must be numeric (ip:port or :port)".to_string());
        }
        Ok(Address::Host {
            host: host.to_string(),
            port,
        })
    }

    /// Port `0` asks the OS for an ephemeral port; such addresses never collide.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Address::Socket(addr) if addr.port() == 0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Host { host, port } => write!(f, "{}:{}", host, port),
            Address::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A validated mapping from a listen endpoint to a target endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyRule {
    pub name: String,
    pub protocol: Protocol,
    pub listen: Address,
    pub target_protocol: Protocol,
    pub target: Address,
    pub settings: SessionSettings,
}

impl ProxyRule {
    /// Build a rule with default settings from address strings.
    pub fn new(protocol: Protocol, listen: &str, target: &str) -> Result<Self, ConfigError> {
        let invalid = |field: &'static str, value: &str, reason: String| {
            ConfigError::InvalidAddress {
                index: 0,
                field,
                value: value.to_string(),
                reason,
            }
        };
        let listen = Address::parse(protocol, listen, false)
            .map_err(|reason| invalid("listen", listen, reason))?;
        let target = Address::parse(protocol, target, true)
            .map_err(|reason| invalid("target", target, reason))?;
        Ok(Self {
            name: format!("{}:{}", protocol, listen),
            protocol,
            listen,
            target_protocol: protocol,
            target,
            settings: SessionSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_target(mut self, protocol: Protocol, target: Address) -> Self {
        self.target_protocol = protocol;
        self.target = target;
        self
    }
}

impl fmt::Display for ProxyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} {}",
            self.protocol, self.listen, self.target_protocol, self.target
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_only() {
        let addr = Address::parse(Protocol::Tcp, ":9000", false).unwrap();
        assert_eq!(addr, Address::Socket("0.0.0.0:9000".parse().unwrap()));
    }

    #[test]
    fn test_parse_ipv6_and_hosts() {
        let addr = Address::parse(Protocol::Udp, "[::1]:53", false).unwrap();
        assert_eq!(addr, Address::Socket("[::1]:53".parse().unwrap()));

        let addr = Address::parse(Protocol::Tcp, "db.internal:3306", true).unwrap();
        assert_eq!(
            addr,
            Address::Host {
                host: "db.internal".to_string(),
                port: 3306
            }
        );

        assert!(Address::parse(Protocol::Tcp, "db.internal:3306", false).is_err());
        assert!(Address::parse(Protocol::Tcp, "no-port", true).is_err());
        assert!(Address::parse(Protocol::Tcp, "host:99999", true).is_err());
        assert!(Address::parse(Protocol::Tcp, "", true).is_err());
    }

    #[test]
    fn test_parse_unix_path() {
        let addr = Address::parse(Protocol::Unix, "/tmp/app.sock", false).unwrap();
        assert_eq!(addr, Address::Unix(PathBuf::from("/tmp/app.sock")));
        assert_eq!(addr.to_string(), "/tmp/app.sock");
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("TCP".parse::<Protocol>(), Ok(Protocol::Tcp));
        assert_eq!("unix".parse::<Protocol>(), Ok(Protocol::Unix));
        assert!("sctp".parse::<Protocol>().is_err());
        assert!(!Protocol::Udp.is_stream());
    }

    #[test]
    fn test_ephemeral_detection() {
        assert!(Address::parse(Protocol::Tcp, "127.0.0.1:0", false)
            .unwrap()
            .is_ephemeral());
        assert!(!Address::parse(Protocol::Tcp, ":80", false)
            .unwrap()
            .is_ephemeral());
    }
}
