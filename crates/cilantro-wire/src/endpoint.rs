//! Endpoint descriptors (`protocol://ip:port`).

use crate::error::{WireError, WireResult};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Address used in place of the node's own advertised IP.
pub const WILDCARD_IP: &str = "0.0.0.0";

/// Supported transport protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    /// Local Unix-domain socket; the host part is a filesystem path prefix.
    Ipc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ipc => "ipc",
        }
    }
}

impl FromStr for Protocol {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "ipc" => Ok(Self::Ipc),
            other => Err(WireError::Protocol(format!(
                "only tcp/ipc protocols are supported, not '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved endpoint. Formats as `protocol://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    protocol: Protocol,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Build an endpoint, rejecting an empty host or port 0.
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> WireResult<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(WireError::Protocol("ip missing from endpoint".into()));
        }
        if port == 0 {
            return Err(WireError::Protocol(format!(
                "port missing from endpoint for host {host}"
            )));
        }
        Ok(Self {
            protocol,
            host,
            port,
        })
    }

    /// Build an endpoint, replacing the node's own advertised IP with the
    /// wildcard address for tcp endpoints.
    pub fn resolve(protocol: Protocol, ip: &str, port: u16, host_ip: &str) -> WireResult<Self> {
        let host = if protocol == Protocol::Tcp && !host_ip.is_empty() && ip == host_ip {
            WILDCARD_IP
        } else {
            ip
        };
        Self::new(protocol, host, port)
    }

    /// Parse a `protocol://host:port` descriptor.
    pub fn parse(descriptor: &str) -> WireResult<Self> {
        let (proto, rest) = descriptor
            .split_once("://")
            .ok_or_else(|| WireError::Protocol(format!("malformed endpoint '{descriptor}'")))?;
        let protocol = proto.parse::<Protocol>()?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| WireError::Protocol(format!("missing port in '{descriptor}'")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| WireError::Protocol(format!("invalid port in '{descriptor}'")))?;
        Self::new(protocol, host, port)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, as accepted by tokio's TCP APIs.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Socket file path for ipc endpoints.
    pub fn ipc_path(&self) -> PathBuf {
        PathBuf::from(self.host_port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("ipc".parse::<Protocol>().unwrap(), Protocol::Ipc);
        let err = "udp".parse::<Protocol>().unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }

    #[test]
    fn test_display_and_parse() {
        let ep = Endpoint::new(Protocol::Tcp, "127.0.0.1", 9000).unwrap();
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:9000");
        assert_eq!(Endpoint::parse("tcp://127.0.0.1:9000").unwrap(), ep);

        let ipc = Endpoint::parse("ipc:///tmp/cilantro:7000").unwrap();
        assert_eq!(ipc.protocol(), Protocol::Ipc);
        assert_eq!(ipc.host(), "/tmp/cilantro");
        assert_eq!(ipc.ipc_path(), PathBuf::from("/tmp/cilantro:7000"));
    }

    #[test]
    fn test_rejects_missing_parts() {
        assert!(Endpoint::new(Protocol::Tcp, "", 9000).is_err());
        assert!(Endpoint::new(Protocol::Tcp, "10.0.0.1", 0).is_err());
        assert!(Endpoint::parse("10.0.0.1:9000").is_err());
        assert!(Endpoint::parse("tcp://10.0.0.1").is_err());
        assert!(Endpoint::parse("ws://10.0.0.1:80").is_err());
    }

    #[test]
    fn test_host_ip_normalized_to_wildcard() {
        let ep = Endpoint::resolve(Protocol::Tcp, "10.0.0.5", 9000, "10.0.0.5").unwrap();
        assert_eq!(ep.to_string(), "tcp://0.0.0.0:9000");

        let other = Endpoint::resolve(Protocol::Tcp, "10.0.0.6", 9000, "10.0.0.5").unwrap();
        assert_eq!(other.host(), "10.0.0.6");

        // ipc paths are never rewritten
        let ipc = Endpoint::resolve(Protocol::Ipc, "/tmp/x", 1, "/tmp/x").unwrap();
        assert_eq!(ipc.host(), "/tmp/x");
    }
}
