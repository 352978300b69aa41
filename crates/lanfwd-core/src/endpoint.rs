//! Listen and upstream endpoints, plus port validation.

use crate::error::{FwdError, FwdResult};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Port the forwarder listens on (and dials) when none is configured.
pub const DEFAULT_PORT: u16 = 4891;

/// Host every accepted connection is forwarded to unless overridden.
pub const DEFAULT_UPSTREAM_HOST: &str = "127.0.0.1";

/// Parse operator-supplied port text.
///
/// Accepts surrounding whitespace. Rejects empty input, anything that is not
/// a decimal number, and numbers outside `1..=65535`.
pub fn parse_port(input: &str) -> FwdResult<u16> {
    let trimmed = input.trim();
    let value: u32 = trimmed
        .parse()
        .map_err(|_| FwdError::InvalidPort(format!("'{trimmed}' is not a number")))?;
    if value > u16::MAX as u32 {
        return Err(FwdError::InvalidPort(format!("{value} is out of range 1-65535")));
    }
    validate_port(value as u16)
}

/// Reject port 0; every other `u16` is a usable TCP port.
pub fn validate_port(port: u16) -> FwdResult<u16> {
    if port == 0 {
        return Err(FwdError::InvalidPort("0 is out of range 1-65535".to_string()));
    }
    Ok(port)
}

/// Local address + port the relay accepts connections on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenEndpoint {
    pub host: IpAddr,
    pub port: u16,
}

impl ListenEndpoint {
    /// Build a listen endpoint, validating the port.
    pub fn new(host: IpAddr, port: u16) -> FwdResult<Self> {
        Ok(Self {
            host,
            port: validate_port(port)?,
        })
    }

    /// Listen on every IPv4 interface.
    pub fn all_interfaces(port: u16) -> FwdResult<Self> {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// Fixed destination dialed for every accepted connection.
///
/// The host is kept as text so it may be a hostname; it is resolved on each
/// dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamEndpoint {
    pub host: String,
    pub port: u16,
}

impl UpstreamEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> FwdResult<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(FwdError::InvalidUpstream("host is empty".to_string()));
        }
        Ok(Self {
            host,
            port: validate_port(port)?,
        })
    }

    /// `127.0.0.1:<port>`, the default target.
    pub fn loopback(port: u16) -> FwdResult<Self> {
        Self::new(DEFAULT_UPSTREAM_HOST, port)
    }

    /// `host:port` form accepted by `TcpStream::connect`. Bare IPv6
    /// literals are bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_ports() {
        assert_eq!(parse_port("4891").unwrap(), 4891);
        assert_eq!(parse_port(" 1 ").unwrap(), 1);
        assert_eq!(parse_port("65535").unwrap(), 65535);
    }

    #[test]
    fn parse_rejects_out_of_range() {
        for input in ["0", "65536", "70000", "4294967296"] {
            assert!(
                matches!(parse_port(input), Err(FwdError::InvalidPort(_))),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn parse_rejects_non_numeric() {
        for input in ["", "   ", "abc", "-1", "48 91", "4891x", "0x10"] {
            assert!(
                matches!(parse_port(input), Err(FwdError::InvalidPort(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn listen_endpoint_rejects_port_zero() {
        assert!(ListenEndpoint::all_interfaces(0).is_err());
        let ep = ListenEndpoint::all_interfaces(4891).unwrap();
        assert_eq!(ep.to_string(), "0.0.0.0:4891");
    }

    #[test]
    fn upstream_address_forms() {
        assert_eq!(UpstreamEndpoint::loopback(4891).unwrap().address(), "127.0.0.1:4891");
        assert_eq!(UpstreamEndpoint::new("::1", 80).unwrap().address(), "[::1]:80");
        assert_eq!(
            UpstreamEndpoint::new("llm.local", 8080).unwrap().to_string(),
            "llm.local:8080"
        );
        assert!(UpstreamEndpoint::new("", 80).is_err());
    }
}
