//! Flow identity.
//!
//! A [`FlowKey`] names one direction of a TCP connection: the ordered pair
//! of source and destination endpoints. The reverse direction is a distinct
//! key, reachable through [`FlowKey::reverse`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// Directional flow identifier: `(src, dst)` endpoint pair.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        FlowKey { src, dst }
    }

    /// The opposite direction of the same connection.
    pub fn reverse(&self) -> FlowKey {
        FlowKey {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Raised when endpoint bytes lifted off the wire have an unexpected shape.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("unexpected IP address length {0}")]
    AddrLen(usize),
    #[error("unexpected TCP port length {0}")]
    PortLen(usize),
}

/// Interprets raw network-layer address bytes: 4 bytes are an IPv4 address,
/// 16 bytes an IPv6 address, anything else is an error.
pub fn addr_from_raw(bytes: &[u8]) -> Result<IpAddr, EndpointError> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().map_err(|_| EndpointError::AddrLen(4))?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().map_err(|_| EndpointError::AddrLen(16))?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        n => Err(EndpointError::AddrLen(n)),
    }
}

/// Interprets raw transport-layer port bytes: exactly 2 bytes, big-endian.
pub fn port_from_raw(bytes: &[u8]) -> Result<u16, EndpointError> {
    match bytes.len() {
        2 => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        n => Err(EndpointError::PortLen(n)),
    }
}

/// Builds an endpoint from raw address and port bytes.
pub fn endpoint_from_raw(addr: &[u8], port: &[u8]) -> Result<SocketAddr, EndpointError> {
    Ok(SocketAddr::new(addr_from_raw(addr)?, port_from_raw(port)?))
}
