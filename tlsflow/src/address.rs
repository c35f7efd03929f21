//! Flow addressing.
//!
//! A TLS chunk carries the address quad of the socket it was captured on.
//! Oriented along the data flow, the request and the response of one exchange
//! have their endpoints swapped. This module folds both orientations onto a
//! single [`FlowKey`] and derives the two directional [`TcpId`]s bound to a
//! stream.

use std::{fmt, net::Ipv4Addr};

/// Parsed source/destination endpoints of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPair {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl AddressPair {
    pub fn new(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }

    /// The same pair as seen from the other endpoint.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }

    /// Unchanged for the request side, reversed for the response side.
    pub fn oriented(&self, is_request: bool) -> Self {
        if is_request { *self } else { self.reversed() }
    }

    /// True when the probe could not resolve the socket address at all.
    pub fn is_unset(&self) -> bool {
        self.src_ip.is_unspecified()
            && self.dst_ip.is_unspecified()
            && self.src_port == 0
            && self.dst_port == 0
    }
}

impl fmt::Display for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}>{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Direction-agnostic identifier of one TCP exchange.
///
/// Always rendered in request orientation: `client:port>server:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey(String);

impl FlowKey {
    pub fn new(address: &AddressPair, is_request: bool) -> Self {
        if is_request {
            Self(address.to_string())
        } else {
            Self(address.reversed().to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<FlowKey> for String {
    fn from(key: FlowKey) -> Self {
        key.0
    }
}

/// Directional, human readable identity of one side of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpId {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: String,
    pub dst_port: String,
}

impl TcpId {
    /// Request orientation treats the observed source as the client; response
    /// orientation swaps both endpoints.
    pub fn new(address: &AddressPair, is_request: bool) -> Self {
        let address = if is_request {
            *address
        } else {
            address.reversed()
        };

        Self {
            src_ip: address.src_ip.to_string(),
            dst_ip: address.dst_ip.to_string(),
            src_port: address.src_port.to_string(),
            dst_port: address.dst_port.to_string(),
        }
    }
}

impl fmt::Display for TcpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}
