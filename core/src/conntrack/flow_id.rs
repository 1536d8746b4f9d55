//! Flow identifiers.
//!
//! Provides the fragmentation-group identifiers for IPv4 and IPv6 datagrams and the
//! direction-sensitive connection identifier for TCP streams.

use std::cmp;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;

/// IPv4 fragmentation group.
///
/// Two fragments belong to the same datagram iff all four fields are equal.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct Ipv4Key {
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Transport protocol number.
    pub proto: u8,
    /// Identification field.
    pub id: u16,
}

impl Ipv4Key {
    /// Creates a key from decoded IPv4 header fields.
    pub fn from_header(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, id: u16) -> Self {
        Ipv4Key { src, dst, proto, id }
    }
}

impl fmt::Display for Ipv4Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)?;
        write!(f, " protocol {} id {}", self.proto, self.id)?;
        Ok(())
    }
}

/// IPv6 fragmentation group.
///
/// Two fragments belong to the same packet iff all four fields are equal.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct Ipv6Key {
    /// Source address.
    pub src: Ipv6Addr,
    /// Destination address.
    pub dst: Ipv6Addr,
    /// Next header carried in the fragment header.
    pub proto: u8,
    /// Identification field of the fragment header.
    pub id: u32,
}

impl Ipv6Key {
    /// Creates a key from the IPv6 header addresses and the fragment header fields.
    pub fn from_header(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, id: u32) -> Self {
        Ipv6Key { src, dst, proto, id }
    }
}

impl fmt::Display for Ipv6Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)?;
        write!(f, " next header {} id {}", self.proto, self.id)?;
        Ok(())
    }
}

/// TCP connection 4-tuple.
///
/// Direction-sensitive: `src -> dst` and `dst -> src` are distinct keys unless both are
/// normalized with [TcpKey::canonical].
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct TcpKey {
    /// Sender endpoint.
    pub src: SocketAddr,
    /// Receiver endpoint.
    pub dst: SocketAddr,
}

impl TcpKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        TcpKey { src, dst }
    }

    /// Returns the key of the opposite direction.
    pub fn reversed(&self) -> Self {
        TcpKey {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Returns a key identical for both directions of a connection.
    pub fn canonical(&self) -> Self {
        TcpKey {
            src: cmp::max(self.src, self.dst),
            dst: cmp::min(self.src, self.dst),
        }
    }
}

impl fmt::Display for TcpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_tcp_key_canonical() {
        let a: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let fwd = TcpKey::new(a, b);
        let rev = fwd.reversed();
        assert_ne!(fwd, rev);
        assert_eq!(fwd.canonical(), rev.canonical());
        assert_eq!(rev.reversed(), fwd);
    }

    #[test]
    fn core_ipv4_key_display() {
        let key = Ipv4Key::from_header(
            Ipv4Addr::new(192, 168, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            17,
            4242,
        );
        assert_eq!(
            key.to_string(),
            "192.168.0.1 -> 10.0.0.1 protocol 17 id 4242"
        );
    }

    #[test]
    fn core_ipv6_key_display() {
        let key = Ipv6Key::from_header(
            "2001:db8::1".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
            6,
            0xdead_beef,
        );
        assert_eq!(
            key.to_string(),
            "2001:db8::1 -> 2001:db8::2 next header 6 id 3735928559"
        );
    }
}
