//! Endpoint and connection identification for TCP over the IPv6-style
//! network layer.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use crate::{Error, Result};

/// Address families an endpoint can name.
///
/// Only [AddrFamily::Ipv6] is accepted by the stack; a default-constructed
/// endpoint carries [AddrFamily::Unspec] and is rejected at the API boundary.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
pub enum AddrFamily {
    /// No family assigned yet.
    #[default]
    Unspec,
    /// The IPv6-shaped network layer address family.
    Ipv6,
}

/// A network-layer address, port number and optional interface index.
///
/// The textual form places the address and interface index inside literal
/// brackets: `"[fe80::2%3]:8080"`. A missing port or interface index reads
/// as zero.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Endpoint {
    /// Address family of this endpoint.
    pub family: AddrFamily,
    /// Network-layer address.
    pub addr: Ipv6Addr,
    /// Port number. Zero means unspecified.
    pub port: u16,
    /// Network-interface index. Zero means unspecified.
    pub netif: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            family: AddrFamily::default(),
            addr: Ipv6Addr::UNSPECIFIED,
            port: 0,
            netif: 0,
        }
    }
}

impl Endpoint {
    /// Creates an endpoint from its parts.
    pub fn new(addr: Ipv6Addr, port: u16, netif: u16) -> Self {
        Self {
            family: AddrFamily::Ipv6,
            addr,
            port,
            netif,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.netif != 0 {
            write!(f, "[{}%{}]:{}", self.addr, self.netif, self.port)
        } else {
            write!(f, "[{}]:{}", self.addr, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // A single pair of brackets, the opening one first in the string.
        let addr_begin = s.find('[').ok_or(Error::InvalidArg)?;
        let addr_end = s.find(']').ok_or(Error::InvalidArg)?;

        if addr_begin != 0 || addr_end < addr_begin {
            return Err(Error::InvalidArg);
        }
        if s[addr_begin + 1..].contains('[') || s[addr_end + 1..].contains(']') {
            return Err(Error::InvalidArg);
        }

        // Optional port number after the closing bracket.
        let mut port = 0u16;
        if let Some(rest) = s[addr_end + 1..].strip_prefix(':') {
            if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::InvalidArg);
            }
            port = rest.parse::<u16>().map_err(|_| Error::InvalidArg)?;
        } else if !s[addr_end + 1..].is_empty() {
            return Err(Error::InvalidArg);
        }

        // Optional interface index, placed before the closing bracket.
        let mut netif = 0u16;
        let mut addr_str = &s[addr_begin + 1..addr_end];
        if let Some(pos) = addr_str.find('%') {
            let if_str = &addr_str[pos + 1..];
            if if_str.is_empty() || !if_str.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::InvalidArg);
            }
            netif = if_str.parse::<u16>().map_err(|_| Error::InvalidArg)?;
            addr_str = &addr_str[..pos];
        }

        let addr = addr_str.parse::<Ipv6Addr>().map_err(|_| Error::InvalidArg)?;

        Ok(Endpoint::new(addr, port, netif))
    }
}

/// A network-layer address and port number.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct SocketAddr {
    /// Network-layer address.
    pub addr: Ipv6Addr,
    /// Port number.
    pub port: u16,
}

impl SocketAddr {
    /// The all-zero address with port zero.
    pub const UNSPECIFIED: SocketAddr = SocketAddr {
        addr: Ipv6Addr::UNSPECIFIED,
        port: 0,
    };
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.addr, self.port)
    }
}

/// Identification for a unique TCP connection, using the local and peer
/// socket addresses.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Socket {
    /// The local socket address.
    pub local: SocketAddr,
    /// The peer socket address.
    pub peer: SocketAddr,
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn endpoint_full_form_valid() {
        let ep = "[fe80::2%3]:8080".parse::<Endpoint>().unwrap();

        assert_eq!(ep.family, AddrFamily::Ipv6);
        assert_eq!(ep.addr, "fe80::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.netif, 3);
    }

    #[test]
    fn endpoint_defaults_to_zero_port_and_netif() {
        let ep = "[::1]".parse::<Endpoint>().unwrap();

        assert_eq!(ep.addr, Ipv6Addr::LOCALHOST);
        assert_eq!(ep.port, 0);
        assert_eq!(ep.netif, 0);
    }

    #[test]
    fn endpoint_malformed_invalid() {
        for s in [
            "",
            "::1",
            "[::1",
            "::1]",
            "x[::1]",
            "[[::1]]",
            "[::1]:",
            "[::1]:x",
            "[::1]:70000",
            "[::1]junk",
            "[::1%]:80",
            "[::1%x]:80",
            "[not-an-addr]:80",
        ] {
            assert_eq!(s.parse::<Endpoint>(), Err(Error::InvalidArg), "input: {s:?}");
        }
    }

    proptest! {
        #[test]
        fn endpoint_display_round_trip(
            segs in prop::array::uniform8(any::<u16>()),
            port in any::<u16>(),
            netif in any::<u16>(),
        ) {
            let addr = Ipv6Addr::new(
                segs[0], segs[1], segs[2], segs[3], segs[4], segs[5], segs[6], segs[7],
            );
            let ep = Endpoint::new(addr, port, netif);

            prop_assert_eq!(ep.to_string().parse::<Endpoint>().unwrap(), ep);
        }
    }
}
