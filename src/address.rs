//! Target address encoding/decoding (SOCKS compatible).
//!
//! Wire format: atyp(1B) | addr(var) | port(2B BE)
//!   atyp=0x01: IPv4, addr=4 bytes
//!   atyp=0x03: Domain, addr=1 byte len + string
//!   atyp=0x04: IPv6, addr=16 bytes

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Address type constants (RFC 1928).
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// A tunnel target with type, host, and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub atyp: u8,
    pub host: String,
    pub port: u16,
}

/// Address errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Data too short.
    TooShort,
    /// Invalid address type.
    InvalidType(u8),
    /// Invalid IPv4 address.
    InvalidIPv4,
    /// Invalid IPv6 address.
    InvalidIPv6,
    /// Invalid domain (empty or over 255 bytes).
    InvalidDomain,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::TooShort => write!(f, "address data too short"),
            AddressError::InvalidType(t) => write!(f, "unknown address type 0x{:02x}", t),
            AddressError::InvalidIPv4 => write!(f, "invalid IPv4 address"),
            AddressError::InvalidIPv6 => write!(f, "invalid IPv6 address"),
            AddressError::InvalidDomain => write!(f, "invalid domain"),
        }
    }
}

impl std::error::Error for AddressError {}

impl Address {
    /// Create a new IPv4 address.
    pub fn ipv4(host: &str, port: u16) -> Self {
        Address {
            atyp: ATYP_IPV4,
            host: host.to_string(),
            port,
        }
    }

    /// Create a new IPv6 address. The host is canonicalized: any zone id
    /// suffix ("%eth0") is stripped and the textual form is normalized.
    pub fn ipv6(host: &str, port: u16) -> Self {
        Address {
            atyp: ATYP_IPV6,
            host: canonical_ipv6(host),
            port,
        }
    }

    /// Create an IPv6 address from raw octets.
    pub fn from_ipv6_octets(octets: [u8; 16], port: u16) -> Self {
        Address {
            atyp: ATYP_IPV6,
            host: Ipv6Addr::from(octets).to_string(),
            port,
        }
    }

    /// Create a new domain address.
    pub fn domain(host: &str, port: u16) -> Self {
        Address {
            atyp: ATYP_DOMAIN,
            host: host.to_string(),
            port,
        }
    }

    /// "host:port" with brackets around IPv6 hosts, for CONNECT lines and logs.
    pub fn authority(&self) -> String {
        if self.atyp == ATYP_IPV6 || self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Encode the address to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, AddressError> {
        match self.atyp {
            ATYP_IPV4 => {
                let ip: Ipv4Addr = self.host.parse().map_err(|_| AddressError::InvalidIPv4)?;
                let mut buf = Vec::with_capacity(7);
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&self.port.to_be_bytes());
                Ok(buf)
            }
            ATYP_DOMAIN => {
                if self.host.is_empty() || self.host.len() > 255 {
                    return Err(AddressError::InvalidDomain);
                }
                let mut buf = Vec::with_capacity(1 + 1 + self.host.len() + 2);
                buf.push(ATYP_DOMAIN);
                buf.push(self.host.len() as u8);
                buf.extend_from_slice(self.host.as_bytes());
                buf.extend_from_slice(&self.port.to_be_bytes());
                Ok(buf)
            }
            ATYP_IPV6 => {
                let ip: Ipv6Addr = canonical_ipv6(&self.host)
                    .parse()
                    .map_err(|_| AddressError::InvalidIPv6)?;
                let mut buf = Vec::with_capacity(19);
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&self.port.to_be_bytes());
                Ok(buf)
            }
            t => Err(AddressError::InvalidType(t)),
        }
    }

    /// Decode an address from bytes.
    /// Returns the address and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Address, usize), AddressError> {
        if data.is_empty() {
            return Err(AddressError::TooShort);
        }

        match data[0] {
            ATYP_IPV4 => {
                if data.len() < 7 {
                    return Err(AddressError::TooShort);
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::ipv4(&ip.to_string(), port), 7))
            }
            ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Err(AddressError::TooShort);
                }
                let domain_len = data[1] as usize;
                if domain_len == 0 {
                    return Err(AddressError::InvalidDomain);
                }
                if data.len() < 2 + domain_len + 2 {
                    return Err(AddressError::TooShort);
                }
                let host = String::from_utf8_lossy(&data[2..2 + domain_len]).into_owned();
                let port = u16::from_be_bytes([data[2 + domain_len], data[3 + domain_len]]);
                Ok((Address::domain(&host, port), 2 + domain_len + 2))
            }
            ATYP_IPV6 => {
                if data.len() < 19 {
                    return Err(AddressError::TooShort);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Address::from_ipv6_octets(octets, port), 19))
            }
            t => Err(AddressError::InvalidType(t)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.authority())
    }
}

/// Canonicalize an IPv6 literal: strip any zone id suffix and re-render
/// through `Ipv6Addr` when the remainder parses. Non-parsing input is
/// returned with only the zone stripped.
pub fn canonical_ipv6(host: &str) -> String {
    let bare = match host.find('%') {
        Some(idx) => &host[..idx],
        None => host,
    };
    match bare.parse::<Ipv6Addr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => bare.to_string(),
    }
}
