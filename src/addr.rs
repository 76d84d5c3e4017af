//! Address and netmask handling for pushed directives.
//!
//! Directive arguments arrive as text in a handful of shapes: bare
//! address, `addr/prefix`, or address plus dotted netmask. Everything here
//! parses into typed `std::net` addresses early so the rest of the crate
//! never re-validates strings.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::{Error, Result};

/// Parse an IP literal of either version, tagging errors with the
/// directive context (`"ifconfig"`, `"route"`, ...).
pub fn parse_ip(s: &str, ctx: &str) -> Result<IpAddr> {
    s.parse()
        .map_err(|_| Error::addr(format!("{}: bad IP address '{}'", ctx, s)))
}

/// Parse an IPv4 literal, rejecting IPv6 with a version error.
pub fn parse_ipv4(s: &str, ctx: &str) -> Result<Ipv4Addr> {
    match parse_ip(s, ctx)? {
        IpAddr::V4(a) => Ok(a),
        IpAddr::V6(_) => Err(Error::addr(format!("{}: address '{}' is not IPv4", ctx, s))),
    }
}

/// Convert a contiguous netmask literal to a prefix length.
pub fn mask_to_prefix(mask: IpAddr, ctx: &str) -> Result<u8> {
    match mask {
        IpAddr::V4(m) => {
            let m = u32::from(m);
            if m.leading_ones() + m.trailing_zeros() != 32 {
                return Err(Error::addr(format!(
                    "{}: netmask {} is not contiguous",
                    ctx,
                    Ipv4Addr::from(m)
                )));
            }
            Ok(m.leading_ones() as u8)
        }
        IpAddr::V6(m) => {
            let m = u128::from(m);
            if m.leading_ones() + m.trailing_zeros() != 128 {
                return Err(Error::addr(format!("{}: IPv6 netmask is not contiguous", ctx)));
            }
            Ok(m.leading_ones() as u8)
        }
    }
}

fn mask4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

fn mask6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len))
    }
}

/// True when two IPv4 addresses share the network of the given prefix.
pub fn same_subnet_v4(a: Ipv4Addr, b: Ipv4Addr, prefix_len: u8) -> bool {
    let m = mask4(prefix_len);
    (u32::from(a) & m) == (u32::from(b) & m)
}

/// An address with its prefix length, either IP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrMaskPair {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl AddrMaskPair {
    /// Build from directive arguments. Accepted shapes:
    ///
    /// * `addr` + `Some(netmask)`: dotted/contiguous netmask, same IP
    ///   version as the address
    /// * `addr/len` + `None`: explicit prefix length
    /// * `addr` + `None`: full host prefix (/32 or /128)
    pub fn from_args(addr: &str, mask: Option<&str>, ctx: &str) -> Result<Self> {
        if let Some(mask) = mask.filter(|m| !m.is_empty()) {
            let addr = parse_ip(addr, ctx)?;
            let mask = parse_ip(mask, ctx)?;
            if addr.is_ipv4() != mask.is_ipv4() {
                return Err(Error::addr(format!(
                    "{}: address and netmask version mismatch",
                    ctx
                )));
            }
            let prefix_len = mask_to_prefix(mask, ctx)?;
            return Ok(Self { addr, prefix_len });
        }
        match addr.split_once('/') {
            Some((ip, len)) => {
                let addr = parse_ip(ip, ctx)?;
                let prefix_len: u8 = len
                    .parse()
                    .map_err(|_| Error::addr(format!("{}: bad prefix length '{}'", ctx, len)))?;
                let pair = Self { addr, prefix_len };
                if prefix_len > pair.max_prefix() {
                    return Err(Error::addr(format!(
                        "{}: prefix length {} too long for {}",
                        ctx, prefix_len, ip
                    )));
                }
                Ok(pair)
            }
            None => {
                let addr = parse_ip(addr, ctx)?;
                let mut pair = Self { addr, prefix_len: 0 };
                pair.prefix_len = pair.max_prefix();
                Ok(pair)
            }
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    fn max_prefix(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Network-aligned: no host bits set below the prefix.
    pub fn is_canonical(&self) -> bool {
        match self.addr {
            IpAddr::V4(a) => u32::from(a) & !mask4(self.prefix_len) == 0,
            IpAddr::V6(a) => u128::from(a) & !mask6(self.prefix_len) == 0,
        }
    }
}

impl fmt::Display for AddrMaskPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}
