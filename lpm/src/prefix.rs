// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Version-neutral IP network prefixes with canonical (host-bits-zero) form.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrefixError {
    #[error("invalid prefix: {0}")]
    Invalid(String),
    #[error("mask length {0} is invalid")]
    InvalidLength(u8),
    #[error("prefix {0} has host bits set")]
    HostBitsSet(String),
}

fn mask_v4(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - u32::from(len)) }
}

fn mask_v6(len: u8) -> u128 {
    if len == 0 { 0 } else { u128::MAX << (128 - u32::from(len)) }
}

/// Common behavior of the per-family prefix types.
#[allow(clippy::len_without_is_empty)]
pub trait IpPrefix:
    Sized + Debug + Display + Copy + Clone + Eq + Ord + Hash + From<Self::Addr> + Default
{
    type Addr: Display + Debug + Copy + Eq + Ord + Hash;
    const MAX_LEN: u8;

    /// Build a prefix, masking out any host bits.
    ///
    /// # Errors
    /// Fails if the length exceeds `Self::MAX_LEN`.
    fn new(addr: Self::Addr, len: u8) -> Result<Self, PrefixError>;
    fn network(&self) -> Self::Addr;
    fn len(&self) -> u8;
}

////////////////////////////////////////////////////////////
// IPv4 prefix
////////////////////////////////////////////////////////////

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Prefix(Ipv4Net);

impl Debug for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl Default for Ipv4Prefix {
    fn default() -> Self {
        Self(Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).unwrap_or_else(|_| unreachable!()))
    }
}

impl Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl IpPrefix for Ipv4Prefix {
    type Addr = Ipv4Addr;
    const MAX_LEN: u8 = 32;

    fn new(addr: Ipv4Addr, len: u8) -> Result<Self, PrefixError> {
        if len > Self::MAX_LEN {
            return Err(PrefixError::InvalidLength(len));
        }
        let network = Ipv4Addr::from_bits(addr.to_bits() & mask_v4(len));
        Ok(Self(
            Ipv4Net::new(network, len).map_err(|e| PrefixError::Invalid(e.to_string()))?,
        ))
    }
    fn network(&self) -> Ipv4Addr {
        self.0.network()
    }
    fn len(&self) -> u8 {
        self.0.prefix_len()
    }
}

impl Ipv4Prefix {
    #[must_use]
    pub fn covers(&self, addr: &Ipv4Addr) -> bool {
        self.0.contains(addr)
    }
}

impl From<Ipv4Addr> for Ipv4Prefix {
    fn from(addr: Ipv4Addr) -> Self {
        Self::new(addr, Self::MAX_LEN).unwrap_or_else(|_| unreachable!())
    }
}

impl FromStr for Ipv4Prefix {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| PrefixError::Invalid(s.to_string()))?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| PrefixError::Invalid(s.to_string()))?;
        let len = len
            .parse::<u8>()
            .map_err(|_| PrefixError::Invalid(s.to_string()))?;
        Self::new(addr, len)
    }
}

////////////////////////////////////////////////////////////
// IPv6 prefix
////////////////////////////////////////////////////////////

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv6Prefix(Ipv6Net);

impl Debug for Ipv6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl Default for Ipv6Prefix {
    fn default() -> Self {
        Self(Ipv6Net::new(Ipv6Addr::UNSPECIFIED, 0).unwrap_or_else(|_| unreachable!()))
    }
}

impl Display for Ipv6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl IpPrefix for Ipv6Prefix {
    type Addr = Ipv6Addr;
    const MAX_LEN: u8 = 128;

    fn new(addr: Ipv6Addr, len: u8) -> Result<Self, PrefixError> {
        if len > Self::MAX_LEN {
            return Err(PrefixError::InvalidLength(len));
        }
        let network = Ipv6Addr::from_bits(addr.to_bits() & mask_v6(len));
        Ok(Self(
            Ipv6Net::new(network, len).map_err(|e| PrefixError::Invalid(e.to_string()))?,
        ))
    }
    fn network(&self) -> Ipv6Addr {
        self.0.network()
    }
    fn len(&self) -> u8 {
        self.0.prefix_len()
    }
}

impl Ipv6Prefix {
    #[must_use]
    pub fn covers(&self, addr: &Ipv6Addr) -> bool {
        self.0.contains(addr)
    }
}

impl From<Ipv6Addr> for Ipv6Prefix {
    fn from(addr: Ipv6Addr) -> Self {
        Self::new(addr, Self::MAX_LEN).unwrap_or_else(|_| unreachable!())
    }
}

impl FromStr for Ipv6Prefix {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| PrefixError::Invalid(s.to_string()))?;
        let addr = addr
            .parse::<Ipv6Addr>()
            .map_err(|_| PrefixError::Invalid(s.to_string()))?;
        let len = len
            .parse::<u8>()
            .map_err(|_| PrefixError::Invalid(s.to_string()))?;
        Self::new(addr, len)
    }
}

////////////////////////////////////////////////////////////
// Version-neutral prefix
////////////////////////////////////////////////////////////

/// An IPv4 or IPv6 prefix. Always canonical: host bits are zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub enum Prefix {
    V4(Ipv4Prefix),
    V6(Ipv6Prefix),
}

impl Prefix {
    /// Build `0.0.0.0/0`.
    #[must_use]
    pub fn root_v4() -> Prefix {
        Prefix::V4(Ipv4Prefix::default())
    }
    /// Build `::/0`.
    #[must_use]
    pub fn root_v6() -> Prefix {
        Prefix::V6(Ipv6Prefix::default())
    }

    /// Build a prefix from an address and length, masking out host bits.
    /// This is the constructor for data arriving from the wire.
    ///
    /// # Errors
    /// Fails if the length exceeds the maximum for the address family.
    pub fn canonicalize(addr: IpAddr, len: u8) -> Result<Self, PrefixError> {
        match addr {
            IpAddr::V4(a) => Ipv4Prefix::new(a, len).map(Prefix::V4),
            IpAddr::V6(a) => Ipv6Prefix::new(a, len).map(Prefix::V6),
        }
    }

    /// Build a prefix, rejecting input whose host bits are not zero.
    /// This is the constructor for internally-generated prefixes, where
    /// non-canonical input indicates a bug upstream.
    ///
    /// # Errors
    /// Fails on an invalid length or on set host bits.
    pub fn try_new(addr: IpAddr, len: u8) -> Result<Self, PrefixError> {
        let canonical = Self::canonicalize(addr, len)?;
        if canonical.as_address() != addr {
            return Err(PrefixError::HostBitsSet(format!("{addr}/{len}")));
        }
        Ok(canonical)
    }

    /// Build the host prefix (/32 or /128) for an address.
    #[must_use]
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => Prefix::V4(Ipv4Prefix::from(a)),
            IpAddr::V6(a) => Prefix::V6(Ipv6Prefix::from(a)),
        }
    }

    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        matches!(self, Prefix::V4(_))
    }
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        matches!(self, Prefix::V6(_))
    }

    /// The network address of the prefix.
    #[must_use]
    pub fn as_address(&self) -> IpAddr {
        match self {
            Prefix::V4(p) => IpAddr::V4(p.network()),
            Prefix::V6(p) => IpAddr::V6(p.network()),
        }
    }

    /// Mask length.
    #[must_use]
    pub fn length(&self) -> u8 {
        match self {
            Prefix::V4(p) => p.len(),
            Prefix::V6(p) => p.len(),
        }
    }

    /// Tell if the prefix is a host prefix (/32 or /128).
    #[must_use]
    pub fn is_host(&self) -> bool {
        match self {
            Prefix::V4(p) => p.len() == Ipv4Prefix::MAX_LEN,
            Prefix::V6(p) => p.len() == Ipv6Prefix::MAX_LEN,
        }
    }

    /// Tell if the prefix covers the given address. Always false across families.
    #[must_use]
    pub fn covers_addr(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (Prefix::V4(p), IpAddr::V4(a)) => p.covers(a),
            (Prefix::V6(p), IpAddr::V6(a)) => p.covers(a),
            _ => false,
        }
    }

    /// Get the inner v4 prefix.
    ///
    /// # Panics
    /// Panics if the prefix is not IPv4.
    #[must_use]
    pub fn get_v4(&self) -> Ipv4Prefix {
        match self {
            Prefix::V4(p) => *p,
            Prefix::V6(_) => unreachable!("not an IPv4 prefix"),
        }
    }

    /// Get the inner v6 prefix.
    ///
    /// # Panics
    /// Panics if the prefix is not IPv6.
    #[must_use]
    pub fn get_v6(&self) -> Ipv6Prefix {
        match self {
            Prefix::V4(_) => unreachable!("not an IPv6 prefix"),
            Prefix::V6(p) => *p,
        }
    }

    /// Test/fixture constructor from anything convertible.
    ///
    /// # Panics
    /// Panics on invalid input.
    #[must_use]
    pub fn expect_from<T>(val: T) -> Self
    where
        T: TryInto<Prefix>,
        T::Error: Debug,
    {
        val.try_into().expect("invalid prefix")
    }
}

impl From<Ipv4Prefix> for Prefix {
    fn from(p: Ipv4Prefix) -> Self {
        Prefix::V4(p)
    }
}
impl From<Ipv6Prefix> for Prefix {
    fn from(p: Ipv6Prefix) -> Self {
        Prefix::V6(p)
    }
}

impl TryFrom<(IpAddr, u8)> for Prefix {
    type Error = PrefixError;
    fn try_from((addr, len): (IpAddr, u8)) -> Result<Self, Self::Error> {
        Prefix::canonicalize(addr, len)
    }
}

impl TryFrom<(&str, u8)> for Prefix {
    type Error = PrefixError;
    fn try_from((addr, len): (&str, u8)) -> Result<Self, Self::Error> {
        let addr = IpAddr::from_str(addr).map_err(|e| PrefixError::Invalid(e.to_string()))?;
        Prefix::canonicalize(addr, len)
    }
}

impl FromStr for Prefix {
    type Err = PrefixError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            Ipv6Prefix::from_str(s).map(Prefix::V6)
        } else {
            Ipv4Prefix::from_str(s).map(Prefix::V4)
        }
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Prefix::V4(p) => Display::fmt(p, f),
            Prefix::V6(p) => Display::fmt(p, f),
        }
    }
}

/* Prefixes serialize as their display string so they can key JSON maps */
impl Serialize for Prefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Prefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Prefix::from_str(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_canonicalize_masks_host_bits() {
        let p = Prefix::canonicalize("10.1.2.3".parse().unwrap(), 8).unwrap();
        assert_eq!(p.to_string(), "10.0.0.0/8");
        assert_eq!(p.length(), 8);

        let p = Prefix::canonicalize("2001:db8::1".parse().unwrap(), 32).unwrap();
        assert_eq!(p.to_string(), "2001:db8::/32");
    }

    #[test]
    fn test_prefix_strict_rejects_host_bits() {
        let err = Prefix::try_new("10.1.2.3".parse().unwrap(), 8).unwrap_err();
        assert!(matches!(err, PrefixError::HostBitsSet(_)));

        assert!(Prefix::try_new("10.0.0.0".parse().unwrap(), 8).is_ok());
    }

    #[test]
    fn test_prefix_invalid_length() {
        assert!(matches!(
            Prefix::canonicalize("10.0.0.0".parse().unwrap(), 33),
            Err(PrefixError::InvalidLength(33))
        ));
        assert!(matches!(
            Prefix::canonicalize("::".parse().unwrap(), 129),
            Err(PrefixError::InvalidLength(129))
        ));
    }

    #[test]
    fn test_prefix_parse_roundtrip() {
        for s in ["0.0.0.0/0", "10.0.0.0/8", "192.0.2.0/30", "2001:db8::/32", "::/0"] {
            let p = Prefix::from_str(s).unwrap();
            assert_eq!(p.to_string(), s);
        }
    }

    #[test]
    fn test_prefix_covers() {
        let p = Prefix::expect_from(("192.0.2.0", 30));
        assert!(p.covers_addr(&"192.0.2.1".parse().unwrap()));
        assert!(!p.covers_addr(&"192.0.2.4".parse().unwrap()));
        assert!(!p.covers_addr(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_host_prefix() {
        assert!(Prefix::host("10.0.0.1".parse().unwrap()).is_host());
        assert_eq!(Prefix::host("10.0.0.1".parse().unwrap()).length(), 32);
        assert_eq!(Prefix::host("2001:db8::1".parse().unwrap()).length(), 128);
    }

    #[test]
    fn test_prefix_json_string_form() {
        let p = Prefix::expect_from(("10.0.0.0", 8));
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"10.0.0.0/8\"");
        let back: Prefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
