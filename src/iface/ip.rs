//! Network address value type shared by interfaces, routes, sockets and ARP.

use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Width of an address of this family in bits.
    pub fn bit_width(self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }

    pub fn unspecified(self) -> NetworkAddress {
        match self {
            AddressFamily::V4 => NetworkAddress::V4([0; 4]),
            AddressFamily::V6 => NetworkAddress::V6([0; 16]),
        }
    }
}

/// An IPv4 or IPv6 address. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetworkAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl NetworkAddress {
    pub const UNSPECIFIED_V4: NetworkAddress = NetworkAddress::V4([0, 0, 0, 0]);
    pub const BROADCAST_V4: NetworkAddress = NetworkAddress::V4([255, 255, 255, 255]);
    pub const LOOPBACK_V4: NetworkAddress = NetworkAddress::V4([127, 0, 0, 1]);

    pub const fn v4(a: u8, b: u8, c: u8, d: u8) -> Self {
        NetworkAddress::V4([a, b, c, d])
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            NetworkAddress::V4(_) => AddressFamily::V4,
            NetworkAddress::V6(_) => AddressFamily::V6,
        }
    }

    /// The address as an unsigned integer, right-aligned.
    pub fn to_bits(&self) -> u128 {
        match self {
            NetworkAddress::V4(octets) => u32::from_be_bytes(*octets) as u128,
            NetworkAddress::V6(octets) => u128::from_be_bytes(*octets),
        }
    }

    pub fn from_bits(family: AddressFamily, bits: u128) -> Self {
        match family {
            AddressFamily::V4 => NetworkAddress::V4((bits as u32).to_be_bytes()),
            AddressFamily::V6 => NetworkAddress::V6(bits.to_be_bytes()),
        }
    }

    /// Keep the leading `prefix_len` bits and zero the rest.
    pub fn mask(&self, prefix_len: u8) -> Result<Self> {
        let family = self.family();
        let mask = prefix_mask(family, prefix_len)?;
        Ok(Self::from_bits(family, self.to_bits() & mask))
    }

    /// Netmask of the given length in this address's family, e.g. 255.255.255.0 for /24.
    pub fn netmask(family: AddressFamily, prefix_len: u8) -> Result<Self> {
        Ok(Self::from_bits(family, prefix_mask(family, prefix_len)?))
    }

    /// Whether `self` and `other` share the same leading `prefix_len` bits.
    pub fn same_subnet(&self, other: &NetworkAddress, prefix_len: u8) -> bool {
        if self.family() != other.family() {
            return false;
        }
        match prefix_mask(self.family(), prefix_len) {
            Ok(mask) => self.to_bits() & mask == other.to_bits() & mask,
            Err(_) => false,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.to_bits() == 0
    }

    pub fn is_loopback(&self) -> bool {
        match self {
            NetworkAddress::V4(octets) => octets[0] == 127,
            NetworkAddress::V6(_) => self.to_bits() == 1,
        }
    }

    pub fn is_limited_broadcast(&self) -> bool {
        *self == Self::BROADCAST_V4
    }

    pub fn octets_v4(&self) -> Option<[u8; 4]> {
        match self {
            NetworkAddress::V4(octets) => Some(*octets),
            NetworkAddress::V6(_) => None,
        }
    }

    /// IPv4 octets, or `InvalidAddress` for an IPv6 value.
    pub fn require_v4(&self) -> Result<[u8; 4]> {
        self.octets_v4()
            .ok_or_else(|| NetError::InvalidAddress(format!("{} is not an IPv4 address", self)))
    }
}

/// Bit mask with the leading `prefix_len` bits of the family set.
pub fn prefix_mask(family: AddressFamily, prefix_len: u8) -> Result<u128> {
    let width = family.bit_width();
    if prefix_len > width {
        return Err(NetError::InvalidAddress(format!(
            "prefix length {} exceeds {} bits",
            prefix_len, width
        )));
    }
    if prefix_len == 0 {
        return Ok(0);
    }
    let all = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
    Ok(all & (all << (width - prefix_len)))
}

/// Prefix length of a contiguous netmask such as 255.255.255.0.
pub fn mask_to_prefix(mask: &NetworkAddress) -> Result<u8> {
    let bits = mask.to_bits();
    let ones = bits.count_ones() as u8;
    if prefix_mask(mask.family(), ones)? != bits {
        return Err(NetError::InvalidAddress(format!("{} is not a contiguous netmask", mask)));
    }
    Ok(ones)
}

/// Parse `a.b.c.d/len` notation.
pub fn parse_cidr(text: &str) -> Result<(NetworkAddress, u8)> {
    let (addr, len) = text
        .split_once('/')
        .ok_or_else(|| NetError::InvalidAddress(format!("missing prefix length in {}", text)))?;
    let addr: NetworkAddress = addr.parse()?;
    let len: u8 = len
        .parse()
        .map_err(|_| NetError::InvalidAddress(format!("bad prefix length in {}", text)))?;
    prefix_mask(addr.family(), len)?;
    Ok((addr, len))
}

impl FromStr for NetworkAddress {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<std::net::IpAddr>()
            .map(NetworkAddress::from)
            .map_err(|_| NetError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkAddress::V4(octets) => std::net::Ipv4Addr::from(*octets).fmt(f),
            NetworkAddress::V6(octets) => std::net::Ipv6Addr::from(*octets).fmt(f),
        }
    }
}

impl From<[u8; 4]> for NetworkAddress {
    fn from(octets: [u8; 4]) -> Self {
        NetworkAddress::V4(octets)
    }
}

impl From<std::net::IpAddr> for NetworkAddress {
    fn from(addr: std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(v4) => NetworkAddress::V4(v4.octets()),
            std::net::IpAddr::V6(v6) => NetworkAddress::V6(v6.octets()),
        }
    }
}

impl Serialize for NetworkAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NetworkAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
