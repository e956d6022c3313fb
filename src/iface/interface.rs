//! Network interface state
//!
//! An interface owns its link address, its single configured address and
//! prefix, an up/down flag, and the append-only log of frames it observed.
//! It also answers the addressing questions input processing asks:
//! - Is this destination ours (unicast or broadcast)?
//! - Which subnet does the interface sit on?

use crate::error::{NetError, Result};
use crate::iface::ip::{AddressFamily, NetworkAddress};
use crate::iface::virtual_network::SegmentId;
use crate::network::ethernet::MacAddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable small integer naming an interface within its host.
pub type IfIndex = u32;

/// One frame as seen on an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub data: Vec<u8>,
}

impl CapturedFrame {
    pub fn now(data: Vec<u8>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        CapturedFrame { timestamp_ms, data }
    }
}

/// Address assignment applied by `configure_interface`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub address: NetworkAddress,
    pub prefix_len: u8,
}

impl InterfaceConfig {
    pub fn new(address: NetworkAddress, prefix_len: u8) -> Self {
        InterfaceConfig { address, prefix_len }
    }
}

/// Network interface attached to a segment of the virtual network
#[derive(Debug)]
pub struct Interface {
    pub index: IfIndex,
    pub name: String,
    pub mac: MacAddr,
    pub family: AddressFamily,
    pub address: NetworkAddress,
    pub prefix_len: u8,
    pub up: bool,
    pub segment: SegmentId,
    /// Bumped on every reconfiguration; ARP entries from older generations are stale.
    pub(crate) arp_generation: u64,
    captures: Vec<CapturedFrame>,
}

impl Interface {
    /// Create an unconfigured, up interface
    pub fn new(index: IfIndex, name: &str, mac: MacAddr, family: AddressFamily, segment: SegmentId) -> Self {
        Interface {
            index,
            name: name.to_string(),
            mac,
            family,
            address: family.unspecified(),
            prefix_len: 0,
            up: true,
            segment,
            arp_generation: 0,
            captures: Vec::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.address.is_unspecified()
    }

    /// Replace address and prefix in one step.
    ///
    /// Returns the previous assignment.
    pub(crate) fn apply(&mut self, config: InterfaceConfig) -> Result<InterfaceConfig> {
        if config.address.family() != self.family {
            return Err(NetError::InvalidAddress(format!(
                "{} does not match the {:?} family of {}",
                config.address, self.family, self.name
            )));
        }
        if config.prefix_len > self.family.bit_width() {
            return Err(NetError::InvalidAddress(format!(
                "prefix length {} out of range for {}",
                config.prefix_len, self.name
            )));
        }
        let previous = InterfaceConfig::new(self.address, self.prefix_len);
        self.address = config.address;
        self.prefix_len = config.prefix_len;
        self.arp_generation += 1;
        Ok(previous)
    }

    /// Check if packet is destined for this interface
    pub fn is_for_us(&self, dst_addr: &NetworkAddress) -> bool {
        // Check if it's our unicast address
        if self.is_configured() && dst_addr == &self.address {
            return true;
        }

        // Check if it's a broadcast address
        self.is_broadcast_address(dst_addr)
    }

    /// Check if address is a broadcast address
    pub fn is_broadcast_address(&self, addr: &NetworkAddress) -> bool {
        // Limited broadcast (255.255.255.255)
        if addr.is_limited_broadcast() {
            return true;
        }

        // Directed broadcast for our network
        self.directed_broadcast().map_or(false, |b| &b == addr)
    }

    /// Directed broadcast of the configured IPv4 subnet, if there is one.
    pub fn directed_broadcast(&self) -> Option<NetworkAddress> {
        let local = self.address.octets_v4()?;
        if !self.is_configured() || self.prefix_len >= 31 {
            return None;
        }
        let mask = NetworkAddress::netmask(AddressFamily::V4, self.prefix_len).ok()?.octets_v4()?;
        let mut broadcast_addr = [0u8; 4];
        for i in 0..4 {
            broadcast_addr[i] = local[i] | !mask[i];
        }
        Some(NetworkAddress::V4(broadcast_addr))
    }

    /// Get network address
    pub fn network_address(&self) -> NetworkAddress {
        self.address.mask(self.prefix_len).unwrap_or(self.address)
    }

    /// Check if address is in the same network
    pub fn is_same_network(&self, addr: &NetworkAddress) -> bool {
        self.is_configured() && self.address.same_subnet(addr, self.prefix_len)
    }

    pub(crate) fn log_frame(&mut self, data: &[u8]) {
        self.captures.push(CapturedFrame::now(data.to_vec()));
    }

    pub fn captures(&self) -> &[CapturedFrame] {
        &self.captures
    }

    pub fn info(&self) -> InterfaceInfo {
        InterfaceInfo {
            index: self.index,
            name: self.name.clone(),
            mac: self.mac,
            address: self.address,
            prefix_len: self.prefix_len,
            up: self.up,
            frames_captured: self.captures.len(),
        }
    }
}

/// Snapshot of an interface for `ip addr`-style listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub index: IfIndex,
    pub name: String,
    pub mac: MacAddr,
    pub address: NetworkAddress,
    pub prefix_len: u8,
    pub up: bool,
    pub frames_captured: usize,
}

impl fmt::Display for InterfaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.up { "UP" } else { "DOWN" };
        write!(
            f,
            "{}: {} <{}> link/ether {} inet {}/{}",
            self.index, self.name, state, self.mac, self.address, self.prefix_len
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(addr: NetworkAddress, prefix: u8) -> Interface {
        let mut iface = Interface::new(0, "eth0", MacAddr::local(1, 0), AddressFamily::V4, SegmentId(0));
        iface.apply(InterfaceConfig::new(addr, prefix)).unwrap();
        iface
    }

    #[test]
    fn test_network_interface_creation() {
        let iface = iface(NetworkAddress::v4(192, 168, 1, 1), 24);
        assert_eq!(iface.address, NetworkAddress::v4(192, 168, 1, 1));
        assert_eq!(iface.network_address(), NetworkAddress::v4(192, 168, 1, 0));
        assert_eq!(iface.arp_generation, 1);
    }

    #[test]
    fn test_broadcast_detection() {
        let iface = iface(NetworkAddress::v4(192, 168, 1, 1), 24);

        // Limited broadcast
        assert!(iface.is_broadcast_address(&NetworkAddress::BROADCAST_V4));

        // Directed broadcast
        assert!(iface.is_broadcast_address(&NetworkAddress::v4(192, 168, 1, 255)));

        // Not broadcast
        assert!(!iface.is_broadcast_address(&NetworkAddress::v4(192, 168, 1, 2)));
    }

    #[test]
    fn test_same_network_detection() {
        let iface = iface(NetworkAddress::v4(192, 168, 1, 1), 24);

        assert!(iface.is_same_network(&NetworkAddress::v4(192, 168, 1, 100)));
        assert!(!iface.is_same_network(&NetworkAddress::v4(192, 168, 2, 1)));
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let mut iface = iface(NetworkAddress::v4(10, 0, 0, 1), 8);
        let err = iface
            .apply(InterfaceConfig::new("fe80::1".parse().unwrap(), 64))
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidAddress(_)));
        assert_eq!(iface.address, NetworkAddress::v4(10, 0, 0, 1));
        assert!(iface.apply(InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 1), 33)).is_err());
    }

    #[test]
    fn test_unconfigured_only_accepts_limited_broadcast() {
        let iface = Interface::new(0, "eth0", MacAddr::local(1, 0), AddressFamily::V4, SegmentId(0));
        assert!(iface.is_for_us(&NetworkAddress::BROADCAST_V4));
        assert!(!iface.is_for_us(&NetworkAddress::UNSPECIFIED_V4));
    }
}
