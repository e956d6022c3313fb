//! Routing table with longest-prefix-match lookup.
//!
//! Entries are either auto-generated from interface configuration (the
//! connected subnet, at most one per interface) or added manually (default
//! gateway, static routes). Reconfiguring an interface replaces its
//! auto-generated entry but never touches manual ones.
//!
//! Lookup picks the matching entry with the longest prefix; among equal
//! prefixes the most recently added entry wins, so a fresh manual route
//! overrides an older auto route of the same length.

use crate::error::{NetError, Result};
use crate::iface::interface::IfIndex;
use crate::iface::ip::NetworkAddress;
use log::debug;
use std::fmt;

/// Where a route sends matching packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteDevice {
    Loopback,
    Interface(IfIndex),
}

impl fmt::Display for RouteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDevice::Loopback => f.write_str("lo"),
            RouteDevice::Interface(index) => write!(f, "if{}", index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// Network prefix, already masked to `prefix_len`.
    pub destination: NetworkAddress,
    pub prefix_len: u8,
    pub device: RouteDevice,
    /// Gateway; `None` means directly connected.
    pub next_hop: Option<NetworkAddress>,
    pub auto_generated: bool,
    /// Insertion order, used to break prefix-length ties.
    pub(crate) seq: u64,
}

impl RouteEntry {
    /// Returns `true` if `target` falls within this route's prefix.
    pub fn matches(&self, target: &NetworkAddress) -> bool {
        target.family() == self.destination.family()
            && self.destination.same_subnet(target, self.prefix_len)
    }

    /// Next-hop address for a destination matching this route.
    pub fn next_hop_for(&self, target: NetworkAddress) -> NetworkAddress {
        self.next_hop.unwrap_or(target)
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let is_default = self.prefix_len == 0;
        if is_default {
            f.write_str("default")?;
        } else {
            write!(f, "{}/{}", self.destination, self.prefix_len)?;
        }
        if let Some(gateway) = self.next_hop {
            write!(f, " via {}", gateway)?;
        }
        write!(f, " dev {}", self.device)?;
        if self.auto_generated {
            f.write_str(" proto kernel scope link")?;
        }
        Ok(())
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch {
    pub device: RouteDevice,
    pub next_hop: NetworkAddress,
    pub prefix_len: u8,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    next_seq: u64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a manual route.
    pub fn add(
        &mut self,
        destination: NetworkAddress,
        prefix_len: u8,
        device: RouteDevice,
        next_hop: Option<NetworkAddress>,
    ) -> Result<RouteEntry> {
        self.insert(destination, prefix_len, device, next_hop, false)
    }

    /// Replace the auto-generated subnet route of `index`.
    pub fn set_connected(&mut self, index: IfIndex, address: NetworkAddress, prefix_len: u8) -> Result<RouteEntry> {
        self.remove_connected(index);
        self.insert(address, prefix_len, RouteDevice::Interface(index), None, true)
    }

    /// Drop the auto-generated route of `index`, if any.
    pub fn remove_connected(&mut self, index: IfIndex) {
        let device = RouteDevice::Interface(index);
        self.entries.retain(|r| {
            let stale = r.auto_generated && r.device == device;
            if stale {
                debug!("route: removed connected {}", r);
            }
            !stale
        });
    }

    pub(crate) fn add_loopback(&mut self) {
        self.entries.push(RouteEntry {
            destination: NetworkAddress::v4(127, 0, 0, 0),
            prefix_len: 8,
            device: RouteDevice::Loopback,
            next_hop: None,
            auto_generated: true,
            seq: self.next_seq,
        });
        self.next_seq += 1;
    }

    fn insert(
        &mut self,
        destination: NetworkAddress,
        prefix_len: u8,
        device: RouteDevice,
        next_hop: Option<NetworkAddress>,
        auto_generated: bool,
    ) -> Result<RouteEntry> {
        if let Some(gateway) = next_hop {
            if gateway.family() != destination.family() {
                return Err(NetError::InvalidAddress(format!(
                    "gateway {} does not match destination {}",
                    gateway, destination
                )));
            }
        }
        let entry = RouteEntry {
            destination: destination.mask(prefix_len)?,
            prefix_len,
            device,
            next_hop,
            auto_generated,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        debug!("route: added {}", entry);
        self.entries.push(entry);
        Ok(entry)
    }

    /// Delete routes matching destination, prefix and device, and the gateway when given.
    ///
    /// Returns whether anything was removed. Missing routes are not an error.
    pub fn delete(
        &mut self,
        destination: NetworkAddress,
        prefix_len: u8,
        device: RouteDevice,
        next_hop: Option<NetworkAddress>,
    ) -> bool {
        let Ok(destination) = destination.mask(prefix_len) else {
            return false;
        };
        let before = self.entries.len();
        self.entries.retain(|r| {
            let hit = r.destination == destination
                && r.prefix_len == prefix_len
                && r.device == device
                && next_hop.map_or(true, |gw| r.next_hop == Some(gw));
            if hit {
                debug!("route: deleted {}", r);
            }
            !hit
        });
        before != self.entries.len()
    }

    /// Longest-prefix-match lookup over routes whose device is usable.
    pub fn lookup(&self, target: &NetworkAddress, usable: impl Fn(RouteDevice) -> bool) -> Option<RouteMatch> {
        self.entries
            .iter()
            .filter(|r| r.matches(target) && usable(r.device))
            .max_by_key(|r| (r.prefix_len, r.seq))
            .map(|r| RouteMatch {
                device: r.device,
                next_hop: r.next_hop_for(*target),
                prefix_len: r.prefix_len,
            })
    }

    /// All routes, most specific first.
    pub fn entries(&self) -> Vec<RouteEntry> {
        let mut routes = self.entries.clone();
        routes.sort_by(|a, b| b.prefix_len.cmp(&a.prefix_len).then(b.seq.cmp(&a.seq)));
        routes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
