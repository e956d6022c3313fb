//! Per-host neighbour cache: next-hop address to link address, per interface.
//!
//! Entries are soft state. Each one remembers the ARP generation of its
//! interface when it was learned; reconfiguring the interface bumps the
//! generation, so older entries stop resolving without an explicit sweep.

use crate::iface::interface::IfIndex;
use crate::iface::ip::NetworkAddress;
use crate::network::ethernet::MacAddr;
use log::debug;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub interface: IfIndex,
    pub address: NetworkAddress,
    pub mac: MacAddr,
}

impl fmt::Display for ArpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dev if{} lladdr {} REACHABLE", self.address, self.interface, self.mac)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    mac: MacAddr,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct ArpCache {
    entries: HashMap<(IfIndex, NetworkAddress), Slot>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `address` on `interface`, ignoring entries older than `generation`.
    pub fn lookup(&self, interface: IfIndex, address: &NetworkAddress, generation: u64) -> Option<MacAddr> {
        self.entries
            .get(&(interface, *address))
            .filter(|slot| slot.generation == generation)
            .map(|slot| slot.mac)
    }

    pub fn insert(&mut self, interface: IfIndex, address: NetworkAddress, mac: MacAddr, generation: u64) {
        debug!("arp: learned {} is-at {} on if{}", address, mac, interface);
        self.entries.insert((interface, address), Slot { mac, generation });
    }

    /// Forget every mapping of `address` to `mac`, on any interface.
    pub fn purge(&mut self, address: &NetworkAddress, mac: MacAddr) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(_, cached), slot| !(cached == address && slot.mac == mac));
        before - self.entries.len()
    }

    /// Live entries, given each interface's current generation.
    pub fn entries(&self, generation_of: impl Fn(IfIndex) -> Option<u64>) -> Vec<ArpEntry> {
        let mut live: Vec<ArpEntry> = self
            .entries
            .iter()
            .filter(|((interface, _), slot)| generation_of(*interface) == Some(slot.generation))
            .map(|((interface, address), slot)| ArpEntry {
                interface: *interface,
                address: *address,
                mac: slot.mac,
            })
            .collect();
        live.sort_by_key(|e| (e.interface, e.address));
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_generation_misses() {
        let mut cache = ArpCache::new();
        let addr = NetworkAddress::v4(10, 0, 0, 2);
        cache.insert(0, addr, MacAddr::local(2, 0), 1);
        assert_eq!(cache.lookup(0, &addr, 1), Some(MacAddr::local(2, 0)));
        assert_eq!(cache.lookup(0, &addr, 2), None);
        assert_eq!(cache.lookup(1, &addr, 1), None);
        assert!(cache.entries(|_| Some(2)).is_empty());
    }

    #[test]
    fn test_purge_matches_address_and_mac() {
        let mut cache = ArpCache::new();
        let addr = NetworkAddress::v4(10, 0, 0, 2);
        cache.insert(0, addr, MacAddr::local(2, 0), 0);
        cache.insert(1, addr, MacAddr::local(3, 0), 0);
        assert_eq!(cache.purge(&addr, MacAddr::local(2, 0)), 1);
        assert_eq!(cache.entries(|_| Some(0)).len(), 1);
    }
}
