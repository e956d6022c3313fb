//! Virtual network: the simulated wire.
//!
//! The network owns every host and every segment (broadcast domain) plus a
//! queue of frames in flight. Anything that emits a packet pumps the queue
//! until it is empty, so all reactions to an operation (ARP synthesis,
//! forwarding, replies, socket wakeups) have happened by the time the
//! operation returns.
//!
//! All state sits behind one mutex. The lock is only ever held for a
//! synchronous state transition, never across an `.await`.

use crate::config::StackConfig;
use crate::error::{NetError, Result};
use crate::iface::host::Host;
use crate::iface::interface::{IfIndex, Interface};
use crate::iface::ip::{AddressFamily, NetworkAddress};
use crate::iface::route::RouteDevice;
use crate::iface::stack::{Egress, HostId, HostState};
use crate::network::arp::ArpPacket;
use crate::network::ethernet::{EthernetHeader, MacAddr, ETHERNET_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Upper bound on frames handled by one pump; hitting it means a forwarding loop.
const MAX_FRAMES_PER_PUMP: usize = 100_000;

/// Identifies a broadcast domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u32);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg{}", self.0)
    }
}

type Port = (HostId, IfIndex);

#[derive(Debug)]
struct Segment {
    name: String,
    ports: Vec<Port>,
}

#[derive(Debug)]
enum WireEvent {
    Frame { segment: SegmentId, from: Port, frame: Vec<u8> },
    Loopback { host: HostId, packet: Vec<u8> },
}

#[derive(Debug)]
pub(crate) struct NetworkState {
    config: StackConfig,
    hosts: Vec<HostState>,
    segments: Vec<Segment>,
    wire: VecDeque<WireEvent>,
}

impl NetworkState {
    fn new(config: StackConfig) -> Self {
        NetworkState {
            config,
            hosts: Vec::new(),
            segments: Vec::new(),
            wire: VecDeque::new(),
        }
    }

    pub(crate) fn config(&self) -> &StackConfig {
        &self.config
    }

    pub(crate) fn host(&self, id: HostId) -> Result<&HostState> {
        self.hosts
            .get(id.0 as usize)
            .ok_or(NetError::InvalidArgument("unknown host"))
    }

    pub(crate) fn host_mut(&mut self, id: HostId) -> Result<&mut HostState> {
        self.hosts
            .get_mut(id.0 as usize)
            .ok_or(NetError::InvalidArgument("unknown host"))
    }

    pub(crate) fn add_interface(
        &mut self,
        host: HostId,
        name: &str,
        segment: SegmentId,
        family: AddressFamily,
    ) -> Result<IfIndex> {
        if self.segments.get(segment.0 as usize).is_none() {
            return Err(NetError::InvalidArgument("unknown segment"));
        }
        let state = self.host_mut(host)?;
        let index = state.interfaces.len() as IfIndex;
        let mac = MacAddr::local(host.0 as u16, index as u16);
        state.interfaces.push(Interface::new(index, name, mac, family, segment));
        info!("{}: added {} (if{}, {}) on {}", state.name, name, index, mac, segment);
        if let Some(seg) = self.segments.get_mut(segment.0 as usize) {
            seg.ports.push((host, index));
        }
        Ok(index)
    }

    /// Forget, network-wide, every cached mapping of `address` to `mac`.
    pub(crate) fn purge_arp(&mut self, address: &NetworkAddress, mac: MacAddr) {
        let purged: usize = self.hosts.iter_mut().map(|h| h.arp.purge(address, mac)).sum();
        if purged > 0 {
            debug!("arp: purged {} stale entries for {} at {}", purged, address, mac);
        }
    }

    /// Put a host's outbox on the wire and run the network until quiet.
    pub(crate) fn transmit(&mut self, host: HostId, outbox: Vec<Egress>) {
        for egress in outbox {
            self.dispatch(host, egress);
        }
        self.pump();
    }

    fn dispatch(&mut self, host: HostId, egress: Egress) {
        let index = match egress.device {
            RouteDevice::Loopback => {
                self.wire.push_back(WireEvent::Loopback {
                    host,
                    packet: egress.packet,
                });
                return;
            }
            RouteDevice::Interface(index) => index,
        };
        let Some(iface) = self.interface(host, index) else {
            return;
        };
        if !iface.up {
            debug!("{}: if{} down, packet dropped", iface.name, index);
            return;
        }
        let (src_mac, segment) = (iface.mac, iface.segment);
        let Some(dst_mac) = self.resolve(host, index, egress.next_hop) else {
            return;
        };
        let frame = EthernetHeader {
            dst: dst_mac,
            src: src_mac,
            ethertype: ETHERTYPE_IPV4,
        }
        .frame(&egress.packet);
        if let Some(iface) = self.interface_mut(host, index) {
            iface.log_frame(&frame);
        }
        self.wire.push_back(WireEvent::Frame {
            segment,
            from: (host, index),
            frame,
        });
    }

    /// Link address for `next_hop` on `(host, index)`, synthesizing an ARP
    /// exchange on a cache miss.
    fn resolve(&mut self, host: HostId, index: IfIndex, next_hop: NetworkAddress) -> Option<MacAddr> {
        let iface = self.interface(host, index)?;
        if next_hop.is_limited_broadcast() || iface.directed_broadcast() == Some(next_hop) {
            return Some(MacAddr::BROADCAST);
        }
        let generation = iface.arp_generation;
        let (src_mac, src_ip, segment) = (iface.mac, iface.address.octets_v4()?, iface.segment);
        let state = self.hosts.get(host.0 as usize)?;
        if let Some(mac) = state.arp.lookup(index, &next_hop, generation) {
            return Some(mac);
        }

        let target_ip = next_hop.octets_v4()?;
        let owner = self.segments.get(segment.0 as usize)?.ports.iter().copied().find(|&port| {
            port != (host, index)
                && self
                    .interface(port.0, port.1)
                    .map_or(false, |o| o.up && o.is_configured() && o.address == next_hop)
        });
        let Some((owner_host, owner_index)) = owner else {
            debug!("arp: {} unresolved on {}", next_hop, segment);
            return None;
        };
        let (owner_mac, owner_generation) = {
            let o = self.interface(owner_host, owner_index)?;
            (o.mac, o.arp_generation)
        };

        let request = ArpPacket::request(src_mac, src_ip, target_ip);
        let reply = request.reply(owner_mac);
        let request_frame = EthernetHeader {
            dst: MacAddr::BROADCAST,
            src: src_mac,
            ethertype: ETHERTYPE_ARP,
        }
        .frame(&request.to_bytes());
        let reply_frame = EthernetHeader {
            dst: src_mac,
            src: owner_mac,
            ethertype: ETHERTYPE_ARP,
        }
        .frame(&reply.to_bytes());
        for port in [(host, index), (owner_host, owner_index)] {
            if let Some(iface) = self.interface_mut(port.0, port.1) {
                iface.log_frame(&request_frame);
                iface.log_frame(&reply_frame);
            }
        }

        self.hosts.get_mut(host.0 as usize)?.arp.insert(index, next_hop, owner_mac, generation);
        // The target learns the requester too, as real ARP does.
        let requester = NetworkAddress::V4(src_ip);
        if !requester.is_unspecified() {
            if let Some(owner) = self.hosts.get_mut(owner_host.0 as usize) {
                owner.arp.insert(owner_index, requester, src_mac, owner_generation);
            }
        }
        Some(owner_mac)
    }

    fn pump(&mut self) {
        let mut handled = 0;
        while let Some(event) = self.wire.pop_front() {
            handled += 1;
            if handled > MAX_FRAMES_PER_PUMP {
                warn!("wire: {} frames in one pump, dropping {} queued", handled - 1, self.wire.len() + 1);
                self.wire.clear();
                return;
            }
            match event {
                WireEvent::Loopback { host, packet } => self.deliver(host, None, &packet),
                WireEvent::Frame { segment, from, frame } => self.deliver_frame(segment, from, &frame),
            }
        }
    }

    fn deliver_frame(&mut self, segment: SegmentId, from: Port, frame: &[u8]) {
        let Some(eth) = EthernetHeader::from_bytes(frame) else {
            return;
        };
        let ports = match self.segments.get(segment.0 as usize) {
            Some(seg) => seg.ports.clone(),
            None => return,
        };
        for (host, index) in ports {
            if (host, index) == from {
                continue;
            }
            let Some(iface) = self.interface_mut(host, index) else {
                continue;
            };
            if !iface.up || !(eth.dst == iface.mac || eth.dst.is_broadcast()) {
                continue;
            }
            iface.log_frame(frame);
            if eth.ethertype == ETHERTYPE_IPV4 {
                self.deliver(host, Some(index), &frame[ETHERNET_HEADER_LEN..]);
            }
        }
    }

    fn deliver(&mut self, host: HostId, ingress: Option<IfIndex>, packet: &[u8]) {
        let mut outbox = Vec::new();
        match self.hosts.get_mut(host.0 as usize) {
            Some(state) => state.process_ipv4_packet(ingress, packet, &mut outbox),
            None => return,
        }
        for egress in outbox {
            self.dispatch(host, egress);
        }
    }

    fn interface(&self, host: HostId, index: IfIndex) -> Option<&Interface> {
        self.hosts.get(host.0 as usize)?.interfaces.get(index as usize)
    }

    fn interface_mut(&mut self, host: HostId, index: IfIndex) -> Option<&mut Interface> {
        self.hosts.get_mut(host.0 as usize)?.interfaces.get_mut(index as usize)
    }
}

/// Handle to a simulated network. Clones share the same network.
#[derive(Debug, Clone)]
pub struct VirtualNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for VirtualNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualNetwork {
    /// Create an empty network with the default stack configuration.
    pub fn new() -> Self {
        VirtualNetwork {
            state: Arc::new(Mutex::new(NetworkState::new(StackConfig::default()))),
        }
    }

    /// Create an empty network after validating `config`.
    pub fn with_config(config: StackConfig) -> Result<Self> {
        config.validate()?;
        Ok(VirtualNetwork {
            state: Arc::new(Mutex::new(NetworkState::new(config))),
        })
    }

    pub fn config(&self) -> StackConfig {
        self.lock().config().clone()
    }

    /// Add a broadcast domain.
    pub fn add_segment(&self, name: &str) -> SegmentId {
        let mut state = self.lock();
        let id = SegmentId(state.segments.len() as u32);
        state.segments.push(Segment {
            name: name.to_string(),
            ports: Vec::new(),
        });
        info!("wire: added segment {} ({})", name, id);
        id
    }

    /// Add a host with no interfaces besides loopback.
    pub fn add_host(&self, name: &str) -> Host {
        let mut state = self.lock();
        let id = HostId(state.hosts.len() as u32);
        let config = state.config.clone();
        state.hosts.push(HostState::new(id, name, config));
        info!("wire: added host {}", name);
        Host::new(self.clone(), id)
    }

    /// Segment names in creation order.
    pub fn segments(&self) -> Vec<(SegmentId, String)> {
        self.lock()
            .segments
            .iter()
            .enumerate()
            .map(|(i, s)| (SegmentId(i as u32), s.name.clone()))
            .collect()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::interface::InterfaceConfig;

    #[test]
    fn test_arp_synthesis_is_logged_and_cached() {
        let net = VirtualNetwork::new();
        let lan = net.add_segment("lan");
        let a = net.add_host("a");
        let b = net.add_host("b");
        let ia = a.add_interface("eth0", lan).unwrap();
        let ib = b.add_interface("eth0", lan).unwrap();
        a.configure_interface(ia, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 1), 24)).unwrap();
        b.configure_interface(ib, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 2), 24)).unwrap();

        let mut state = net.lock();
        let mac = state.resolve(a.id(), ia, NetworkAddress::v4(10, 0, 0, 2));
        assert_eq!(mac, Some(MacAddr::local(1, 0)));
        assert_eq!(state.interface(a.id(), ia).unwrap().captures().len(), 2);
        assert_eq!(state.interface(b.id(), ib).unwrap().captures().len(), 2);

        // Second resolution is a cache hit and logs nothing.
        state.resolve(a.id(), ia, NetworkAddress::v4(10, 0, 0, 2));
        assert_eq!(state.interface(a.id(), ia).unwrap().captures().len(), 2);
        assert_eq!(state.resolve(a.id(), ia, NetworkAddress::v4(10, 0, 0, 3)), None);
    }

    #[test]
    fn test_reconfigure_purges_peer_cache() {
        let net = VirtualNetwork::new();
        let lan = net.add_segment("lan");
        let a = net.add_host("a");
        let b = net.add_host("b");
        let ia = a.add_interface("eth0", lan).unwrap();
        let ib = b.add_interface("eth0", lan).unwrap();
        a.configure_interface(ia, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 1), 24)).unwrap();
        b.configure_interface(ib, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 2), 24)).unwrap();
        net.lock().resolve(a.id(), ia, NetworkAddress::v4(10, 0, 0, 2));
        assert_eq!(a.arp_table().len(), 1);
        assert_eq!(b.arp_table().len(), 1);

        b.configure_interface(ib, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 3), 24)).unwrap();
        assert!(a.arp_table().is_empty());
        assert!(b.arp_table().is_empty());
    }

    #[test]
    fn test_unknown_segment_rejected() {
        let net = VirtualNetwork::new();
        let host = net.add_host("h");
        assert!(host.add_interface("eth0", SegmentId(9)).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StackConfig {
            default_ttl: 0,
            ..StackConfig::default()
        };
        assert!(matches!(VirtualNetwork::with_config(config), Err(NetError::Config(_))));
    }
}
