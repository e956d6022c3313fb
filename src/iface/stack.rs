//! Per-host stack state
//!
//! A `HostState` owns everything one node needs: interfaces, routing table,
//! ARP cache, socket tables and pending echo probes. Protocol handlers never
//! touch the wire directly; they push [`Egress`] records into an outbox that
//! the virtual network drains after the handler returns.

use crate::config::StackConfig;
use crate::error::{NetError, Result};
use crate::iface::arp::ArpCache;
use crate::iface::interface::{IfIndex, Interface, InterfaceConfig};
use crate::iface::ip::NetworkAddress;
use crate::iface::route::{RouteDevice, RouteTable};
use crate::network::ethernet::MacAddr;
use crate::network::icmp::IcmpUtils;
use crate::network::ipv4::{protocol, Ipv4Header, Ipv4Utils};
use crate::socket::waiter::Waiter;
use crate::socket::SocketTable;
use log::{debug, info};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Identifies a host within its virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub u32);

/// An IPv4 packet ready to leave a host.
#[derive(Debug, Clone)]
pub(crate) struct Egress {
    pub device: RouteDevice,
    pub next_hop: NetworkAddress,
    pub packet: Vec<u8>,
}

/// How to reach one destination: the outgoing device, the link-level next
/// hop and the source address to stamp on the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputPath {
    pub device: RouteDevice,
    pub next_hop: NetworkAddress,
    pub src: [u8; 4],
}

/// Outcome of an outstanding echo probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EchoEvent {
    Reply { from: NetworkAddress, ttl: u8, bytes: usize },
    TimeExceeded { from: NetworkAddress, ttl: u8, bytes: usize },
    Unreachable { from: NetworkAddress },
}

#[derive(Debug)]
pub(crate) struct HostState {
    pub id: HostId,
    pub name: String,
    pub interfaces: Vec<Interface>,
    pub routes: RouteTable,
    pub arp: ArpCache,
    pub sockets: SocketTable,
    pub forwarding: bool,
    pub echo_waiters: HashMap<(u16, u16), Waiter<EchoEvent>>,
    pub config: StackConfig,
    next_ip_id: u16,
    next_iss: u32,
}

impl HostState {
    pub(crate) fn new(id: HostId, name: &str, config: StackConfig) -> Self {
        let mut routes = RouteTable::new();
        routes.add_loopback();
        HostState {
            id,
            name: name.to_string(),
            interfaces: Vec::new(),
            routes,
            arp: ArpCache::new(),
            sockets: SocketTable::new(),
            forwarding: false,
            echo_waiters: HashMap::new(),
            config,
            next_ip_id: 1,
            next_iss: 1000 + id.0.wrapping_mul(100_000),
        }
    }

    pub(crate) fn interface(&self, index: IfIndex) -> Result<&Interface> {
        self.interfaces
            .get(index as usize)
            .ok_or(NetError::InvalidInterface(index))
    }

    pub(crate) fn interface_mut(&mut self, index: IfIndex) -> Result<&mut Interface> {
        self.interfaces
            .get_mut(index as usize)
            .ok_or(NetError::InvalidInterface(index))
    }

    /// Apply an address assignment and rebuild the interface's connected route.
    ///
    /// Returns the previous assignment and the interface's link address.
    pub(crate) fn configure_interface(
        &mut self,
        index: IfIndex,
        config: InterfaceConfig,
    ) -> Result<(InterfaceConfig, MacAddr)> {
        let iface = self.interface_mut(index)?;
        let previous = iface.apply(config)?;
        let mac = iface.mac;
        if iface.is_configured() {
            self.routes.set_connected(index, config.address, config.prefix_len)?;
        } else {
            self.routes.remove_connected(index);
        }
        info!(
            "{}: if{} configured {}/{} (was {}/{})",
            self.name, index, config.address, config.prefix_len, previous.address, previous.prefix_len
        );
        Ok((previous, mac))
    }

    pub(crate) fn device_up(&self, device: RouteDevice) -> bool {
        match device {
            RouteDevice::Loopback => true,
            RouteDevice::Interface(index) => self.interfaces.get(index as usize).map_or(false, |i| i.up),
        }
    }

    /// Whether `addr` is one of this host's own addresses (loopback included).
    pub(crate) fn is_local_address(&self, addr: &NetworkAddress) -> bool {
        addr.is_loopback()
            || self
                .interfaces
                .iter()
                .any(|i| i.is_configured() && &i.address == addr)
    }

    /// Acceptable local bind addresses: unspecified, loopback or an interface address.
    pub(crate) fn check_bind_address(&self, addr: &NetworkAddress) -> Result<()> {
        if addr.is_unspecified() || self.is_local_address(addr) {
            Ok(())
        } else {
            Err(NetError::InvalidAddress(format!("{} is not a local address of {}", addr, self.name)))
        }
    }

    /// Source address used for packets leaving through `device`.
    pub(crate) fn select_source_address(&self, device: RouteDevice, dst: &NetworkAddress) -> NetworkAddress {
        match device {
            RouteDevice::Loopback => *dst,
            RouteDevice::Interface(index) => self
                .interfaces
                .get(index as usize)
                .map_or(NetworkAddress::UNSPECIFIED_V4, |i| i.address),
        }
    }

    /// Resolve where a packet to `dst` should go.
    ///
    /// `bound` is the sender's bound address (unspecified picks the outgoing
    /// interface's address). `pinned` restricts output to one interface.
    /// Limited broadcast yields one path per eligible up interface.
    pub(crate) fn output_paths(
        &self,
        dst: &NetworkAddress,
        bound: Option<NetworkAddress>,
        pinned: Option<IfIndex>,
    ) -> Result<Vec<OutputPath>> {
        dst.require_v4()?;
        let bound = bound.filter(|b| !b.is_unspecified());
        let source = |device: RouteDevice| -> Result<[u8; 4]> {
            bound
                .unwrap_or_else(|| self.select_source_address(device, dst))
                .require_v4()
        };

        if dst.is_limited_broadcast() {
            let mut paths = Vec::new();
            for iface in &self.interfaces {
                if !iface.up || iface.address.octets_v4().is_none() || pinned.map_or(false, |p| p != iface.index) {
                    continue;
                }
                let device = RouteDevice::Interface(iface.index);
                paths.push(OutputPath {
                    device,
                    next_hop: *dst,
                    src: source(device)?,
                });
            }
            if paths.is_empty() {
                return Err(NetError::NoRoute);
            }
            return Ok(paths);
        }

        if pinned.is_none() && self.is_local_address(dst) {
            return Ok(vec![OutputPath {
                device: RouteDevice::Loopback,
                next_hop: *dst,
                src: source(RouteDevice::Loopback)?,
            }]);
        }

        let hit = self
            .routes
            .lookup(dst, |device| {
                self.device_up(device) && pinned.map_or(true, |p| device == RouteDevice::Interface(p))
            })
            .ok_or(NetError::NoRoute)?;
        Ok(vec![OutputPath {
            device: hit.device,
            next_hop: hit.next_hop,
            src: source(hit.device)?,
        }])
    }

    /// Wrap `payload` in an IPv4 header and queue it on `path`.
    pub(crate) fn emit_ipv4(
        &mut self,
        path: &OutputPath,
        dst: [u8; 4],
        protocol: u8,
        ttl: u8,
        payload: &[u8],
        out: &mut Vec<Egress>,
    ) {
        let mut header = Ipv4Header::new_simple(protocol, path.src, dst, payload.len() as u16);
        header.ttl = ttl;
        header.id = self.next_ip_id;
        self.next_ip_id = self.next_ip_id.wrapping_add(1);
        out.push(Egress {
            device: path.device,
            next_hop: path.next_hop,
            packet: Ipv4Utils::create_packet_with_payload(&header, payload),
        });
    }

    /// Route and emit in one step, stamping the default TTL.
    pub(crate) fn send_ipv4(
        &mut self,
        dst: &NetworkAddress,
        bound: Option<NetworkAddress>,
        protocol: u8,
        payload: &[u8],
        out: &mut Vec<Egress>,
    ) -> Result<()> {
        let dst4 = dst.require_v4()?;
        let ttl = self.config.default_ttl;
        for path in self.output_paths(dst, bound, None)? {
            self.emit_ipv4(&path, dst4, protocol, ttl, payload, out);
        }
        Ok(())
    }

    /// Next initial sequence number for an active or passive open.
    pub(crate) fn next_iss(&mut self) -> u32 {
        let iss = self.next_iss;
        self.next_iss = self.next_iss.wrapping_add(64_000);
        iss
    }

    /// Send an echo request and register its waiter.
    pub(crate) fn begin_echo(
        &mut self,
        dst: &NetworkAddress,
        identifier: u16,
        sequence: u16,
        payload: &[u8],
        ttl: Option<u8>,
        out: &mut Vec<Egress>,
    ) -> Result<oneshot::Receiver<EchoEvent>> {
        if ttl == Some(0) {
            return Err(NetError::InvalidArgument("ttl must be at least 1"));
        }
        let dst4 = dst.require_v4()?;
        let path = self
            .output_paths(dst, None, None)?
            .into_iter()
            .next()
            .ok_or(NetError::NoRoute)?;
        let rx = self.echo_waiters.entry((identifier, sequence)).or_default().arm()?;
        let message = IcmpUtils::create_echo_request(identifier, sequence, payload);
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        debug!("{}: echo {}/{} to {} ttl {}", self.name, identifier, sequence, dst, ttl);
        self.emit_ipv4(&path, dst4, protocol::ICMP, ttl, &message, out);
        Ok(rx)
    }

    /// Forget an echo whose caller stopped waiting.
    pub(crate) fn cancel_echo(&mut self, key: (u16, u16)) {
        if self.echo_waiters.get(&key).map_or(false, |w| !w.is_armed()) {
            self.echo_waiters.remove(&key);
        }
    }

    /// Resolve the pending echo keyed by `key`, if any.
    pub(crate) fn complete_echo(&mut self, key: (u16, u16), event: EchoEvent) {
        match self.echo_waiters.remove(&key) {
            Some(mut waiter) => {
                if waiter.wake(event).is_err() {
                    debug!("{}: echo {:?} resolved after its caller gave up", self.name, key);
                }
            }
            None => debug!("{}: no echo pending for {:?}", self.name, key),
        }
    }
}
