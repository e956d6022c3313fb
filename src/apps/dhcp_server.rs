//! DHCP server: a lease pool plus a UDP loop on port 67.

use crate::error::{NetError, Result};
use crate::iface::host::Host;
use crate::iface::ip::{mask_to_prefix, NetworkAddress};
use crate::network::ethernet::MacAddr;
use crate::pdu::dhcp::{DhcpMessage, DhcpMessageType, BOOTREQUEST, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use crate::pdu::Pdu;
use crate::socket::UdpSocketHandle;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpServerConfig {
    /// Sent as the server identifier; must be one of the host's addresses.
    pub server_address: NetworkAddress,
    pub range_start: NetworkAddress,
    pub range_end: NetworkAddress,
    pub subnet_mask: NetworkAddress,
    pub router: Option<NetworkAddress>,
    pub dns_servers: Vec<NetworkAddress>,
    pub lease_time_secs: u32,
    /// How long an offered address stays reserved without a REQUEST.
    pub tentative_lease_secs: u32,
}

impl Default for DhcpServerConfig {
    fn default() -> Self {
        DhcpServerConfig {
            server_address: NetworkAddress::v4(192, 168, 1, 1),
            range_start: NetworkAddress::v4(192, 168, 1, 100),
            range_end: NetworkAddress::v4(192, 168, 1, 200),
            subnet_mask: NetworkAddress::v4(255, 255, 255, 0),
            router: Some(NetworkAddress::v4(192, 168, 1, 1)),
            dns_servers: Vec::new(),
            lease_time_secs: 86_400,
            tentative_lease_secs: 60,
        }
    }
}

impl DhcpServerConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: DhcpServerConfig =
            serde_json::from_str(text).map_err(|e| NetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let v4 = |addr: &NetworkAddress, what: &str| {
            addr.require_v4()
                .map_err(|_| NetError::Config(format!("{} must be IPv4, got {}", what, addr)))
        };
        v4(&self.server_address, "server_address")?;
        let start = u32::from_be_bytes(v4(&self.range_start, "range_start")?);
        let end = u32::from_be_bytes(v4(&self.range_end, "range_end")?);
        if start > end {
            return Err(NetError::Config(format!(
                "range {} - {} is reversed",
                self.range_start, self.range_end
            )));
        }
        v4(&self.subnet_mask, "subnet_mask")?;
        mask_to_prefix(&self.subnet_mask).map_err(|e| NetError::Config(e.to_string()))?;
        if let Some(router) = &self.router {
            v4(router, "router")?;
        }
        for server in &self.dns_servers {
            v4(server, "dns_servers")?;
        }
        if self.lease_time_secs == 0 || self.tentative_lease_secs == 0 {
            return Err(NetError::Config("lease times must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Reserved by an OFFER, waiting for the REQUEST.
    Offered,
    Bound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac: MacAddr,
    pub address: NetworkAddress,
    pub state: LeaseState,
    pub expires: Instant,
}

/// Address allocation for one range. Expired leases count as free.
#[derive(Debug, Clone)]
pub struct LeasePool {
    start: u32,
    end: u32,
    lease_time: Duration,
    tentative: Duration,
    leases: BTreeMap<u32, Lease>,
}

fn v4_bits(addr: &NetworkAddress) -> Option<u32> {
    addr.octets_v4().map(u32::from_be_bytes)
}

impl LeasePool {
    pub fn new(config: &DhcpServerConfig) -> Self {
        LeasePool {
            start: v4_bits(&config.range_start).unwrap_or(0),
            end: v4_bits(&config.range_end).unwrap_or(0),
            lease_time: Duration::from_secs(config.lease_time_secs as u64),
            tentative: Duration::from_secs(config.tentative_lease_secs as u64),
            leases: BTreeMap::new(),
        }
    }

    pub fn contains(&self, addr: &NetworkAddress) -> bool {
        v4_bits(addr).map_or(false, |bits| (self.start..=self.end).contains(&bits))
    }

    fn live(&self, bits: u32, now: Instant) -> Option<&Lease> {
        self.leases.get(&bits).filter(|lease| lease.expires > now)
    }

    fn live_for(&self, mac: MacAddr, now: Instant) -> Option<u32> {
        self.leases
            .iter()
            .find(|(_, lease)| lease.mac == mac && lease.expires > now)
            .map(|(bits, _)| *bits)
    }

    /// Pick an address for `mac`: its live lease if any, else the lowest free one.
    pub fn offer(&mut self, mac: MacAddr, now: Instant) -> Option<NetworkAddress> {
        if let Some(bits) = self.live_for(mac, now) {
            let tentative = self.tentative;
            let lease = self.leases.get_mut(&bits)?;
            if lease.state == LeaseState::Offered {
                lease.expires = now + tentative;
            }
            return Some(lease.address);
        }
        let bits = (self.start..=self.end).find(|bits| self.live(*bits, now).is_none())?;
        let address = NetworkAddress::V4(bits.to_be_bytes());
        self.leases.insert(
            bits,
            Lease {
                mac,
                address,
                state: LeaseState::Offered,
                expires: now + self.tentative,
            },
        );
        Some(address)
    }

    /// Confirm `addr` for `mac`. `None` means the request must be NAKed.
    pub fn request(&mut self, mac: MacAddr, addr: NetworkAddress, now: Instant) -> Option<&Lease> {
        if !self.contains(&addr) {
            return None;
        }
        let bits = v4_bits(&addr)?;
        if self.live(bits, now).map_or(false, |lease| lease.mac != mac) {
            return None;
        }
        self.leases.retain(|b, lease| *b == bits || lease.mac != mac);
        self.leases.insert(
            bits,
            Lease {
                mac,
                address: addr,
                state: LeaseState::Bound,
                expires: now + self.lease_time,
            },
        );
        self.leases.get(&bits)
    }

    /// Free `addr` if `mac` holds it.
    pub fn release(&mut self, mac: MacAddr, addr: &NetworkAddress) -> bool {
        match v4_bits(addr) {
            Some(bits) if self.leases.get(&bits).map_or(false, |l| l.mac == mac) => {
                self.leases.remove(&bits);
                true
            }
            _ => false,
        }
    }

    /// Unexpired leases in address order.
    pub fn leases(&self, now: Instant) -> Vec<Lease> {
        self.leases
            .values()
            .filter(|lease| lease.expires > now)
            .cloned()
            .collect()
    }
}

pub struct DhcpServer {
    host: Host,
    config: DhcpServerConfig,
    pool: LeasePool,
    socket: UdpSocketHandle,
}

impl DhcpServer {
    /// Validate the configuration and bind UDP port 67.
    pub fn bind(host: Host, config: DhcpServerConfig) -> Result<Self> {
        config.validate()?;
        let socket = host.open_udp_socket(NetworkAddress::UNSPECIFIED_V4, DHCP_SERVER_PORT)?;
        let pool = LeasePool::new(&config);
        Ok(DhcpServer {
            host,
            config,
            pool,
            socket,
        })
    }

    /// Closing this socket stops `serve`.
    pub fn socket(&self) -> UdpSocketHandle {
        self.socket
    }

    pub fn pool(&self) -> &LeasePool {
        &self.pool
    }

    /// Answer requests until the socket is closed.
    pub async fn serve(&mut self) -> Result<()> {
        info!(
            "dhcp server on {} serving {} - {}",
            self.host.name(),
            self.config.range_start,
            self.config.range_end
        );
        while let Some(datagram) = self.host.recv_udp_socket(self.socket).await? {
            let request = match DhcpMessage::decode(&datagram.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!("dhcp server: dropping datagram from {}: {}", datagram.src_addr, e);
                    continue;
                }
            };
            if let Some(reply) = self.handle(&request, Instant::now()) {
                self.host.send_udp_socket(
                    self.socket,
                    NetworkAddress::BROADCAST_V4,
                    DHCP_CLIENT_PORT,
                    &reply.encode(),
                )?;
            }
        }
        info!("dhcp server on {} stopped", self.host.name());
        Ok(())
    }

    /// Compute the reply to one request, if any.
    pub fn handle(&mut self, request: &DhcpMessage, now: Instant) -> Option<DhcpMessage> {
        if request.op != BOOTREQUEST {
            return None;
        }
        let mac = request.client_mac();
        let kind = request.message_type()?;
        debug!("dhcp server: {} from {} xid {:#010x}", kind, mac, request.xid);
        match kind {
            DhcpMessageType::Discover => {
                let Some(address) = self.pool.offer(mac, now) else {
                    warn!("dhcp server: pool exhausted, ignoring {}", mac);
                    return None;
                };
                let mut offer = self.reply(request, DhcpMessageType::Offer);
                offer.yiaddr = address.octets_v4()?;
                self.add_lease_options(&mut offer);
                Some(offer)
            }
            DhcpMessageType::Request => {
                if let Some(server) = request.server_id() {
                    if server != self.config.server_address {
                        debug!("dhcp server: {} chose server {}", mac, server);
                        return None;
                    }
                }
                let wanted = request
                    .requested_ip()
                    .or_else(|| (request.ciaddr != [0; 4]).then(|| NetworkAddress::V4(request.ciaddr)));
                let confirmed = wanted.and_then(|addr| self.pool.request(mac, addr, now).map(|l| l.address));
                match confirmed {
                    Some(address) => {
                        info!("dhcp server: {} bound to {}", address, mac);
                        let mut ack = self.reply(request, DhcpMessageType::Ack);
                        ack.yiaddr = address.octets_v4()?;
                        ack.ciaddr = request.ciaddr;
                        self.add_lease_options(&mut ack);
                        Some(ack)
                    }
                    None => {
                        info!("dhcp server: NAK {:?} for {}", wanted, mac);
                        Some(self.reply(request, DhcpMessageType::Nak))
                    }
                }
            }
            DhcpMessageType::Release => {
                let address = NetworkAddress::V4(request.ciaddr);
                if self.pool.release(mac, &address) {
                    info!("dhcp server: {} released {}", mac, address);
                }
                None
            }
            DhcpMessageType::Decline => {
                if let Some(address) = request.requested_ip() {
                    warn!("dhcp server: {} declined {}", mac, address);
                    self.pool.release(mac, &address);
                }
                None
            }
            DhcpMessageType::Inform => {
                let mut ack = self.reply(request, DhcpMessageType::Ack);
                ack.ciaddr = request.ciaddr;
                self.add_network_options(&mut ack);
                Some(ack)
            }
            DhcpMessageType::Offer | DhcpMessageType::Ack | DhcpMessageType::Nak => None,
        }
    }

    fn reply(&self, request: &DhcpMessage, kind: DhcpMessageType) -> DhcpMessage {
        let mut reply = DhcpMessage::reply_to(request, kind);
        if let Some(octets) = self.config.server_address.octets_v4() {
            reply.siaddr = octets;
        }
        // Addresses were checked by `validate`.
        if let Err(e) = reply.set_server_id(self.config.server_address) {
            debug!("dhcp server: server id option: {}", e);
        }
        reply
    }

    fn add_network_options(&self, reply: &mut DhcpMessage) {
        let mut result = reply.set_subnet_mask(self.config.subnet_mask);
        if let Some(router) = self.config.router {
            result = result.and(reply.set_router(router));
        }
        if !self.config.dns_servers.is_empty() {
            result = result.and(reply.set_dns_servers(&self.config.dns_servers));
        }
        if let Err(e) = result {
            debug!("dhcp server: network options: {}", e);
        }
    }

    fn add_lease_options(&self, reply: &mut DhcpMessage) {
        self.add_network_options(reply);
        let lease = self.config.lease_time_secs;
        reply.set_lease_time(lease);
        reply.set_renewal_time(lease / 2);
        reply.set_rebinding_time((lease as u64 * 7 / 8) as u32);
    }
}
