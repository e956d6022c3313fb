//! DHCP client: DISCOVER / OFFER / REQUEST / ACK on one interface.

use crate::error::{NetError, Result};
use crate::iface::host::Host;
use crate::iface::interface::{IfIndex, InterfaceConfig};
use crate::iface::ip::{mask_to_prefix, NetworkAddress};
use crate::iface::route::RouteDevice;
use crate::network::ethernet::MacAddr;
use crate::pdu::dhcp::{option, DhcpMessage, DhcpMessageType, BOOTREPLY, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use crate::pdu::Pdu;
use crate::socket::UdpSocketHandle;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::Instant;

pub const DHCP_ATTEMPTS: usize = 3;
pub const DHCP_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PREFIX_LEN: u8 = 24;

/// What the server granted, already applied to the interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub address: NetworkAddress,
    pub prefix_len: u8,
    pub router: Option<NetworkAddress>,
    pub dns_servers: Vec<NetworkAddress>,
    pub server: Option<NetworkAddress>,
    pub lease_time: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct DhcpClient {
    host: Host,
    attempts: usize,
    reply_timeout: Duration,
    hostname: Option<String>,
}

impl DhcpClient {
    pub fn new(host: Host) -> Self {
        DhcpClient {
            host,
            attempts: DHCP_ATTEMPTS,
            reply_timeout: DHCP_REPLY_TIMEOUT,
            hostname: None,
        }
    }

    /// Bound on each wait for an OFFER or an ACK.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn hostname(mut self, name: &str) -> Self {
        self.hostname = Some(name.to_string());
        self
    }

    /// Obtain a lease for `index`, configure the interface and install the
    /// default route. The client socket is closed whatever the outcome.
    pub async fn acquire(&self, index: IfIndex) -> Result<DhcpLease> {
        let mac = self.host.interface(index)?.mac;
        let socket = self.host.open_udp_socket(NetworkAddress::UNSPECIFIED_V4, DHCP_CLIENT_PORT)?;
        let result = self.run(socket, index, mac).await;
        if let Err(e) = self.host.close_udp_socket(socket) {
            debug!("dhcp client: closing socket: {}", e);
        }
        let lease = result?;

        self.host
            .configure_interface(index, InterfaceConfig::new(lease.address, lease.prefix_len))?;
        if let Some(router) = lease.router {
            self.host
                .add_route(NetworkAddress::UNSPECIFIED_V4, 0, RouteDevice::Interface(index), Some(router))?;
        }
        info!(
            "dhcp client: {} if{} bound to {}/{}",
            self.host.name(),
            index,
            lease.address,
            lease.prefix_len
        );
        Ok(lease)
    }

    async fn run(&self, socket: UdpSocketHandle, index: IfIndex, mac: MacAddr) -> Result<DhcpLease> {
        self.host.bind_udp_device(socket, index)?;
        for attempt in 1..=self.attempts {
            let xid = transaction_id(mac, attempt);
            match self.transaction(socket, mac, xid).await {
                Ok(Some(lease)) => return Ok(lease),
                Ok(None) => info!("dhcp client: NAK on attempt {}, restarting", attempt),
                Err(NetError::Timeout) => debug!("dhcp client: attempt {} timed out", attempt),
                Err(e) => return Err(e),
            }
        }
        warn!("dhcp client: no lease after {} attempts", self.attempts);
        Err(NetError::Timeout)
    }

    /// One DISCOVER/REQUEST cycle. `None` means the server refused.
    async fn transaction(&self, socket: UdpSocketHandle, mac: MacAddr, xid: u32) -> Result<Option<DhcpLease>> {
        let mut discover = DhcpMessage::request(xid, mac, DhcpMessageType::Discover);
        self.add_client_options(&mut discover)?;
        self.broadcast(socket, &discover)?;
        let offer = self.wait_for(socket, mac, xid, &[DhcpMessageType::Offer]).await?;
        let offered = NetworkAddress::V4(offer.yiaddr);
        debug!("dhcp client: offered {} by {:?}", offered, offer.server_id());

        let mut request = DhcpMessage::request(xid, mac, DhcpMessageType::Request);
        self.add_client_options(&mut request)?;
        request.set_requested_ip(offered)?;
        if let Some(server) = offer.server_id() {
            request.set_server_id(server)?;
        }
        self.broadcast(socket, &request)?;

        let reply = self
            .wait_for(socket, mac, xid, &[DhcpMessageType::Ack, DhcpMessageType::Nak])
            .await?;
        if reply.message_type() == Some(DhcpMessageType::Nak) {
            return Ok(None);
        }
        Ok(Some(lease_from_ack(&reply)))
    }

    fn add_client_options(&self, msg: &mut DhcpMessage) -> Result<()> {
        msg.set_parameter_request_list(&[
            option::SUBNET_MASK,
            option::ROUTER,
            option::DNS_SERVERS,
            option::LEASE_TIME,
            option::SERVER_ID,
        ])?;
        if let Some(name) = &self.hostname {
            msg.set_hostname(name)?;
        }
        Ok(())
    }

    fn broadcast(&self, socket: UdpSocketHandle, msg: &DhcpMessage) -> Result<()> {
        self.host
            .send_udp_socket(socket, NetworkAddress::BROADCAST_V4, DHCP_SERVER_PORT, &msg.encode())
    }

    /// Wait for a reply to `xid` of one of `kinds`, skipping anything else.
    async fn wait_for(
        &self,
        socket: UdpSocketHandle,
        mac: MacAddr,
        xid: u32,
        kinds: &[DhcpMessageType],
    ) -> Result<DhcpMessage> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NetError::Timeout);
            }
            let datagram = self
                .host
                .recv_udp_socket_timeout(socket, remaining)
                .await?
                .ok_or(NetError::UseOfClosedSocket)?;
            let msg = match DhcpMessage::decode(&datagram.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("dhcp client: dropping reply from {}: {}", datagram.src_addr, e);
                    continue;
                }
            };
            let wanted = msg.op == BOOTREPLY
                && msg.xid == xid
                && msg.client_mac() == mac
                && msg.message_type().map_or(false, |kind| kinds.contains(&kind));
            if wanted {
                return Ok(msg);
            }
        }
    }
}

fn transaction_id(mac: MacAddr, attempt: usize) -> u32 {
    let low = u32::from_be_bytes([mac.0[2], mac.0[3], mac.0[4], mac.0[5]]);
    low.wrapping_mul(0x9E37_79B1).wrapping_add(attempt as u32)
}

fn lease_from_ack(ack: &DhcpMessage) -> DhcpLease {
    let prefix_len = ack
        .subnet_mask()
        .and_then(|mask| mask_to_prefix(&mask).ok())
        .unwrap_or(DEFAULT_PREFIX_LEN);
    DhcpLease {
        address: NetworkAddress::V4(ack.yiaddr),
        prefix_len,
        router: ack.router(),
        dns_servers: ack.dns_servers(),
        server: ack.server_id(),
        lease_time: ack.lease_time().map(|secs| Duration::from_secs(secs as u64)),
    }
}
