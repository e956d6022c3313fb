//! UDP endpoints
//!
//! Datagrams are fire-and-forget: a send that finds no route is logged and
//! dropped. Each socket keeps a bounded FIFO of received datagrams and one
//! receive waiter.

use crate::error::{NetError, Result};
use crate::iface::interface::IfIndex;
use crate::iface::ip::NetworkAddress;
use crate::iface::stack::{Egress, HostState};
use crate::network::ipv4::{protocol, IPV4_HEADER_LEN};
use crate::socket::waiter::Waiter;
use crate::socket::{Datagram, Endpoint, Pending, SocketId};
use crate::transport::udp::{UdpUtils, UDP_HEADER_LEN};
use log::{debug, info};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Largest payload that fits a single IPv4 datagram.
pub const MAX_UDP_PAYLOAD: usize = 65535 - IPV4_HEADER_LEN - UDP_HEADER_LEN;

#[derive(Debug)]
pub(crate) struct UdpSocket {
    pub local: Endpoint,
    pub device: Option<IfIndex>,
    queue: VecDeque<Datagram>,
    waiter: Waiter<Option<Datagram>>,
    dropped: u64,
}

impl UdpSocket {
    fn new(local: Endpoint) -> Self {
        UdpSocket {
            local,
            device: None,
            queue: VecDeque::new(),
            waiter: Waiter::new(),
            dropped: 0,
        }
    }

    fn accepts(&self, dst: &NetworkAddress, port: u16, ingress: Option<IfIndex>) -> bool {
        let device_ok = match (self.device, ingress) {
            (Some(pinned), Some(ingress)) => pinned == ingress,
            (Some(_), None) => false,
            (None, _) => true,
        };
        device_ok && (self.local.accepts(dst, port) || (dst.is_limited_broadcast() && self.local.port == port))
    }

    /// Hand a datagram to the waiting receiver, or queue it.
    fn deliver(&mut self, datagram: Datagram, limit: usize) {
        let datagram = if self.queue.is_empty() {
            match self.waiter.wake(Some(datagram)) {
                Ok(()) => return,
                Err(Some(datagram)) => datagram,
                Err(None) => return,
            }
        } else {
            datagram
        };
        if self.queue.len() >= limit {
            self.dropped += 1;
            debug!("udp: {} queue full, dropped datagram from {}:{}", self.local, datagram.src_addr, datagram.src_port);
            return;
        }
        self.queue.push_back(datagram);
    }

    fn info(&self, id: SocketId) -> UdpSocketInfo {
        UdpSocketInfo {
            id,
            local: self.local,
            device: self.device,
            queued: self.queue.len(),
            dropped: self.dropped,
        }
    }
}

/// Snapshot of a UDP socket for `ss -u`-style listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpSocketInfo {
    pub id: SocketId,
    pub local: Endpoint,
    pub device: Option<IfIndex>,
    pub queued: usize,
    pub dropped: u64,
}

impl fmt::Display for UdpSocketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UNCONN {:>6} {:>6} {}", self.queued, 0, self.local)?;
        if let Some(device) = self.device {
            write!(f, "%if{}", device)?;
        }
        f.write_str(" *:*")
    }
}

impl HostState {
    pub(crate) fn udp_open(&mut self, addr: NetworkAddress, port: u16) -> Result<SocketId> {
        self.check_bind_address(&addr)?;
        let port = if port == 0 {
            let taken: HashSet<u16> = self
                .sockets
                .udp
                .values()
                .filter(|s| s.local.overlaps(&Endpoint::new(addr, s.local.port)))
                .map(|s| s.local.port)
                .collect();
            self.sockets.ephemeral_port(&self.config, |p| taken.contains(&p))?
        } else {
            if self.sockets.udp_in_use(&Endpoint::new(addr, port)) {
                return Err(NetError::AddressInUse);
            }
            port
        };
        let local = Endpoint::new(addr, port);
        let id = self.sockets.alloc_id();
        self.sockets.udp.insert(id, UdpSocket::new(local));
        info!("{}: udp socket {} bound to {}", self.name, id, local);
        Ok(id)
    }

    pub(crate) fn udp_bind_device(&mut self, id: SocketId, index: IfIndex) -> Result<()> {
        self.interface(index)?;
        let missing = self.sockets.missing(id);
        let socket = self.sockets.udp.get_mut(&id).ok_or(missing)?;
        socket.device = Some(index);
        debug!("{}: udp socket {} pinned to if{}", self.name, id, index);
        Ok(())
    }

    pub(crate) fn udp_send(
        &mut self,
        id: SocketId,
        dst: NetworkAddress,
        dst_port: u16,
        payload: &[u8],
        out: &mut Vec<Egress>,
    ) -> Result<()> {
        let missing = self.sockets.missing(id);
        let socket = self.sockets.udp.get(&id).ok_or(missing)?;
        let (local, device) = (socket.local, socket.device);
        let dst4 = dst.require_v4()?;
        if dst_port == 0 {
            return Err(NetError::InvalidArgument("destination port 0"));
        }
        if payload.len() > MAX_UDP_PAYLOAD {
            return Err(NetError::InvalidArgument("datagram too large"));
        }
        let paths = match self.output_paths(&dst, Some(local.addr), device) {
            Ok(paths) => paths,
            Err(NetError::NoRoute) => {
                debug!("{}: udp {} -> {}:{} no route, dropped", self.name, local, dst, dst_port);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let ttl = self.config.default_ttl;
        for path in paths {
            let datagram = UdpUtils::create_udp_packet_with_checksum(path.src, dst4, local.port, dst_port, payload);
            self.emit_ipv4(&path, dst4, protocol::UDP, ttl, &datagram, out);
        }
        Ok(())
    }

    pub(crate) fn udp_recv(&mut self, id: SocketId) -> Result<Pending<Option<Datagram>>> {
        let Some(socket) = self.sockets.udp.get_mut(&id) else {
            return if self.sockets.was_issued(id) {
                Ok(Pending::Ready(None))
            } else {
                Err(self.sockets.missing(id))
            };
        };
        match socket.queue.pop_front() {
            Some(datagram) => Ok(Pending::Ready(Some(datagram))),
            None => Ok(Pending::Wait(socket.waiter.arm()?)),
        }
    }

    /// Return a datagram whose receiver gave up to the head of the queue.
    pub(crate) fn udp_requeue(&mut self, id: SocketId, datagram: Datagram) {
        match self.sockets.udp.get_mut(&id) {
            Some(socket) => socket.queue.push_front(datagram),
            None => debug!("{}: udp socket {} closed, datagram discarded", self.name, id),
        }
    }

    pub(crate) fn udp_close(&mut self, id: SocketId) -> Result<()> {
        let mut socket = self.sockets.udp.remove(&id).ok_or_else(|| self.sockets.missing(id))?;
        if socket.waiter.wake(None).is_ok() {
            debug!("{}: udp socket {} closed with a receiver waiting", self.name, id);
        }
        info!("{}: udp socket {} on {} closed", self.name, id, socket.local);
        Ok(())
    }

    pub(crate) fn udp_sockets(&self) -> Vec<UdpSocketInfo> {
        self.sockets.udp.iter().map(|(id, s)| s.info(*id)).collect()
    }

    /// Demultiplex an inbound datagram. Returns `false` if no socket wants it.
    pub(crate) fn udp_input(
        &mut self,
        ingress: Option<IfIndex>,
        src: NetworkAddress,
        dst: NetworkAddress,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> bool {
        // Exact address binds win over wildcard binds.
        let target = self
            .sockets
            .udp
            .iter()
            .filter(|(_, s)| s.accepts(&dst, dst_port, ingress))
            .max_by_key(|(id, s)| (!s.local.addr.is_unspecified(), s.device.is_some(), std::cmp::Reverse(**id)))
            .map(|(id, _)| *id);
        let Some(id) = target else {
            return false;
        };
        let limit = self.config.udp_queue_limit;
        if let Some(socket) = self.sockets.udp.get_mut(&id) {
            socket.deliver(
                Datagram {
                    src_addr: src,
                    src_port,
                    payload: payload.to_vec(),
                },
                limit,
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(payload: &[u8]) -> Datagram {
        Datagram {
            src_addr: NetworkAddress::v4(10, 0, 0, 1),
            src_port: 1234,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_queue_is_fifo_and_bounded() {
        let mut socket = UdpSocket::new(Endpoint::new(NetworkAddress::UNSPECIFIED_V4, 7));
        socket.deliver(datagram(b"A"), 2);
        socket.deliver(datagram(b"B"), 2);
        socket.deliver(datagram(b"C"), 2);
        assert_eq!(socket.queue.pop_front().unwrap().payload, b"A");
        assert_eq!(socket.queue.pop_front().unwrap().payload, b"B");
        assert!(socket.queue.is_empty());
        assert_eq!(socket.dropped, 1);
    }

    #[tokio::test]
    async fn test_waiting_receiver_gets_datagram_directly() {
        let mut socket = UdpSocket::new(Endpoint::new(NetworkAddress::UNSPECIFIED_V4, 7));
        let rx = socket.waiter.arm().unwrap();
        socket.deliver(datagram(b"hi"), 4);
        assert!(socket.queue.is_empty());
        assert_eq!(rx.await.unwrap().unwrap().payload, b"hi");
    }

    #[test]
    fn test_abandoned_receiver_requeues() {
        let mut socket = UdpSocket::new(Endpoint::new(NetworkAddress::UNSPECIFIED_V4, 7));
        drop(socket.waiter.arm().unwrap());
        socket.deliver(datagram(b"late"), 4);
        assert_eq!(socket.queue.len(), 1);
    }

    #[test]
    fn test_device_pinning_and_broadcast() {
        let mut socket = UdpSocket::new(Endpoint::new(NetworkAddress::v4(10, 0, 0, 1), 68));
        assert!(socket.accepts(&NetworkAddress::BROADCAST_V4, 68, Some(0)));
        assert!(!socket.accepts(&NetworkAddress::v4(10, 0, 0, 2), 68, Some(0)));
        socket.device = Some(1);
        assert!(!socket.accepts(&NetworkAddress::BROADCAST_V4, 68, Some(0)));
        assert!(socket.accepts(&NetworkAddress::BROADCAST_V4, 68, Some(1)));
        assert!(!socket.accepts(&NetworkAddress::v4(10, 0, 0, 1), 68, None));
    }

    #[test]
    fn test_info_display() {
        let socket = UdpSocket::new(Endpoint::new(NetworkAddress::UNSPECIFIED_V4, 53));
        assert_eq!(socket.info(SocketId(3)).to_string(), "UNCONN      0      0 *:53 *:*");
    }
}
