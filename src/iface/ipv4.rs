//! IPv4 input processing
//!
//! Packets arriving at a host are validated, then either dispatched to the
//! local ICMP/TCP/UDP handlers or, on forwarding hosts, routed onwards with
//! their TTL decremented.

use crate::iface::interface::IfIndex;
use crate::iface::ip::NetworkAddress;
use crate::iface::stack::{EchoEvent, Egress, HostState};
use crate::network::icmp::{
    IcmpHeader, IcmpUtils, ICMP_CODE_NET_UNREACHABLE, ICMP_CODE_PORT_UNREACHABLE, ICMP_TYPE_DEST_UNREACHABLE,
    ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST, ICMP_TYPE_TIME_EXCEEDED,
};
use crate::network::ipv4::{protocol, Ipv4Header, Ipv4Utils};
use crate::network::checksum;
use crate::transport::udp::{UdpUtils, UDP_HEADER_LEN};
use log::debug;

impl HostState {
    /// Entry point for a packet received on `ingress` (`None` for loopback).
    pub(crate) fn process_ipv4_packet(&mut self, ingress: Option<IfIndex>, packet: &[u8], out: &mut Vec<Egress>) {
        let ip_header = match Ipv4Header::from_bytes(packet) {
            Some(ip_header) => ip_header,
            None => return,
        };

        if let Err(e) = ip_header.validate(packet) {
            debug!("{}: dropped packet: {}", self.name, e);
            return;
        }
        let packet = &packet[..ip_header.total_len as usize];

        let dst = NetworkAddress::V4(ip_header.dst_addr);
        if !self.is_for_us(&dst, ingress) {
            self.forward(ingress, &ip_header, packet, out);
            return;
        }

        // Dispatch based on protocol
        match ip_header.protocol {
            protocol::ICMP => self.process_icmpv4(ingress, packet, &ip_header, out),
            protocol::TCP => self.process_tcp(packet, &ip_header, out),
            protocol::UDP => self.process_udp(ingress, packet, &ip_header, out),
            other => debug!("{}: unsupported protocol {}", self.name, other),
        }
    }

    /// Weak host model: any local address is accepted on any interface.
    fn is_for_us(&self, dst: &NetworkAddress, ingress: Option<IfIndex>) -> bool {
        let Some(index) = ingress else {
            return true;
        };
        let on_ingress = self
            .interfaces
            .get(index as usize)
            .map_or(false, |iface| iface.is_for_us(dst));
        on_ingress || self.interfaces.iter().any(|i| i.is_configured() && &i.address == dst)
    }

    fn forward(&mut self, ingress: Option<IfIndex>, ip_header: &Ipv4Header, packet: &[u8], out: &mut Vec<Egress>) {
        let Some(ingress) = ingress else {
            return;
        };
        let dst = NetworkAddress::V4(ip_header.dst_addr);
        if !self.forwarding {
            debug!("{}: not forwarding packet for {}", self.name, dst);
            return;
        }
        if dst.is_unspecified() || dst.is_limited_broadcast() || self.interfaces.iter().any(|i| i.is_broadcast_address(&dst)) {
            return;
        }
        if ip_header.ttl <= 1 {
            debug!("{}: TTL expired for {} -> {}", self.name, NetworkAddress::V4(ip_header.src_addr), dst);
            self.send_icmp_error(ingress, packet, ICMP_TYPE_TIME_EXCEEDED, 0, out);
            return;
        }
        let path = self.output_paths(&dst, None, None).ok().and_then(|p| p.into_iter().next());
        match path {
            Some(path) => {
                let mut forwarded = packet.to_vec();
                Ipv4Utils::decrement_ttl(&mut forwarded);
                debug!("{}: forward {} via {} dev {}", self.name, dst, path.next_hop, path.device);
                out.push(Egress {
                    device: path.device,
                    next_hop: path.next_hop,
                    packet: forwarded,
                });
            }
            None => {
                debug!("{}: no route to {}", self.name, dst);
                self.send_icmp_error(ingress, packet, ICMP_TYPE_DEST_UNREACHABLE, ICMP_CODE_NET_UNREACHABLE, out);
            }
        }
    }

    /// Report a problem with `original` back to its sender.
    fn send_icmp_error(&mut self, ingress: IfIndex, original: &[u8], msg_type: u8, msg_code: u8, out: &mut Vec<Egress>) {
        let Some(ip_header) = Ipv4Header::from_bytes(original) else {
            return;
        };
        let origin = NetworkAddress::V4(ip_header.src_addr);
        if origin.is_unspecified() || origin.is_limited_broadcast() {
            return;
        }
        // Never answer an ICMP error with another one.
        if ip_header.protocol == protocol::ICMP {
            let inner_type = original.get(ip_header.header_len()).copied();
            if !matches!(inner_type, Some(ICMP_TYPE_ECHO_REQUEST) | Some(ICMP_TYPE_ECHO_REPLY)) {
                return;
            }
        }
        let source = self
            .interfaces
            .get(ingress as usize)
            .filter(|i| i.is_configured())
            .or_else(|| self.interfaces.iter().find(|i| i.is_configured()))
            .map(|i| i.address);
        let Some(source) = source else {
            return;
        };
        let message = IcmpUtils::create_error(msg_type, msg_code, original);
        if let Err(e) = self.send_ipv4(&origin, Some(source), protocol::ICMP, &message, out) {
            debug!("{}: cannot report ICMP {} to {}: {}", self.name, msg_type, origin, e);
        }
    }

    fn process_icmpv4(&mut self, ingress: Option<IfIndex>, packet: &[u8], ip_header: &Ipv4Header, out: &mut Vec<Egress>) {
        let ip_payload = &packet[ip_header.header_len()..];
        let icmp_header = match IcmpHeader::from_bytes(ip_payload) {
            Some(header) => header,
            None => return,
        };
        if checksum(ip_payload) != 0 {
            debug!("{}: ICMP checksum mismatch", self.name);
            return;
        }
        let src = NetworkAddress::V4(ip_header.src_addr);
        match icmp_header.msg_type {
            ICMP_TYPE_ECHO_REQUEST => {
                let dst = NetworkAddress::V4(ip_header.dst_addr);
                let reply_src = if self.is_local_address(&dst) {
                    Some(dst)
                } else {
                    ingress
                        .and_then(|i| self.interfaces.get(i as usize))
                        .filter(|i| i.is_configured())
                        .map(|i| i.address)
                };
                if src.is_unspecified() || reply_src.is_none() {
                    return;
                }
                let reply = IcmpUtils::create_icmpv4_reply(ip_payload);
                if let Err(e) = self.send_ipv4(&src, reply_src, protocol::ICMP, &reply, out) {
                    debug!("{}: echo reply to {} failed: {}", self.name, src, e);
                }
            }
            ICMP_TYPE_ECHO_REPLY => {
                let key = (icmp_header.identifier(), icmp_header.sequence());
                self.complete_echo(
                    key,
                    EchoEvent::Reply {
                        from: src,
                        ttl: ip_header.ttl,
                        bytes: ip_payload.len(),
                    },
                );
            }
            ICMP_TYPE_TIME_EXCEEDED | ICMP_TYPE_DEST_UNREACHABLE => {
                let Some(quoted) = IcmpUtils::quoted_echo(ip_payload) else {
                    match IcmpUtils::quoted_transport(ip_payload) {
                        Some(flow) if flow.protocol == protocol::TCP => self.tcp_icmp_error(&flow, icmp_header.msg_type),
                        _ => debug!("{}: ICMP type {} from {} quotes no flow of ours", self.name, icmp_header.msg_type, src),
                    }
                    return;
                };
                let key = (quoted.identifier, quoted.sequence);
                let event = if icmp_header.msg_type == ICMP_TYPE_TIME_EXCEEDED {
                    EchoEvent::TimeExceeded {
                        from: src,
                        ttl: ip_header.ttl,
                        bytes: ip_payload.len(),
                    }
                } else {
                    EchoEvent::Unreachable { from: src }
                };
                self.complete_echo(key, event);
            }
            other => debug!("{}: unsupported ICMP type {}", self.name, other),
        }
    }

    fn process_tcp(&mut self, packet: &[u8], ip_header: &Ipv4Header, out: &mut Vec<Egress>) {
        let ip_payload = &packet[ip_header.header_len()..];
        let src = NetworkAddress::V4(ip_header.src_addr);
        let dst = NetworkAddress::V4(ip_header.dst_addr);
        if dst.is_limited_broadcast() {
            return;
        }
        self.tcp_input(src, dst, ip_payload, out);
    }

    fn process_udp(&mut self, ingress: Option<IfIndex>, packet: &[u8], ip_header: &Ipv4Header, out: &mut Vec<Egress>) {
        let ip_payload = &packet[ip_header.header_len()..];

        // Validate UDP packet
        let udp_header = match UdpUtils::validate_udp_packet(ip_header.src_addr, ip_header.dst_addr, ip_payload) {
            Ok(header) => header,
            Err(e) => {
                debug!("{}: invalid UDP packet: {}", self.name, e);
                return;
            }
        };

        let src = NetworkAddress::V4(ip_header.src_addr);
        let dst = NetworkAddress::V4(ip_header.dst_addr);
        let delivered = self.udp_input(
            ingress,
            src,
            dst,
            udp_header.src_port,
            udp_header.dst_port,
            &ip_payload[UDP_HEADER_LEN..],
        );
        if delivered {
            return;
        }
        debug!("{}: no socket bound to port {}", self.name, udp_header.dst_port);
        let broadcast = dst.is_limited_broadcast() || self.interfaces.iter().any(|i| i.is_broadcast_address(&dst));
        if !broadcast {
            match ingress {
                Some(index) => self.send_icmp_error(index, packet, ICMP_TYPE_DEST_UNREACHABLE, ICMP_CODE_PORT_UNREACHABLE, out),
                None => {
                    let message = IcmpUtils::create_error(ICMP_TYPE_DEST_UNREACHABLE, ICMP_CODE_PORT_UNREACHABLE, packet);
                    if let Err(e) = self.send_ipv4(&src, Some(dst), protocol::ICMP, &message, out) {
                        debug!("{}: port unreachable to {} not sent: {}", self.name, src, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::iface::interface::{Interface, InterfaceConfig};
    use crate::iface::ip::AddressFamily;
    use crate::iface::route::RouteDevice;
    use crate::iface::stack::HostId;
    use crate::iface::virtual_network::SegmentId;
    use crate::network::ethernet::MacAddr;

    fn router() -> HostState {
        let mut host = HostState::new(HostId(0), "r1", StackConfig::default());
        for (index, addr) in [(0u32, [10, 0, 1, 1]), (1, [10, 0, 2, 1])] {
            host.interfaces.push(Interface::new(
                index,
                &format!("eth{}", index),
                MacAddr::local(0, index as u16),
                AddressFamily::V4,
                SegmentId(index),
            ));
            host.configure_interface(index, InterfaceConfig::new(NetworkAddress::V4(addr), 24))
                .unwrap();
        }
        host.forwarding = true;
        host
    }

    fn packet(src: [u8; 4], dst: [u8; 4], ttl: u8) -> Vec<u8> {
        let payload = IcmpUtils::create_echo_request(1, 1, b"probe");
        let mut header = Ipv4Header::new_simple(protocol::ICMP, src, dst, payload.len() as u16);
        header.ttl = ttl;
        Ipv4Utils::create_packet_with_payload(&header, &payload)
    }

    #[test]
    fn test_forward_decrements_ttl() {
        let mut host = router();
        let mut out = Vec::new();
        host.process_ipv4_packet(Some(0), &packet([10, 0, 1, 9], [10, 0, 2, 9], 5), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].device, RouteDevice::Interface(1));
        let forwarded = Ipv4Header::from_bytes(&out[0].packet).unwrap();
        assert_eq!(forwarded.ttl, 4);
        assert!(forwarded.validate(&out[0].packet).is_ok());
    }

    #[test]
    fn test_ttl_expiry_reports_from_ingress_address() {
        let mut host = router();
        let mut out = Vec::new();
        host.process_ipv4_packet(Some(0), &packet([10, 0, 1, 9], [10, 0, 2, 9], 1), &mut out);
        assert_eq!(out.len(), 1);
        let reply = Ipv4Header::from_bytes(&out[0].packet).unwrap();
        assert_eq!(reply.src_addr, [10, 0, 1, 1]);
        assert_eq!(reply.dst_addr, [10, 0, 1, 9]);
        assert_eq!(out[0].packet[reply.header_len()], ICMP_TYPE_TIME_EXCEEDED);
    }

    #[test]
    fn test_unroutable_reports_unreachable() {
        let mut host = router();
        let mut out = Vec::new();
        host.process_ipv4_packet(Some(0), &packet([10, 0, 1, 9], [172, 16, 0, 1], 9), &mut out);
        let reply = Ipv4Header::from_bytes(&out[0].packet).unwrap();
        assert_eq!(out[0].packet[reply.header_len()], ICMP_TYPE_DEST_UNREACHABLE);
    }

    #[test]
    fn test_non_router_drops_transit_traffic() {
        let mut host = router();
        host.forwarding = false;
        let mut out = Vec::new();
        host.process_ipv4_packet(Some(0), &packet([10, 0, 1, 9], [10, 0, 2, 9], 5), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_echo_request_answered() {
        let mut host = router();
        let mut out = Vec::new();
        host.process_ipv4_packet(Some(0), &packet([10, 0, 1, 9], [10, 0, 1, 1], 64), &mut out);
        assert_eq!(out.len(), 1);
        let reply = Ipv4Header::from_bytes(&out[0].packet).unwrap();
        assert_eq!(reply.src_addr, [10, 0, 1, 1]);
        assert_eq!(out[0].packet[reply.header_len()], ICMP_TYPE_ECHO_REPLY);
    }

    #[test]
    fn test_corrupt_packet_dropped() {
        let mut host = router();
        let mut bad = packet([10, 0, 1, 9], [10, 0, 1, 1], 64);
        bad[10] ^= 0xFF;
        let mut out = Vec::new();
        host.process_ipv4_packet(Some(0), &bad, &mut out);
        assert!(out.is_empty());
    }
}
