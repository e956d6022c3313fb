//! ARP packets (RFC 826) for IPv4 over Ethernet.
//!
//! The simulated wire resolves neighbours without a round trip, but still
//! records the request/reply pair so captures look like a real exchange.

use crate::network::ethernet::MacAddr;
use byteorder::{BigEndian, ByteOrder};

pub const ARP_PACKET_LEN: usize = 28;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: [u8; 4],
    pub target_mac: MacAddr,
    pub target_ip: [u8; 4],
}

impl ArpPacket {
    pub fn request(sender_mac: MacAddr, sender_ip: [u8; 4], target_ip: [u8; 4]) -> Self {
        ArpPacket {
            operation: ARP_OP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    /// The reply a host owning `target_ip` sends back for this request.
    pub fn reply(&self, owner_mac: MacAddr) -> Self {
        ArpPacket {
            operation: ARP_OP_REPLY,
            sender_mac: owner_mac,
            sender_ip: self.target_ip,
            target_mac: self.sender_mac,
            target_ip: self.sender_ip,
        }
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_LEN] {
        let mut bytes = [0u8; ARP_PACKET_LEN];
        BigEndian::write_u16(&mut bytes[0..2], 1); // htype: Ethernet
        BigEndian::write_u16(&mut bytes[2..4], 0x0800); // ptype: IPv4
        bytes[4] = 6;
        bytes[5] = 4;
        BigEndian::write_u16(&mut bytes[6..8], self.operation);
        bytes[8..14].copy_from_slice(&self.sender_mac.0);
        bytes[14..18].copy_from_slice(&self.sender_ip);
        bytes[18..24].copy_from_slice(&self.target_mac.0);
        bytes[24..28].copy_from_slice(&self.target_ip);
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_PACKET_LEN || data[4] != 6 || data[5] != 4 {
            return None;
        }
        let mut sender_mac = [0u8; 6];
        let mut target_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        target_mac.copy_from_slice(&data[18..24]);
        Some(ArpPacket {
            operation: BigEndian::read_u16(&data[6..8]),
            sender_mac: MacAddr(sender_mac),
            sender_ip: [data[14], data[15], data[16], data[17]],
            target_mac: MacAddr(target_mac),
            target_ip: [data[24], data[25], data[26], data[27]],
        })
    }
}
