//! IPv4 header codec
//!
//! Every packet on a simulated segment is a single unfragmented IPv4
//! datagram. Headers never carry options, so IHL is always 5 on output;
//! longer headers are still accepted on input.

use crate::error::{NetError, Result};
use crate::network::checksum;
use byteorder::{BigEndian, ByteOrder};

pub const IPV4_HEADER_LEN: usize = 20;
const IPV4_VERSION: u8 = 4;
const DEFAULT_IHL: u8 = 5; // 5 * 4 = 20 bytes (standard header length)
pub const DEFAULT_TTL: u8 = 64;

/// IPv4 packet header structure
///
/// Represents the standard 20-byte IPv4 header as defined in RFC 791
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8, // Internet Header Length
    pub tos: u8, // Type of Service
    pub total_len: u16,
    pub id: u16,
    pub flags_frag_offset: u16, // Flags and Fragment Offset
    pub ttl: u8,                // Time to Live
    pub protocol: u8,           // Next Protocol
    pub checksum: u16,
    pub src_addr: [u8; 4], // Source IP Address
    pub dst_addr: [u8; 4], // Destination IP Address
}

impl Ipv4Header {
    /// Create a new IPv4 header with specified parameters
    ///
    /// The header length (IHL) is set to 5 (20 bytes) for standard headers.
    /// The checksum is filled in when the packet is assembled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tos: u8,
        total_len: u16,
        id: u16,
        flags_frag_offset: u16,
        ttl: u8,
        protocol: u8,
        src_addr: [u8; 4],
        dst_addr: [u8; 4],
    ) -> Self {
        Ipv4Header {
            version: IPV4_VERSION,
            ihl: DEFAULT_IHL,
            tos,
            total_len,
            id,
            flags_frag_offset,
            ttl,
            protocol,
            checksum: 0,
            src_addr,
            dst_addr,
        }
    }

    /// Create a new IPv4 header with default values
    pub fn new_simple(protocol: u8, src_addr: [u8; 4], dst_addr: [u8; 4], payload_len: u16) -> Self {
        Self::new(
            0,                                    // TOS: Normal service
            IPV4_HEADER_LEN as u16 + payload_len, // Total length
            0,                                    // ID
            flags::DONT_FRAGMENT,                 // The simulation never fragments
            DEFAULT_TTL,
            protocol,
            src_addr,
            dst_addr,
        )
    }

    /// Parse IPv4 header from byte slice
    ///
    /// Returns None if the data is too short or if the version field is not 4
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < IPV4_HEADER_LEN {
            return None;
        }

        let version = (data[0] & 0xF0) >> 4;
        if version != IPV4_VERSION {
            return None;
        }

        Some(Ipv4Header {
            version,
            ihl: data[0] & 0x0F,
            tos: data[1],
            total_len: BigEndian::read_u16(&data[2..4]),
            id: BigEndian::read_u16(&data[4..6]),
            flags_frag_offset: BigEndian::read_u16(&data[6..8]),
            ttl: data[8],
            protocol: data[9],
            checksum: BigEndian::read_u16(&data[10..12]),
            src_addr: [data[12], data[13], data[14], data[15]],
            dst_addr: [data[16], data[17], data[18], data[19]],
        })
    }

    /// Update checksum after modifying header fields
    pub fn update_checksum(&mut self) {
        self.checksum = Ipv4Utils::calculate_checksum(self);
    }

    /// Convert IPv4 header to bytes
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut bytes = [0u8; IPV4_HEADER_LEN];
        bytes[0] = (self.version << 4) | self.ihl;
        bytes[1] = self.tos;
        BigEndian::write_u16(&mut bytes[2..4], self.total_len);
        BigEndian::write_u16(&mut bytes[4..6], self.id);
        BigEndian::write_u16(&mut bytes[6..8], self.flags_frag_offset);
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        BigEndian::write_u16(&mut bytes[10..12], self.checksum);
        bytes[12..16].copy_from_slice(&self.src_addr);
        bytes[16..20].copy_from_slice(&self.dst_addr);

        bytes
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }

    /// Get payload length
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len())
    }

    /// True when this datagram is one piece of a larger one.
    pub fn is_fragment(&self) -> bool {
        self.flags_frag_offset & (flags::MORE_FRAGMENTS | flags::FRAGMENT_OFFSET_MASK) != 0
    }

    /// Validate the header against the packet it was parsed from
    pub fn validate(&self, packet: &[u8]) -> Result<()> {
        if self.version != IPV4_VERSION {
            return Err(NetError::MalformedPdu("IPv4 version"));
        }
        if self.ihl < DEFAULT_IHL || self.header_len() > packet.len() {
            return Err(NetError::MalformedPdu("IPv4 header length"));
        }
        if (self.total_len as usize) < self.header_len() || self.total_len as usize > packet.len() {
            return Err(NetError::MalformedPdu("IPv4 total length"));
        }
        if self.ttl == 0 {
            return Err(NetError::MalformedPdu("IPv4 TTL is zero"));
        }
        if checksum(&packet[..self.header_len()]) != 0 {
            return Err(NetError::MalformedPdu("IPv4 header checksum"));
        }
        if self.is_fragment() {
            return Err(NetError::MalformedPdu("IPv4 fragments are not reassembled"));
        }
        Ok(())
    }
}

/// IPv4 protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 flags constants
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}

pub struct Ipv4Utils {}

impl Ipv4Utils {
    /// Calculate IPv4 header checksum
    ///
    /// The checksum field is treated as zero during calculation.
    pub fn calculate_checksum(header: &Ipv4Header) -> u16 {
        let mut header = header.clone();
        header.checksum = 0;
        checksum(&header.to_bytes())
    }

    /// Create a complete IPv4 packet with payload
    ///
    /// The total length and checksum fields are filled in from the payload.
    pub fn create_packet_with_payload(header: &Ipv4Header, payload: &[u8]) -> Vec<u8> {
        let mut header = header.clone();
        header.total_len = (IPV4_HEADER_LEN + payload.len()) as u16;
        header.update_checksum();
        let mut packet = Vec::with_capacity(header.total_len as usize);
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Decrement the TTL of a raw packet in place and patch its checksum.
    ///
    /// Returns the new TTL.
    pub fn decrement_ttl(packet: &mut [u8]) -> u8 {
        let ttl = packet[8].saturating_sub(1);
        packet[8] = ttl;
        packet[10..12].copy_from_slice(&[0, 0]);
        let header_len = ((packet[0] & 0x0F) as usize * 4).min(packet.len());
        let sum = checksum(&packet[..header_len]);
        packet[10..12].copy_from_slice(&sum.to_be_bytes());
        ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip_and_validation() {
        let header = Ipv4Header::new_simple(protocol::ICMP, [10, 0, 0, 1], [10, 0, 0, 2], 4);
        let packet = Ipv4Utils::create_packet_with_payload(&header, &[1, 2, 3, 4]);
        let parsed = Ipv4Header::from_bytes(&packet).unwrap();
        assert_eq!(parsed.total_len, 24);
        assert_eq!(parsed.src_addr, [10, 0, 0, 1]);
        assert!(parsed.validate(&packet).is_ok());
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let header = Ipv4Header::new_simple(protocol::UDP, [10, 0, 0, 1], [10, 0, 0, 2], 0);
        let mut packet = Ipv4Utils::create_packet_with_payload(&header, &[]);
        packet[15] ^= 0xFF;
        let parsed = Ipv4Header::from_bytes(&packet).unwrap();
        assert_eq!(
            parsed.validate(&packet),
            Err(NetError::MalformedPdu("IPv4 header checksum"))
        );
    }

    #[test]
    fn test_decrement_ttl_keeps_checksum_valid() {
        let header = Ipv4Header::new_simple(protocol::UDP, [10, 0, 0, 1], [10, 0, 1, 2], 0);
        let mut packet = Ipv4Utils::create_packet_with_payload(&header, &[]);
        assert_eq!(Ipv4Utils::decrement_ttl(&mut packet), DEFAULT_TTL - 1);
        let parsed = Ipv4Header::from_bytes(&packet).unwrap();
        assert!(parsed.validate(&packet).is_ok());
    }

    #[test]
    fn test_fragments_rejected() {
        let mut header = Ipv4Header::new_simple(protocol::UDP, [10, 0, 0, 1], [10, 0, 0, 2], 0);
        header.flags_frag_offset = flags::MORE_FRAGMENTS;
        let packet = Ipv4Utils::create_packet_with_payload(&header, &[]);
        let parsed = Ipv4Header::from_bytes(&packet).unwrap();
        assert!(parsed.is_fragment());
        assert_eq!(
            parsed.validate(&packet),
            Err(NetError::MalformedPdu("IPv4 fragments are not reassembled"))
        );
    }

    #[test]
    fn test_rejects_short_or_wrong_version() {
        assert!(Ipv4Header::from_bytes(&[0x45; 10]).is_none());
        let mut bytes = [0u8; 20];
        bytes[0] = 0x65;
        assert!(Ipv4Header::from_bytes(&bytes).is_none());
    }
}
