//! UDP (User Datagram Protocol) implementation
//!
//! This module provides UDP header parsing, validation and construction.
//! Socket state lives in [`crate::socket::udp`].

use crate::error::{NetError, Result};
use crate::network::{protocol, pseudo_header_checksum};
use byteorder::{BigEndian, ByteOrder};

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// UDP packet header structure
///
/// Represents the standard 8-byte UDP header as defined in RFC 768
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16, // Length of UDP header and data
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse UDP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid UDP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < UDP_HEADER_LEN {
            return None;
        }

        Some(UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            length: BigEndian::read_u16(&data[4..6]),
            checksum: BigEndian::read_u16(&data[6..8]),
        })
    }

    /// Convert UDP header to bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u16(&mut bytes[4..6], self.length);
        BigEndian::write_u16(&mut bytes[6..8], self.checksum);
        bytes
    }
}

pub struct UdpUtils {}

impl UdpUtils {
    /// Validate a UDP datagram carried between `src_ip` and `dst_ip`
    pub fn validate_udp_packet(src_ip: [u8; 4], dst_ip: [u8; 4], packet: &[u8]) -> Result<UdpHeader> {
        let header =
            UdpHeader::from_bytes(packet).ok_or(NetError::MalformedPdu("UDP header truncated"))?;

        if header.length as usize != packet.len() {
            return Err(NetError::MalformedPdu("UDP length mismatch"));
        }

        // A zero checksum means the sender did not compute one
        if header.checksum != 0
            && pseudo_header_checksum(src_ip, dst_ip, protocol::UDP, packet) != 0
        {
            return Err(NetError::MalformedPdu("UDP checksum"));
        }

        Ok(header)
    }

    /// Creates a complete UDP datagram with proper checksum
    pub fn create_udp_packet_with_checksum(
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_udp_len = UDP_HEADER_LEN + payload.len();
        let header = UdpHeader {
            src_port,
            dst_port,
            length: total_udp_len as u16,
            checksum: 0,
        };

        let mut packet = Vec::with_capacity(total_udp_len);
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(payload);

        let mut checksum = pseudo_header_checksum(src_ip, dst_ip, protocol::UDP, &packet);
        // An all-zero result is transmitted as all ones (RFC 768)
        if checksum == 0 {
            checksum = 0xFFFF;
        }
        BigEndian::write_u16(&mut packet[6..8], checksum);

        packet
    }
}
