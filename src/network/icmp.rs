//! ICMP (Internet Control Message Protocol) implementation
//!
//! This module provides ICMP packet parsing and construction for the message
//! types the simulated network uses: Echo Request/Reply for ping, Time
//! Exceeded for traceroute, and Destination Unreachable for routing failures.

use crate::network::checksum;
use crate::network::ipv4::{protocol, Ipv4Header, IPV4_HEADER_LEN};
use byteorder::{BigEndian, ByteOrder};

/// Minimum ICMP header length in bytes
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMP message types
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

/// Destination Unreachable codes
pub const ICMP_CODE_NET_UNREACHABLE: u8 = 0;
pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

/// ICMP packet header structure
///
/// Represents the standard 8-byte ICMP header as defined in RFC 792
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub msg_type: u8,  // ICMP message type
    pub msg_code: u8,  // ICMP message code
    pub checksum: u16, // ICMP checksum
    pub rest: [u8; 4], // Type-specific data (e.g., identifier and sequence for echo)
}

impl IcmpHeader {
    /// Parse ICMP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid ICMP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return None;
        }

        Some(IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            rest: [data[4], data[5], data[6], data[7]],
        })
    }

    /// Convert ICMP header to bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.msg_type;
        bytes[1] = self.msg_code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        bytes[4..8].copy_from_slice(&self.rest);
        bytes
    }

    /// Check if this is an Echo Request message
    pub fn is_echo_request(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REQUEST
    }

    /// Check if this is an Echo Reply message
    pub fn is_echo_reply(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REPLY
    }

    /// Get the identifier field for Echo Request/Reply messages
    pub fn identifier(&self) -> u16 {
        BigEndian::read_u16(&self.rest[0..2])
    }

    /// Get the sequence number field for Echo Request/Reply messages
    pub fn sequence(&self) -> u16 {
        BigEndian::read_u16(&self.rest[2..4])
    }

    /// Set the identifier field for Echo Request/Reply messages
    pub fn set_identifier(&mut self, id: u16) {
        BigEndian::write_u16(&mut self.rest[0..2], id);
    }

    /// Set the sequence number field for Echo Request/Reply messages
    pub fn set_sequence(&mut self, seq: u16) {
        BigEndian::write_u16(&mut self.rest[2..4], seq);
    }
}

/// The probe an ICMP error message refers to, recovered from its quoted datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotedEcho {
    pub dst_addr: [u8; 4],
    pub identifier: u16,
    pub sequence: u16,
}

/// Addresses and ports of a quoted TCP or UDP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotedTransport {
    pub protocol: u8,
    pub src_addr: [u8; 4],
    pub dst_addr: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
}

pub struct IcmpUtils {}

impl IcmpUtils {
    /// Build an Echo Request message (header + payload) with checksum.
    pub fn create_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut header = IcmpHeader {
            msg_type: ICMP_TYPE_ECHO_REQUEST,
            msg_code: 0,
            checksum: 0,
            rest: [0; 4],
        };
        header.set_identifier(identifier);
        header.set_sequence(sequence);
        Self::finish(header, payload)
    }

    /// Turn a received Echo Request message into the matching Echo Reply.
    pub fn create_icmpv4_reply(request: &[u8]) -> Vec<u8> {
        let mut reply = request.to_vec();
        reply[0] = ICMP_TYPE_ECHO_REPLY;
        reply[2..4].copy_from_slice(&[0, 0]);
        let sum = checksum(&reply);
        reply[2..4].copy_from_slice(&sum.to_be_bytes());
        reply
    }

    /// Build an error message quoting the offending datagram's header and first 8 payload bytes.
    pub fn create_error(msg_type: u8, msg_code: u8, original: &[u8]) -> Vec<u8> {
        let header_len = Ipv4Header::from_bytes(original)
            .map(|h| h.header_len())
            .unwrap_or(IPV4_HEADER_LEN);
        let quote_len = (header_len + 8).min(original.len());
        let header = IcmpHeader {
            msg_type,
            msg_code,
            checksum: 0,
            rest: [0; 4],
        };
        Self::finish(header, &original[..quote_len])
    }

    /// Recover the echo probe quoted inside a Time Exceeded or Destination Unreachable body.
    pub fn quoted_echo(icmp_message: &[u8]) -> Option<QuotedEcho> {
        let quoted = icmp_message.get(ICMP_HEADER_LEN..)?;
        let ip = Ipv4Header::from_bytes(quoted)?;
        let inner = IcmpHeader::from_bytes(quoted.get(ip.header_len()..)?)?;
        if !inner.is_echo_request() {
            return None;
        }
        Some(QuotedEcho {
            dst_addr: ip.dst_addr,
            identifier: inner.identifier(),
            sequence: inner.sequence(),
        })
    }

    /// Recover the flow of a TCP or UDP datagram quoted in an error body.
    /// Only the first four transport bytes (the ports) are needed.
    pub fn quoted_transport(icmp_message: &[u8]) -> Option<QuotedTransport> {
        let quoted = icmp_message.get(ICMP_HEADER_LEN..)?;
        let ip = Ipv4Header::from_bytes(quoted)?;
        if ip.protocol != protocol::TCP && ip.protocol != protocol::UDP {
            return None;
        }
        let ports = quoted.get(ip.header_len()..ip.header_len() + 4)?;
        Some(QuotedTransport {
            protocol: ip.protocol,
            src_addr: ip.src_addr,
            dst_addr: ip.dst_addr,
            src_port: BigEndian::read_u16(&ports[0..2]),
            dst_port: BigEndian::read_u16(&ports[2..4]),
        })
    }

    fn finish(header: IcmpHeader, payload: &[u8]) -> Vec<u8> {
        let mut message = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
        message.extend_from_slice(&header.to_bytes());
        message.extend_from_slice(payload);
        let sum = checksum(&message);
        message[2..4].copy_from_slice(&sum.to_be_bytes());
        message
    }
}
