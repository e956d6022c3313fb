//! TCP (Transmission Control Protocol) implementation
//!
//! This module provides TCP segment parsing and construction plus the
//! connection states used by the socket multiplexer. The simulated wire never
//! loses or reorders segments, so there is no retransmission machinery.

use crate::error::{NetError, Result};
use crate::network::{protocol, pseudo_header_checksum};
use std::fmt;

pub const TCP_HEADER_LEN: usize = 20;
/// Largest payload carried in one data segment.
pub const TCP_MSS: usize = 1460;

/// TCP connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    /// Peer sent FIN; buffered data may still be read.
    CloseWait,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN-SENT",
            TcpState::SynReceived => "SYN-RECV",
            TcpState::Established => "ESTAB",
            TcpState::CloseWait => "CLOSE-WAIT",
        };
        f.write_str(name)
    }
}

/// TCP flag bits
pub mod flags {
    pub const FIN: u16 = 0x0001;
    pub const SYN: u16 = 0x0002;
    pub const RST: u16 = 0x0004;
    pub const PSH: u16 = 0x0008;
    pub const ACK: u16 = 0x0010;
    pub const URG: u16 = 0x0020;
}

/// TCP packet header structure
///
/// Represents the standard 20-byte TCP header as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub data_offset_and_flags: u16, // Data offset (4 bits) + Reserved (3 bits) + Flags (9 bits)
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Header with a 20-byte data offset and the given flag bits.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32, flag_bits: u16) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            data_offset_and_flags: (5 << 12) | (flag_bits & 0x01FF),
            window_size: 0xFFFF,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// Parse TCP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid TCP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_LEN {
            return None;
        }

        Some(TcpHeader {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset_and_flags: u16::from_be_bytes([data[12], data[13]]),
            window_size: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
        })
    }

    /// Convert TCP header to bytes
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut bytes = [0u8; 20];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        bytes[12..14].copy_from_slice(&self.data_offset_and_flags.to_be_bytes());
        bytes[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        bytes
    }

    fn has(&self, bit: u16) -> bool {
        (self.data_offset_and_flags & bit) != 0
    }

    /// Check if SYN flag is set
    pub fn is_syn(&self) -> bool {
        self.has(flags::SYN)
    }

    /// Check if ACK flag is set
    pub fn is_ack(&self) -> bool {
        self.has(flags::ACK)
    }

    /// Check if FIN flag is set
    pub fn is_fin(&self) -> bool {
        self.has(flags::FIN)
    }

    /// Check if RST flag is set
    pub fn is_rst(&self) -> bool {
        self.has(flags::RST)
    }

    /// Check if PSH flag is set
    pub fn is_psh(&self) -> bool {
        self.has(flags::PSH)
    }

    /// Get the data offset (header length) in bytes
    pub fn data_offset(&self) -> usize {
        ((self.data_offset_and_flags >> 12) as usize) * 4
    }
}

/// A parsed segment: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Serialize with a checksum over the IPv4 pseudo header.
    pub fn to_bytes(&self, src_ip: [u8; 4], dst_ip: [u8; 4]) -> Vec<u8> {
        let mut header = self.header;
        header.checksum = 0;
        let mut bytes = Vec::with_capacity(TCP_HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        let sum = pseudo_header_checksum(src_ip, dst_ip, protocol::TCP, &bytes);
        bytes[16..18].copy_from_slice(&sum.to_be_bytes());
        bytes
    }

    /// Parse and checksum-verify a segment carried between `src_ip` and `dst_ip`.
    pub fn parse(src_ip: [u8; 4], dst_ip: [u8; 4], data: &[u8]) -> Result<Self> {
        let header = TcpHeader::from_bytes(data).ok_or(NetError::MalformedPdu("TCP header truncated"))?;
        let offset = header.data_offset();
        if offset < TCP_HEADER_LEN || offset > data.len() {
            return Err(NetError::MalformedPdu("TCP data offset"));
        }
        if pseudo_header_checksum(src_ip, dst_ip, protocol::TCP, data) != 0 {
            return Err(NetError::MalformedPdu("TCP checksum"));
        }
        Ok(TcpSegment {
            header,
            payload: data[offset..].to_vec(),
        })
    }

    /// Sequence space consumed: payload bytes plus one each for SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.header.is_syn() as u32 + self.header.is_fin() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_and_offset() {
        let header = TcpHeader::new(1000, 80, 1, 0, flags::SYN);
        assert!(header.is_syn());
        assert!(!header.is_ack());
        assert_eq!(header.data_offset(), 20);

        let synack = TcpHeader::new(80, 1000, 5, 2, flags::SYN | flags::ACK);
        assert!(synack.is_syn() && synack.is_ack());
        assert!(!synack.is_fin() && !synack.is_rst());
    }

    #[test]
    fn test_segment_checksum_round_trip() {
        let segment = TcpSegment {
            header: TcpHeader::new(40000, 7, 100, 200, flags::PSH | flags::ACK),
            payload: b"data".to_vec(),
        };
        let bytes = segment.to_bytes([10, 0, 0, 1], [10, 0, 0, 2]);
        let parsed = TcpSegment::parse([10, 0, 0, 1], [10, 0, 0, 2], &bytes).unwrap();
        assert_eq!(parsed.payload, b"data");
        assert_eq!(parsed.header.seq_number, 100);
        assert_eq!(parsed.seq_len(), 4);

        assert!(TcpSegment::parse([10, 0, 0, 9], [10, 0, 0, 2], &bytes).is_err());
    }

    #[test]
    fn test_syn_fin_consume_sequence_space() {
        let syn = TcpSegment {
            header: TcpHeader::new(1, 2, 0, 0, flags::SYN),
            payload: Vec::new(),
        };
        assert_eq!(syn.seq_len(), 1);
        let fin = TcpSegment {
            header: TcpHeader::new(1, 2, 0, 0, flags::FIN | flags::ACK),
            payload: Vec::new(),
        };
        assert_eq!(fin.seq_len(), 1);
    }
}
