//! Classic libpcap capture files.
//!
//! Writing is a pure transform from a frame log to bytes: the log is only
//! borrowed, so an interface can be exported any number of times while it
//! keeps capturing. Everything is little-endian.

use crate::config::CaptureConfig;
use crate::error::{NetError, Result};
use crate::iface::interface::CapturedFrame;
use byteorder::{ByteOrder, LittleEndian};

pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
pub const PCAP_GLOBAL_HEADER_LEN: usize = 24;
pub const PCAP_RECORD_HEADER_LEN: usize = 16;

/// The 24-byte global header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone: i32,
    pub sigfigs: u32,
    pub snaplen: u32,
    pub link_type: u32,
}

impl PcapHeader {
    pub fn new(snaplen: u32, link_type: u32) -> Self {
        PcapHeader {
            magic: PCAP_MAGIC,
            version_major: PCAP_VERSION_MAJOR,
            version_minor: PCAP_VERSION_MINOR,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            link_type,
        }
    }

    pub fn to_bytes(&self) -> [u8; PCAP_GLOBAL_HEADER_LEN] {
        let mut bytes = [0u8; PCAP_GLOBAL_HEADER_LEN];
        LittleEndian::write_u32(&mut bytes[0..4], self.magic);
        LittleEndian::write_u16(&mut bytes[4..6], self.version_major);
        LittleEndian::write_u16(&mut bytes[6..8], self.version_minor);
        LittleEndian::write_i32(&mut bytes[8..12], self.thiszone);
        LittleEndian::write_u32(&mut bytes[12..16], self.sigfigs);
        LittleEndian::write_u32(&mut bytes[16..20], self.snaplen);
        LittleEndian::write_u32(&mut bytes[20..24], self.link_type);
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < PCAP_GLOBAL_HEADER_LEN {
            return Err(NetError::MalformedPdu("pcap global header truncated"));
        }
        let magic = LittleEndian::read_u32(&data[0..4]);
        if magic != PCAP_MAGIC {
            return Err(NetError::MalformedPdu("pcap magic"));
        }
        Ok(PcapHeader {
            magic,
            version_major: LittleEndian::read_u16(&data[4..6]),
            version_minor: LittleEndian::read_u16(&data[6..8]),
            thiszone: LittleEndian::read_i32(&data[8..12]),
            sigfigs: LittleEndian::read_u32(&data[12..16]),
            snaplen: LittleEndian::read_u32(&data[16..20]),
            link_type: LittleEndian::read_u32(&data[20..24]),
        })
    }
}

/// Serializes frame logs into pcap files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureWriter {
    header: PcapHeader,
}

impl CaptureWriter {
    pub fn new(config: &CaptureConfig) -> Self {
        CaptureWriter {
            header: PcapHeader::new(config.snaplen, config.link_type),
        }
    }

    pub fn header(&self) -> PcapHeader {
        self.header
    }

    /// Build the whole file in one pre-sized buffer.
    pub fn write(&self, frames: &[CapturedFrame]) -> Vec<u8> {
        let body: usize = frames.iter().map(|f| PCAP_RECORD_HEADER_LEN + f.data.len()).sum();
        let mut out = Vec::with_capacity(PCAP_GLOBAL_HEADER_LEN + body);
        out.extend_from_slice(&self.header.to_bytes());
        for frame in frames {
            let mut record = [0u8; PCAP_RECORD_HEADER_LEN];
            let seconds = (frame.timestamp_ms / 1000) as u32;
            let micros = ((frame.timestamp_ms % 1000) * 1000) as u32;
            let len = frame.data.len() as u32;
            LittleEndian::write_u32(&mut record[0..4], seconds);
            LittleEndian::write_u32(&mut record[4..8], micros);
            LittleEndian::write_u32(&mut record[8..12], len);
            LittleEndian::write_u32(&mut record[12..16], len);
            out.extend_from_slice(&record);
            out.extend_from_slice(&frame.data);
        }
        out
    }
}

/// Parse a classic little-endian pcap file back into its header and frames.
pub fn read_capture(data: &[u8]) -> Result<(PcapHeader, Vec<CapturedFrame>)> {
    let header = PcapHeader::from_bytes(data)?;
    let mut frames = Vec::new();
    let mut rest = &data[PCAP_GLOBAL_HEADER_LEN..];
    while !rest.is_empty() {
        if rest.len() < PCAP_RECORD_HEADER_LEN {
            return Err(NetError::MalformedPdu("pcap record header truncated"));
        }
        let seconds = LittleEndian::read_u32(&rest[0..4]) as u64;
        let micros = LittleEndian::read_u32(&rest[4..8]) as u64;
        let captured = LittleEndian::read_u32(&rest[8..12]) as usize;
        let original = LittleEndian::read_u32(&rest[12..16]) as usize;
        if captured > original {
            return Err(NetError::MalformedPdu("pcap captured length exceeds original"));
        }
        let end = PCAP_RECORD_HEADER_LEN + captured;
        if rest.len() < end {
            return Err(NetError::MalformedPdu("pcap record truncated"));
        }
        frames.push(CapturedFrame {
            timestamp_ms: seconds * 1000 + micros / 1000,
            data: rest[PCAP_RECORD_HEADER_LEN..end].to_vec(),
        });
        rest = &rest[end..];
    }
    Ok((header, frames))
}
