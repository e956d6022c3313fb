//! Protocol data units carried inside UDP payloads
//!
//! Both codecs here share one shape: a fixed header of scalar fields followed
//! by variable records. This module holds the shared pieces:
//! - [`Pdu`], the encode/decode contract every message type implements
//! - [`ByteReader`], a bounds-checked big-endian cursor
//! - [`OptionList`], an ordered `{code, data}` record list with TLV framing

pub mod dhcp;
pub mod dns;

use crate::error::{NetError, Result};
use byteorder::{BigEndian, ByteOrder};

pub use dhcp::{DhcpMessage, DhcpMessageType};
pub use dns::{DnsHeader, DnsMessage, DnsName, DnsQuestion, DnsRecord, RecordData};

/// A wire message. `decode(encode(p))` must reproduce `p`'s content.
pub trait Pdu: Sized {
    fn decode(bytes: &[u8]) -> Result<Self>;
    fn encode(&self) -> Vec<u8>;
}

/// Big-endian cursor over a received message. Every short read is `MalformedPdu`.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    /// The whole underlying buffer, independent of the cursor.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(NetError::MalformedPdu("seek past end of buffer"));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(NetError::MalformedPdu("read past end of buffer"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.bytes(2)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.bytes(4)?))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

/// One `{code, data}` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduOption {
    pub code: u8,
    pub data: Vec<u8>,
}

/// Pad and end codes of a TLV option area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvFormat {
    pub pad: u8,
    pub end: u8,
}

/// BOOTP framing: pad 0, end 255.
impl Default for TlvFormat {
    fn default() -> Self {
        TlvFormat { pad: 0, end: 255 }
    }
}

/// Ordered option records, at most one per code. The pad and end codes
/// of its format are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionList {
    format: TlvFormat,
    options: Vec<PduOption>,
}

impl OptionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(format: TlvFormat) -> Self {
        OptionList {
            format,
            options: Vec::new(),
        }
    }

    pub fn format(&self) -> TlvFormat {
        self.format
    }

    pub fn get(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.code == code)
            .map(|o| o.data.as_slice())
    }

    /// Set `code`, replacing any earlier occurrence in place.
    pub fn set(&mut self, code: u8, data: impl Into<Vec<u8>>) -> Result<()> {
        if code == self.format.pad || code == self.format.end {
            return Err(NetError::InvalidArgument("option code is reserved for framing"));
        }
        let data = data.into();
        if data.len() > u8::MAX as usize {
            return Err(NetError::InvalidArgument("option data longer than 255 bytes"));
        }
        self.replace(code, data);
        Ok(())
    }

    /// `set` for data whose size is known to fit.
    pub(crate) fn set_fixed<const N: usize>(&mut self, code: u8, data: [u8; N]) {
        self.replace(code, data.to_vec());
    }

    fn replace(&mut self, code: u8, data: Vec<u8>) {
        match self.options.iter().position(|o| o.code == code) {
            Some(first) => {
                self.options[first].data = data;
                let mut index = 0;
                self.options.retain(|o| {
                    let keep = o.code != code || index == first;
                    index += 1;
                    keep
                });
            }
            None => self.options.push(PduOption { code, data }),
        }
    }

    pub fn remove(&mut self, code: u8) -> Option<Vec<u8>> {
        let index = self.options.iter().position(|o| o.code == code)?;
        Some(self.options.remove(index).data)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PduOption> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Parse TLV records until the end code or the end of the buffer.
    pub fn decode_tlv(reader: &mut ByteReader<'_>, format: TlvFormat) -> Result<Self> {
        let mut list = OptionList::with_format(format);
        while !reader.is_empty() {
            let code = reader.u8()?;
            if code == format.pad {
                continue;
            }
            if code == format.end {
                break;
            }
            let len = reader
                .u8()
                .map_err(|_| NetError::MalformedPdu("option length missing"))?;
            let data = reader
                .bytes(len as usize)
                .map_err(|_| NetError::MalformedPdu("option overruns buffer"))?;
            list.replace(code, data.to_vec());
        }
        Ok(list)
    }

    /// Append every record and the end code. Pad is never emitted.
    pub fn encode_tlv(&self, out: &mut Vec<u8>) {
        for option in &self.options {
            out.push(option.code);
            out.push(option.data.len() as u8);
            out.extend_from_slice(&option.data);
        }
        out.push(self.format.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: TlvFormat = TlvFormat { pad: 0, end: 255 };

    #[test]
    fn test_reader_bounds() {
        let mut reader = ByteReader::new(&[0x12, 0x34, 0x56]);
        assert_eq!(reader.u16().unwrap(), 0x1234);
        assert_eq!(reader.remaining(), 1);
        assert!(matches!(reader.u16(), Err(NetError::MalformedPdu(_))));
        assert_eq!(reader.u8().unwrap(), 0x56);
        assert!(reader.is_empty());
        assert!(reader.seek(4).is_err());
    }

    #[test]
    fn test_set_replaces_and_dedups() {
        let mut list = OptionList::new();
        list.set(1, vec![1]).unwrap();
        list.set(2, vec![2]).unwrap();
        list.options.push(PduOption { code: 1, data: vec![9] });
        list.set(1, vec![3]).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(1), Some(&[3u8][..]));
        assert_eq!(list.iter().next().unwrap().code, 1);
        assert!(list.set(4, vec![0; 256]).is_err());
        assert_eq!(list.remove(2), Some(vec![2]));
        assert_eq!(list.remove(2), None);
    }

    #[test]
    fn test_tlv_skips_pad_and_stops_at_end() {
        let bytes = [0, 0, 53, 1, 5, 0, 3, 4, 10, 0, 0, 1, 255, 99, 99];
        let mut reader = ByteReader::new(&bytes);
        let list = OptionList::decode_tlv(&mut reader, FORMAT).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(53), Some(&[5u8][..]));
        assert_eq!(list.get(3), Some(&[10u8, 0, 0, 1][..]));

        let mut out = Vec::new();
        list.encode_tlv(&mut out);
        assert_eq!(out, vec![53, 1, 5, 3, 4, 10, 0, 0, 1, 255]);
    }

    #[test]
    fn test_framing_codes_cannot_be_set() {
        let mut list = OptionList::new();
        list.set(53, vec![1]).unwrap();
        let reserved = Err(NetError::InvalidArgument("option code is reserved for framing"));
        assert_eq!(list.set(0, vec![1, 2]), reserved);
        assert_eq!(list.set(255, vec![9]), reserved);
        assert_eq!(list.len(), 1);

        let mut custom = OptionList::with_format(TlvFormat { pad: 7, end: 8 });
        assert!(custom.set(0, vec![1]).is_ok());
        assert!(custom.set(8, vec![1]).is_err());
        let mut out = Vec::new();
        custom.encode_tlv(&mut out);
        assert_eq!(out, vec![0, 1, 1, 8]);
    }

    #[test]
    fn test_tlv_overrun_rejected() {
        let mut reader = ByteReader::new(&[3, 4, 10, 0]);
        assert_eq!(
            OptionList::decode_tlv(&mut reader, FORMAT).unwrap_err(),
            NetError::MalformedPdu("option overruns buffer")
        );
        let mut reader = ByteReader::new(&[3]);
        assert!(OptionList::decode_tlv(&mut reader, FORMAT).is_err());
    }
}
