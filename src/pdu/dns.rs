//! DNS messages with label encoding and name compression.

use super::{ByteReader, Pdu};
use crate::error::{NetError, Result};
use crate::iface::ip::NetworkAddress;
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const DNS_PORT: u16 = 53;
pub const DNS_HEADER_LEN: usize = 12;
pub const DNS_LABEL_MAX: usize = 63;
/// Wire length of a name including every length byte and the root label.
pub const DNS_NAME_MAX: usize = 255;
const MAX_POINTER_FOLLOWS: usize = 16;
const POINTER_MASK: u8 = 0xC0;
const MAX_POINTER_OFFSET: usize = 0x3FFF;

pub const CLASS_IN: u16 = 1;

pub mod record_type {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const ANY: u16 = 255;
}

pub mod rcode {
    pub const NO_ERROR: u8 = 0;
    pub const FORMAT_ERROR: u8 = 1;
    pub const SERVER_FAILURE: u8 = 2;
    pub const NXDOMAIN: u8 = 3;
    pub const NOT_IMPLEMENTED: u8 = 4;
    pub const REFUSED: u8 = 5;
}

/// A validated domain name, stored lowercase without the trailing dot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DnsName {
    labels: Vec<String>,
}

impl DnsName {
    pub fn root() -> Self {
        DnsName::default()
    }

    pub fn from_labels<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut wire_len = 1;
        let mut out = Vec::new();
        for label in labels {
            let label = label.as_ref();
            if label.is_empty() {
                return Err(NetError::InvalidArgument("empty DNS label"));
            }
            if label.len() > DNS_LABEL_MAX {
                return Err(NetError::InvalidArgument("DNS label longer than 63 bytes"));
            }
            wire_len += label.len() + 1;
            if wire_len > DNS_NAME_MAX {
                return Err(NetError::InvalidArgument("DNS name longer than 255 bytes"));
            }
            out.push(label.to_ascii_lowercase());
        }
        Ok(DnsName { labels: out })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    fn suffix_key(&self, from: usize) -> String {
        self.labels[from..].join(".")
    }
}

impl FromStr for DnsName {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.strip_suffix('.').unwrap_or(s);
        if trimmed.is_empty() {
            return Ok(DnsName::root());
        }
        DnsName::from_labels(trimmed.split('.'))
    }
}

impl fmt::Display for DnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return f.write_str(".");
        }
        f.write_str(&self.labels.join("."))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: u8,
    pub rcode: u8,
}

impl DnsHeader {
    pub fn flags(&self) -> u16 {
        ((self.qr as u16) << 15)
            | (((self.opcode & 0x0F) as u16) << 11)
            | ((self.aa as u16) << 10)
            | ((self.tc as u16) << 9)
            | ((self.rd as u16) << 8)
            | ((self.ra as u16) << 7)
            | (((self.z & 0x07) as u16) << 4)
            | (self.rcode & 0x0F) as u16
    }

    pub fn from_flags(id: u16, flags: u16) -> Self {
        DnsHeader {
            id,
            qr: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0F) as u8,
            aa: flags & 0x0400 != 0,
            tc: flags & 0x0200 != 0,
            rd: flags & 0x0100 != 0,
            ra: flags & 0x0080 != 0,
            z: ((flags >> 4) & 0x07) as u8,
            rcode: (flags & 0x0F) as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: DnsName,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(name: DnsName, qtype: u16) -> Self {
        DnsQuestion {
            name,
            qtype,
            qclass: CLASS_IN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A([u8; 4]),
    Ns(DnsName),
    Cname(DnsName),
    Ptr(DnsName),
    Mx { preference: u16, exchange: DnsName },
    /// Character strings, each at most 255 bytes.
    Txt(Vec<Vec<u8>>),
    Aaaa([u8; 16]),
    Unknown { rtype: u16, data: Vec<u8> },
}

impl RecordData {
    pub fn rtype(&self) -> u16 {
        match self {
            RecordData::A(_) => record_type::A,
            RecordData::Ns(_) => record_type::NS,
            RecordData::Cname(_) => record_type::CNAME,
            RecordData::Ptr(_) => record_type::PTR,
            RecordData::Mx { .. } => record_type::MX,
            RecordData::Txt(_) => record_type::TXT,
            RecordData::Aaaa(_) => record_type::AAAA,
            RecordData::Unknown { rtype, .. } => *rtype,
        }
    }

    /// TXT data from text, split into 255-byte character strings.
    pub fn txt(text: &str) -> Self {
        let strings = if text.is_empty() {
            vec![Vec::new()]
        } else {
            text.as_bytes().chunks(255).map(<[u8]>::to_vec).collect()
        };
        RecordData::Txt(strings)
    }

    /// TXT data from ready-made character strings.
    pub fn txt_strings(strings: Vec<Vec<u8>>) -> Result<Self> {
        if strings.iter().any(|s| s.len() > 255) {
            return Err(NetError::InvalidArgument("TXT character string longer than 255 bytes"));
        }
        Ok(RecordData::Txt(strings))
    }
}

impl fmt::Display for RecordData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordData::A(octets) => write!(f, "A {}", NetworkAddress::V4(*octets)),
            RecordData::Ns(name) => write!(f, "NS {}", name),
            RecordData::Cname(name) => write!(f, "CNAME {}", name),
            RecordData::Ptr(name) => write!(f, "PTR {}", name),
            RecordData::Mx {
                preference,
                exchange,
            } => write!(f, "MX {} {}", preference, exchange),
            RecordData::Txt(strings) => {
                f.write_str("TXT")?;
                for s in strings {
                    write!(f, " \"{}\"", String::from_utf8_lossy(s))?;
                }
                Ok(())
            }
            RecordData::Aaaa(octets) => write!(f, "AAAA {}", NetworkAddress::V6(*octets)),
            RecordData::Unknown { rtype, data } => write!(f, "TYPE{} ({} bytes)", rtype, data.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: DnsName,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl DnsRecord {
    pub fn new(name: DnsName, ttl: u32, data: RecordData) -> Self {
        DnsRecord {
            name,
            class: CLASS_IN,
            ttl,
            data,
        }
    }

    pub fn rtype(&self) -> u16 {
        self.data.rtype()
    }

    /// The address carried by an A or AAAA record.
    pub fn address(&self) -> Option<NetworkAddress> {
        match self.data {
            RecordData::A(octets) => Some(NetworkAddress::V4(octets)),
            RecordData::Aaaa(octets) => Some(NetworkAddress::V6(octets)),
            _ => None,
        }
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} IN {}", self.name, self.ttl, self.data)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    /// A recursive-desired query with one question.
    pub fn query(id: u16, name: DnsName, qtype: u16) -> Self {
        DnsMessage {
            header: DnsHeader {
                id,
                rd: true,
                ..DnsHeader::default()
            },
            questions: vec![DnsQuestion::new(name, qtype)],
            ..DnsMessage::default()
        }
    }

    /// An empty response carrying the query's id, opcode, rd and questions.
    pub fn response_to(query: &DnsMessage) -> Self {
        DnsMessage {
            header: DnsHeader {
                id: query.header.id,
                qr: true,
                opcode: query.header.opcode,
                rd: query.header.rd,
                ..DnsHeader::default()
            },
            questions: query.questions.clone(),
            ..DnsMessage::default()
        }
    }
}

fn read_name(reader: &mut ByteReader<'_>) -> Result<DnsName> {
    let packet = reader.data();
    let mut pos = reader.position();
    let mut resume = None;
    let mut follows = 0;
    let mut labels = Vec::new();
    let mut wire_len = 1;

    loop {
        let len = *packet
            .get(pos)
            .ok_or(NetError::MalformedPdu("DNS name runs past buffer"))?;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & POINTER_MASK == POINTER_MASK {
            let low = *packet
                .get(pos + 1)
                .ok_or(NetError::MalformedPdu("DNS pointer truncated"))?;
            let target = (((len & !POINTER_MASK) as usize) << 8) | low as usize;
            if target >= packet.len() {
                return Err(NetError::MalformedPdu("DNS pointer out of range"));
            }
            follows += 1;
            if follows > MAX_POINTER_FOLLOWS {
                return Err(NetError::MalformedPdu("DNS pointer loop"));
            }
            if resume.is_none() {
                resume = Some(pos + 2);
            }
            pos = target;
            continue;
        }
        if len & POINTER_MASK != 0 {
            return Err(NetError::MalformedPdu("reserved DNS label type"));
        }
        let len = len as usize;
        let start = pos + 1;
        let label = packet
            .get(start..start + len)
            .ok_or(NetError::MalformedPdu("DNS label exceeds buffer"))?;
        wire_len += len + 1;
        if wire_len > DNS_NAME_MAX {
            return Err(NetError::MalformedPdu("DNS name longer than 255 bytes"));
        }
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        pos = start + len;
    }

    reader.seek(resume.unwrap_or(pos))?;
    Ok(DnsName { labels })
}

fn read_question(reader: &mut ByteReader<'_>) -> Result<DnsQuestion> {
    Ok(DnsQuestion {
        name: read_name(reader)?,
        qtype: reader.u16()?,
        qclass: reader.u16()?,
    })
}

fn read_record(reader: &mut ByteReader<'_>) -> Result<DnsRecord> {
    let name = read_name(reader)?;
    let rtype = reader.u16()?;
    let class = reader.u16()?;
    let ttl = reader.u32()?;
    let rdlen = reader.u16()? as usize;
    if rdlen > reader.remaining() {
        return Err(NetError::MalformedPdu("DNS record data overruns buffer"));
    }
    let end = reader.position() + rdlen;

    let data = match rtype {
        record_type::A if rdlen == 4 => RecordData::A(reader.array()?),
        record_type::AAAA if rdlen == 16 => RecordData::Aaaa(reader.array()?),
        record_type::A | record_type::AAAA => {
            return Err(NetError::MalformedPdu("DNS address record has wrong length"));
        }
        record_type::NS => RecordData::Ns(read_name(reader)?),
        record_type::CNAME => RecordData::Cname(read_name(reader)?),
        record_type::PTR => RecordData::Ptr(read_name(reader)?),
        record_type::MX => RecordData::Mx {
            preference: reader.u16()?,
            exchange: read_name(reader)?,
        },
        record_type::TXT => {
            let mut strings = Vec::new();
            while reader.position() < end {
                let len = reader.u8()? as usize;
                strings.push(reader.bytes(len)?.to_vec());
            }
            RecordData::Txt(strings)
        }
        _ => RecordData::Unknown {
            rtype,
            data: reader.bytes(rdlen)?.to_vec(),
        },
    };
    if reader.position() != end {
        return Err(NetError::MalformedPdu("DNS record data length mismatch"));
    }
    Ok(DnsRecord {
        name,
        class,
        ttl,
        data,
    })
}

/// Output buffer that remembers where each name suffix was written.
struct NameWriter {
    out: Vec<u8>,
    suffixes: HashMap<String, u16>,
}

impl NameWriter {
    fn u16(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn name(&mut self, name: &DnsName) {
        for i in 0..name.labels.len() {
            let key = name.suffix_key(i);
            if let Some(&offset) = self.suffixes.get(&key) {
                self.u16(0xC000 | offset);
                return;
            }
            let here = self.out.len();
            if here <= MAX_POINTER_OFFSET {
                self.suffixes.insert(key, here as u16);
            }
            let label = name.labels[i].as_bytes();
            self.out.push(label.len() as u8);
            self.out.extend_from_slice(label);
        }
        self.out.push(0);
    }

    fn question(&mut self, question: &DnsQuestion) {
        self.name(&question.name);
        self.u16(question.qtype);
        self.u16(question.qclass);
    }

    fn record(&mut self, record: &DnsRecord) {
        self.name(&record.name);
        self.u16(record.rtype());
        self.u16(record.class);
        self.out.extend_from_slice(&record.ttl.to_be_bytes());
        let len_at = self.out.len();
        self.u16(0);
        match &record.data {
            RecordData::A(octets) => self.out.extend_from_slice(octets),
            RecordData::Aaaa(octets) => self.out.extend_from_slice(octets),
            RecordData::Ns(name) | RecordData::Cname(name) | RecordData::Ptr(name) => {
                self.name(name)
            }
            RecordData::Mx {
                preference,
                exchange,
            } => {
                self.u16(*preference);
                self.name(exchange);
            }
            RecordData::Txt(strings) => {
                for s in strings {
                    if s.is_empty() {
                        self.out.push(0);
                        continue;
                    }
                    // Oversized strings only arise from building `Txt` by hand.
                    for chunk in s.chunks(255) {
                        self.out.push(chunk.len() as u8);
                        self.out.extend_from_slice(chunk);
                    }
                }
            }
            RecordData::Unknown { data, .. } => self.out.extend_from_slice(data),
        }
        let rdlen = (self.out.len() - len_at - 2) as u16;
        BigEndian::write_u16(&mut self.out[len_at..len_at + 2], rdlen);
    }
}

impl Pdu for DnsMessage {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DNS_HEADER_LEN {
            return Err(NetError::MalformedPdu("DNS message shorter than header"));
        }
        let mut reader = ByteReader::new(bytes);
        let id = reader.u16()?;
        let flags = reader.u16()?;
        let qdcount = reader.u16()?;
        let ancount = reader.u16()?;
        let nscount = reader.u16()?;
        let arcount = reader.u16()?;

        let mut msg = DnsMessage {
            header: DnsHeader::from_flags(id, flags),
            ..DnsMessage::default()
        };
        for _ in 0..qdcount {
            msg.questions.push(read_question(&mut reader)?);
        }
        for _ in 0..ancount {
            msg.answers.push(read_record(&mut reader)?);
        }
        for _ in 0..nscount {
            msg.authorities.push(read_record(&mut reader)?);
        }
        for _ in 0..arcount {
            msg.additionals.push(read_record(&mut reader)?);
        }
        Ok(msg)
    }

    fn encode(&self) -> Vec<u8> {
        let mut writer = NameWriter {
            out: Vec::with_capacity(512),
            suffixes: HashMap::new(),
        };
        writer.u16(self.header.id);
        writer.u16(self.header.flags());
        writer.u16(self.questions.len() as u16);
        writer.u16(self.answers.len() as u16);
        writer.u16(self.authorities.len() as u16);
        writer.u16(self.additionals.len() as u16);
        for question in &self.questions {
            writer.question(question);
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            writer.record(record);
        }
        writer.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> DnsName {
        s.parse().unwrap()
    }

    #[test]
    fn test_name_validation() {
        assert_eq!(name("WWW.Example.com.").to_string(), "www.example.com");
        assert!(name(".").is_root());
        assert!("a..b".parse::<DnsName>().is_err());
        assert!("x".repeat(64).parse::<DnsName>().is_err());
        let long = vec!["a".repeat(63); 4].join(".");
        assert!(long.parse::<DnsName>().is_err());
        let fits = vec!["a".repeat(62); 4].join(".");
        assert!(fits.parse::<DnsName>().is_ok());
    }

    #[test]
    fn test_flags_layout() {
        let header = DnsHeader {
            id: 1,
            qr: true,
            opcode: 0,
            aa: true,
            tc: false,
            rd: true,
            ra: false,
            z: 0,
            rcode: rcode::NXDOMAIN,
        };
        assert_eq!(header.flags(), 0x8503);
        assert_eq!(DnsHeader::from_flags(1, 0x8503), header);
    }

    #[test]
    fn test_query_wire_format() {
        let query = DnsMessage::query(0x1234, name("a.bc"), record_type::A);
        let bytes = query.encode();
        assert_eq!(
            bytes,
            vec![
                0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 1, b'a', 2, b'b', b'c', 0, 0, 1,
                0, 1
            ]
        );
        assert_eq!(DnsMessage::decode(&bytes).unwrap(), query);
    }

    #[test]
    fn test_response_compresses_and_round_trips() {
        let query = DnsMessage::query(7, name("example.com"), record_type::ANY);
        let mut response = DnsMessage::response_to(&query);
        response.header.aa = true;
        response.answers = vec![
            DnsRecord::new(name("example.com"), 300, RecordData::A([93, 184, 216, 34])),
            DnsRecord::new(
                name("example.com"),
                300,
                RecordData::Mx {
                    preference: 10,
                    exchange: name("mail.example.com"),
                },
            ),
            DnsRecord::new(name("example.com"), 60, RecordData::txt("v=spf1 -all")),
            DnsRecord::new(name("www.example.com"), 60, RecordData::Cname(name("example.com"))),
            DnsRecord::new(name("example.com"), 60, RecordData::Aaaa([0x20; 16])),
        ];
        response.authorities = vec![DnsRecord::new(
            name("example.com"),
            300,
            RecordData::Ns(name("ns1.example.com")),
        )];
        response.additionals = vec![DnsRecord {
            name: name("ns1.example.com"),
            class: CLASS_IN,
            ttl: 300,
            data: RecordData::Unknown {
                rtype: 99,
                data: vec![1, 2, 3],
            },
        }];

        let bytes = response.encode();
        // Every repeated owner name after the question is a two-byte pointer.
        let pointers = bytes.windows(2).filter(|w| w == &[0xC0, 12]).count();
        assert!(pointers >= 5);

        let decoded = DnsMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.header.id, 7);
        assert!(decoded.header.qr);
        assert_eq!(decoded.answers[0].address(), Some(NetworkAddress::v4(93, 184, 216, 34)));
    }

    #[test]
    fn test_decode_rejects_bad_names() {
        // Label length past the end of the buffer.
        let mut bytes = DnsMessage::query(1, name("abc"), record_type::A).encode();
        bytes.truncate(14);
        assert!(DnsMessage::decode(&bytes).is_err());

        // Pointer to itself.
        let mut looped = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        looped.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1]);
        assert_eq!(
            DnsMessage::decode(&looped).unwrap_err(),
            NetError::MalformedPdu("DNS pointer loop")
        );

        assert!(DnsMessage::decode(&[0; 11]).is_err());
    }

    #[test]
    fn test_txt_character_strings_round_trip() {
        let long = "x".repeat(300);
        let strings = vec![Vec::new(), b"a".to_vec(), vec![b'y'; 255]];
        let mut response = DnsMessage::response_to(&DnsMessage::query(3, name("t.example"), record_type::TXT));
        response.answers = vec![
            DnsRecord::new(name("t.example"), 60, RecordData::txt("")),
            DnsRecord::new(name("t.example"), 60, RecordData::txt(&long)),
            DnsRecord::new(name("t.example"), 60, RecordData::txt_strings(strings).unwrap()),
        ];
        let decoded = DnsMessage::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.answers[0].data, RecordData::Txt(vec![Vec::new()]));
        assert!(matches!(&decoded.answers[1].data, RecordData::Txt(parts) if parts.len() == 2));

        assert_eq!(
            RecordData::txt_strings(vec![vec![0; 256]]),
            Err(NetError::InvalidArgument("TXT character string longer than 255 bytes"))
        );
    }

    #[test]
    fn test_record_length_mismatch_rejected() {
        let mut response = DnsMessage::response_to(&DnsMessage::query(1, name("a"), 1));
        response
            .answers
            .push(DnsRecord::new(name("a"), 1, RecordData::A([1, 2, 3, 4])));
        let mut bytes = response.encode();
        let len = bytes.len();
        // Claim rdlength 5 for the 4-byte address.
        bytes[len - 5] = 5;
        assert!(DnsMessage::decode(&bytes).is_err());
    }
}
