//! DHCP messages: the BOOTP fixed header, magic cookie and TLV options.

use super::{ByteReader, OptionList, Pdu, TlvFormat};
use crate::error::{NetError, Result};
use crate::iface::ip::NetworkAddress;
use crate::network::ethernet::MacAddr;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const FLAG_BROADCAST: u16 = 0x8000;
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Length of the BOOTP header before the cookie.
pub const BOOTP_FIXED_LEN: usize = 236;
/// Shortest decodable message: fixed header plus cookie.
pub const DHCP_MIN_LEN: usize = BOOTP_FIXED_LEN + 4;

const FORMAT: TlvFormat = TlvFormat {
    pad: option::PAD,
    end: option::END,
};

/// Option codes with typed accessors.
pub mod option {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVERS: u8 = 6;
    pub const HOSTNAME: u8 = 12;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST_LIST: u8 = 55;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const END: u8 = 255;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl DhcpMessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use DhcpMessageType::*;
        Some(match value {
            1 => Discover,
            2 => Offer,
            3 => Request,
            4 => Decline,
            5 => Ack,
            6 => Nak,
            7 => Release,
            8 => Inform,
            _ => return None,
        })
    }
}

impl fmt::Display for DhcpMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DhcpMessageType::Discover => "DHCPDISCOVER",
            DhcpMessageType::Offer => "DHCPOFFER",
            DhcpMessageType::Request => "DHCPREQUEST",
            DhcpMessageType::Decline => "DHCPDECLINE",
            DhcpMessageType::Ack => "DHCPACK",
            DhcpMessageType::Nak => "DHCPNAK",
            DhcpMessageType::Release => "DHCPRELEASE",
            DhcpMessageType::Inform => "DHCPINFORM",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: [u8; 4],
    pub yiaddr: [u8; 4],
    pub siaddr: [u8; 4],
    pub giaddr: [u8; 4],
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: OptionList,
}

impl DhcpMessage {
    /// A BOOTREQUEST from `mac` asking for broadcast replies.
    pub fn request(xid: u32, mac: MacAddr, kind: DhcpMessageType) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac.0);
        let mut msg = DhcpMessage {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: FLAG_BROADCAST,
            ciaddr: [0; 4],
            yiaddr: [0; 4],
            siaddr: [0; 4],
            giaddr: [0; 4],
            chaddr,
            sname: [0; 64],
            file: [0; 128],
            options: OptionList::with_format(FORMAT),
        };
        msg.set_message_type(kind);
        msg
    }

    /// A BOOTREPLY answering `request`, copying xid, flags, giaddr and chaddr.
    pub fn reply_to(request: &DhcpMessage, kind: DhcpMessageType) -> Self {
        let mut msg = DhcpMessage {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: [0; 4],
            yiaddr: [0; 4],
            siaddr: [0; 4],
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0; 64],
            file: [0; 128],
            options: OptionList::with_format(FORMAT),
        };
        msg.set_message_type(kind);
        msg
    }

    pub fn client_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        MacAddr(mac)
    }

    pub fn message_type(&self) -> Option<DhcpMessageType> {
        match self.options.get(option::MESSAGE_TYPE)? {
            [value] => DhcpMessageType::from_u8(*value),
            _ => None,
        }
    }

    pub fn set_message_type(&mut self, kind: DhcpMessageType) {
        self.options.set_fixed(option::MESSAGE_TYPE, [kind as u8]);
    }

    fn address_option(&self, code: u8) -> Option<NetworkAddress> {
        let data: [u8; 4] = self.options.get(code)?.try_into().ok()?;
        Some(NetworkAddress::V4(data))
    }

    fn set_address_option(&mut self, code: u8, addr: NetworkAddress) -> Result<()> {
        let octets = addr.require_v4()?;
        self.options.set_fixed(code, octets);
        Ok(())
    }

    fn u32_option(&self, code: u8) -> Option<u32> {
        let data = self.options.get(code)?;
        (data.len() == 4).then(|| BigEndian::read_u32(data))
    }

    pub fn subnet_mask(&self) -> Option<NetworkAddress> {
        self.address_option(option::SUBNET_MASK)
    }

    pub fn set_subnet_mask(&mut self, mask: NetworkAddress) -> Result<()> {
        self.set_address_option(option::SUBNET_MASK, mask)
    }

    /// First router of option 3.
    pub fn router(&self) -> Option<NetworkAddress> {
        let data = self.options.get(option::ROUTER)?;
        let first: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(NetworkAddress::V4(first))
    }

    pub fn set_router(&mut self, router: NetworkAddress) -> Result<()> {
        self.set_address_option(option::ROUTER, router)
    }

    pub fn dns_servers(&self) -> Vec<NetworkAddress> {
        self.options
            .get(option::DNS_SERVERS)
            .map(|data| {
                data.chunks_exact(4)
                    .map(|c| NetworkAddress::v4(c[0], c[1], c[2], c[3]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_dns_servers(&mut self, servers: &[NetworkAddress]) -> Result<()> {
        let mut data = Vec::with_capacity(servers.len() * 4);
        for server in servers {
            data.extend_from_slice(&server.require_v4()?);
        }
        self.options.set(option::DNS_SERVERS, data)
    }

    pub fn hostname(&self) -> Option<String> {
        let data = self.options.get(option::HOSTNAME)?;
        Some(String::from_utf8_lossy(data).into_owned())
    }

    pub fn set_hostname(&mut self, name: &str) -> Result<()> {
        self.options.set(option::HOSTNAME, name.as_bytes())
    }

    pub fn requested_ip(&self) -> Option<NetworkAddress> {
        self.address_option(option::REQUESTED_IP)
    }

    pub fn set_requested_ip(&mut self, addr: NetworkAddress) -> Result<()> {
        self.set_address_option(option::REQUESTED_IP, addr)
    }

    pub fn server_id(&self) -> Option<NetworkAddress> {
        self.address_option(option::SERVER_ID)
    }

    pub fn set_server_id(&mut self, addr: NetworkAddress) -> Result<()> {
        self.set_address_option(option::SERVER_ID, addr)
    }

    /// Lease time in seconds.
    pub fn lease_time(&self) -> Option<u32> {
        self.u32_option(option::LEASE_TIME)
    }

    pub fn set_lease_time(&mut self, secs: u32) {
        self.options.set_fixed(option::LEASE_TIME, secs.to_be_bytes());
    }

    /// T1 in seconds.
    pub fn renewal_time(&self) -> Option<u32> {
        self.u32_option(option::RENEWAL_TIME)
    }

    pub fn set_renewal_time(&mut self, secs: u32) {
        self.options.set_fixed(option::RENEWAL_TIME, secs.to_be_bytes());
    }

    /// T2 in seconds.
    pub fn rebinding_time(&self) -> Option<u32> {
        self.u32_option(option::REBINDING_TIME)
    }

    pub fn set_rebinding_time(&mut self, secs: u32) {
        self.options.set_fixed(option::REBINDING_TIME, secs.to_be_bytes());
    }

    pub fn parameter_request_list(&self) -> Vec<u8> {
        self.options
            .get(option::PARAMETER_REQUEST_LIST)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    pub fn set_parameter_request_list(&mut self, codes: &[u8]) -> Result<()> {
        self.options.set(option::PARAMETER_REQUEST_LIST, codes)
    }
}

impl Pdu for DhcpMessage {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DHCP_MIN_LEN {
            return Err(NetError::MalformedPdu("DHCP message shorter than 240 bytes"));
        }
        let mut reader = ByteReader::new(bytes);
        let op = reader.u8()?;
        let htype = reader.u8()?;
        let hlen = reader.u8()?;
        let hops = reader.u8()?;
        let xid = reader.u32()?;
        let secs = reader.u16()?;
        let flags = reader.u16()?;
        let ciaddr = reader.array()?;
        let yiaddr = reader.array()?;
        let siaddr = reader.array()?;
        let giaddr = reader.array()?;
        let chaddr = reader.array()?;
        let sname = reader.array()?;
        let file = reader.array()?;
        if reader.array::<4>()? != MAGIC_COOKIE {
            return Err(NetError::MalformedPdu("DHCP magic cookie mismatch"));
        }
        let options = OptionList::decode_tlv(&mut reader, FORMAT)?;
        Ok(DhcpMessage {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; DHCP_MIN_LEN];
        out[0] = self.op;
        out[1] = self.htype;
        out[2] = self.hlen;
        out[3] = self.hops;
        BigEndian::write_u32(&mut out[4..8], self.xid);
        BigEndian::write_u16(&mut out[8..10], self.secs);
        BigEndian::write_u16(&mut out[10..12], self.flags);
        out[12..16].copy_from_slice(&self.ciaddr);
        out[16..20].copy_from_slice(&self.yiaddr);
        out[20..24].copy_from_slice(&self.siaddr);
        out[24..28].copy_from_slice(&self.giaddr);
        out[28..44].copy_from_slice(&self.chaddr);
        out[44..108].copy_from_slice(&self.sname);
        out[108..236].copy_from_slice(&self.file);
        out[236..240].copy_from_slice(&MAGIC_COOKIE);
        self.options.encode_tlv(&mut out);
        out
    }
}
