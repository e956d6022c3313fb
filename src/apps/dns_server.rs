//! Authoritative DNS server answering from a JSON zone.

use crate::error::{NetError, Result};
use crate::iface::host::Host;
use crate::iface::ip::NetworkAddress;
use crate::pdu::dns::{rcode, record_type, DnsMessage, DnsName, DnsRecord, RecordData, DNS_PORT};
use crate::pdu::Pdu;
use crate::socket::UdpSocketHandle;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const MAX_CNAME_HOPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MxEntry {
    pub preference: u16,
    pub exchange: String,
}

/// Zone tables keyed by owner name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Zone {
    pub ttl: u32,
    /// IPv4 values become A records, IPv6 values AAAA records.
    pub a: BTreeMap<String, Vec<NetworkAddress>>,
    pub mx: BTreeMap<String, Vec<MxEntry>>,
    pub ns: BTreeMap<String, Vec<String>>,
    pub cname: BTreeMap<String, String>,
    pub txt: BTreeMap<String, Vec<String>>,
}

impl Default for Zone {
    fn default() -> Self {
        Zone {
            ttl: 300,
            a: BTreeMap::new(),
            mx: BTreeMap::new(),
            ns: BTreeMap::new(),
            cname: BTreeMap::new(),
            txt: BTreeMap::new(),
        }
    }
}

fn zone_name(text: &str) -> Result<DnsName> {
    text.parse()
        .map_err(|e| NetError::Config(format!("bad zone name {:?}: {}", text, e)))
}

impl Zone {
    pub fn from_json(text: &str) -> Result<Self> {
        let zone: Zone = serde_json::from_str(text).map_err(|e| NetError::Config(e.to_string()))?;
        Authority::new(&zone)?;
        Ok(zone)
    }

    /// Every record of the zone, validated.
    pub fn records(&self) -> Result<Vec<DnsRecord>> {
        let ttl = self.ttl;
        let mut records = Vec::new();
        for (owner, addresses) in &self.a {
            let name = zone_name(owner)?;
            for addr in addresses {
                let data = match addr {
                    NetworkAddress::V4(octets) => RecordData::A(*octets),
                    NetworkAddress::V6(octets) => RecordData::Aaaa(*octets),
                };
                records.push(DnsRecord::new(name.clone(), ttl, data));
            }
        }
        for (owner, entries) in &self.mx {
            let name = zone_name(owner)?;
            for entry in entries {
                let data = RecordData::Mx {
                    preference: entry.preference,
                    exchange: zone_name(&entry.exchange)?,
                };
                records.push(DnsRecord::new(name.clone(), ttl, data));
            }
        }
        for (owner, servers) in &self.ns {
            let name = zone_name(owner)?;
            for server in servers {
                records.push(DnsRecord::new(name.clone(), ttl, RecordData::Ns(zone_name(server)?)));
            }
        }
        for (owner, target) in &self.cname {
            let name = zone_name(owner)?;
            records.push(DnsRecord::new(name, ttl, RecordData::Cname(zone_name(target)?)));
        }
        for (owner, texts) in &self.txt {
            let name = zone_name(owner)?;
            for text in texts {
                records.push(DnsRecord::new(name.clone(), ttl, RecordData::txt(text)));
            }
        }
        Ok(records)
    }
}

/// Zone records grouped by owner name.
#[derive(Debug, Clone, Default)]
pub struct Authority {
    by_name: HashMap<DnsName, Vec<DnsRecord>>,
}

impl Authority {
    pub fn new(zone: &Zone) -> Result<Self> {
        let mut by_name: HashMap<DnsName, Vec<DnsRecord>> = HashMap::new();
        for record in zone.records()? {
            by_name.entry(record.name.clone()).or_default().push(record);
        }
        for (name, records) in &by_name {
            let aliased = records.iter().any(|r| r.rtype() == record_type::CNAME);
            if aliased && records.len() > 1 {
                return Err(NetError::Config(format!("{} has a CNAME and other records", name)));
            }
        }
        Ok(Authority { by_name })
    }

    fn matching(&self, name: &DnsName, qtype: u16) -> Vec<DnsRecord> {
        self.by_name
            .get(name)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| qtype == record_type::ANY || r.rtype() == qtype)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn addresses(&self, name: &DnsName) -> Vec<DnsRecord> {
        self.by_name
            .get(name)
            .map(|records| records.iter().filter(|r| r.address().is_some()).cloned().collect())
            .unwrap_or_default()
    }

    /// Build the response to `query`.
    pub fn answer(&self, query: &DnsMessage) -> DnsMessage {
        let mut response = DnsMessage::response_to(query);
        response.header.aa = true;
        if query.header.opcode != 0 {
            response.header.rcode = rcode::NOT_IMPLEMENTED;
            return response;
        }
        let [question] = query.questions.as_slice() else {
            response.header.rcode = rcode::FORMAT_ERROR;
            return response;
        };
        if !self.by_name.contains_key(&question.name) {
            response.header.rcode = rcode::NXDOMAIN;
            return response;
        }

        let mut name = question.name.clone();
        for _ in 0..MAX_CNAME_HOPS {
            let found = self.matching(&name, question.qtype);
            if !found.is_empty() || question.qtype == record_type::CNAME {
                response.answers.extend(found);
                break;
            }
            let alias = self.matching(&name, record_type::CNAME);
            let Some(RecordData::Cname(target)) = alias.first().map(|r| r.data.clone()) else {
                break;
            };
            response.answers.extend(alias);
            name = target;
        }

        for record in &response.answers {
            let target = match &record.data {
                RecordData::Mx { exchange, .. } => exchange,
                RecordData::Ns(server) => server,
                _ => continue,
            };
            for glue in self.addresses(target) {
                if !response.additionals.contains(&glue) {
                    response.additionals.push(glue);
                }
            }
        }
        response
    }
}

pub struct DnsServer {
    host: Host,
    authority: Authority,
    socket: UdpSocketHandle,
}

impl DnsServer {
    /// Load the zone and bind UDP port 53.
    pub fn bind(host: Host, zone: &Zone) -> Result<Self> {
        let authority = Authority::new(zone)?;
        let socket = host.open_udp_socket(NetworkAddress::UNSPECIFIED_V4, DNS_PORT)?;
        Ok(DnsServer {
            host,
            authority,
            socket,
        })
    }

    /// Closing this socket stops `serve`.
    pub fn socket(&self) -> UdpSocketHandle {
        self.socket
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Answer queries until the socket is closed.
    pub async fn serve(&self) -> Result<()> {
        info!("dns server on {} listening", self.host.name());
        while let Some(datagram) = self.host.recv_udp_socket(self.socket).await? {
            let query = match DnsMessage::decode(&datagram.payload) {
                Ok(query) if !query.header.qr => query,
                Ok(_) => continue,
                Err(e) => {
                    warn!("dns server: dropping query from {}: {}", datagram.src_addr, e);
                    continue;
                }
            };
            let response = self.authority.answer(&query);
            debug!(
                "dns server: {:?} -> rcode {} with {} answers",
                query.questions.first().map(|q| q.name.to_string()),
                response.header.rcode,
                response.answers.len()
            );
            self.host
                .send_udp_socket(self.socket, datagram.src_addr, datagram.src_port, &response.encode())?;
        }
        info!("dns server on {} stopped", self.host.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = r#"{
        "a": {
            "example.com": ["93.184.216.34"],
            "mail.example.com": ["93.184.216.40"],
            "ns1.example.com": ["93.184.216.53"]
        },
        "mx": { "example.com": [{ "preference": 10, "exchange": "mail.example.com" }] },
        "ns": { "example.com": ["ns1.example.com"] },
        "cname": { "www.example.com": "example.com" },
        "txt": { "example.com": ["v=spf1 -all"] }
    }"#;

    fn authority() -> Authority {
        Authority::new(&Zone::from_json(ZONE).unwrap()).unwrap()
    }

    fn ask(name: &str, qtype: u16) -> DnsMessage {
        authority().answer(&DnsMessage::query(42, name.parse().unwrap(), qtype))
    }

    #[test]
    fn test_a_answer() {
        let response = ask("Example.COM", record_type::A);
        assert_eq!(response.header.id, 42);
        assert!(response.header.qr && response.header.aa && response.header.rd);
        assert_eq!(response.header.rcode, rcode::NO_ERROR);
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].address(), Some(NetworkAddress::v4(93, 184, 216, 34)));
        assert_eq!(response.questions[0].name.to_string(), "example.com");
    }

    #[test]
    fn test_nxdomain_only_for_unknown_names() {
        assert_eq!(ask("nope.example.com", record_type::A).header.rcode, rcode::NXDOMAIN);
        let empty = ask("mail.example.com", record_type::MX);
        assert_eq!(empty.header.rcode, rcode::NO_ERROR);
        assert!(empty.answers.is_empty());
    }

    #[test]
    fn test_mx_and_ns_add_glue() {
        let mx = ask("example.com", record_type::MX);
        assert_eq!(mx.answers.len(), 1);
        assert_eq!(mx.additionals.len(), 1);
        assert_eq!(mx.additionals[0].address(), Some(NetworkAddress::v4(93, 184, 216, 40)));

        let ns = ask("example.com", record_type::NS);
        assert_eq!(ns.additionals[0].address(), Some(NetworkAddress::v4(93, 184, 216, 53)));
    }

    #[test]
    fn test_any_and_cname_chase() {
        let any = ask("example.com", record_type::ANY);
        assert_eq!(any.answers.len(), 4);

        let www = ask("www.example.com", record_type::A);
        assert_eq!(www.answers.len(), 2);
        assert_eq!(www.answers[0].rtype(), record_type::CNAME);
        assert_eq!(www.answers[1].address(), Some(NetworkAddress::v4(93, 184, 216, 34)));
    }

    #[test]
    fn test_bad_zone_rejected() {
        assert!(matches!(
            Zone::from_json(r#"{ "a": { "bad..name": ["1.2.3.4"] } }"#),
            Err(NetError::Config(_))
        ));
        assert!(Zone::from_json(r#"{ "a": { "x.com": ["1.2.3.4"] }, "cname": { "x.com": "y.com" } }"#).is_err());
    }

    #[test]
    fn test_unsupported_opcode() {
        let mut query = DnsMessage::query(1, "example.com".parse().unwrap(), record_type::A);
        query.header.opcode = 2;
        assert_eq!(authority().answer(&query).header.rcode, rcode::NOT_IMPLEMENTED);
    }
}
