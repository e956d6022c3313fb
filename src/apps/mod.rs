//! Protocol applications built only on the public socket API
//!
//! - DHCP server and client
//! - DNS authoritative server and resolver
//! - Ping and traceroute over ICMP echo
//! - UDP and TCP echo servers

pub mod dhcp_client;
pub mod dhcp_server;
pub mod dns_client;
pub mod dns_server;
pub mod echo;
pub mod ping;

pub use dhcp_client::{DhcpClient, DhcpLease};
pub use dhcp_server::{DhcpServer, DhcpServerConfig, LeasePool};
pub use dns_client::resolve;
pub use dns_server::{Authority, DnsServer, Zone};
pub use echo::{TcpEchoServer, UdpEchoServer};
pub use ping::{ping, traceroute, PingReport, TraceReport};
