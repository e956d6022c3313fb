//! A simulated in-process IP network for teaching
//!
//! This library runs real client and server logic against a software wire:
//! - Interfaces, routing with longest-prefix match, ARP and IPv4 forwarding
//! - ICMP echo, time exceeded and destination unreachable
//! - UDP and TCP sockets with async blocking calls over tokio
//! - DHCP and DNS message codecs built on a shared option framework
//! - pcap export of every interface's frame log
//! - Small protocol apps: DHCP and DNS servers and clients, ping, traceroute, echo

pub mod apps;
pub mod capture;
pub mod config;
pub mod error;
pub mod iface;
pub mod network;
pub mod pdu;
pub mod socket;
pub mod transport;

// Re-export commonly used types
pub use config::{CaptureConfig, StackConfig};
pub use error::{NetError, Result};
pub use iface::host::{EchoOptions, EchoReply, Host};
pub use iface::interface::{CapturedFrame, IfIndex, InterfaceConfig, InterfaceInfo};
pub use iface::ip::{AddressFamily, NetworkAddress};
pub use iface::route::{RouteDevice, RouteEntry, RouteMatch};
pub use iface::stack::HostId;
pub use iface::virtual_network::{SegmentId, VirtualNetwork};
pub use network::ethernet::MacAddr;
pub use pdu::Pdu;
pub use socket::{with_timeout, Datagram, SocketId, TcpConnHandle, TcpListenerHandle, UdpSocketHandle};
