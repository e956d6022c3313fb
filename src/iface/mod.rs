//! Hosts, interfaces and the simulated wire
//!
//! This module holds everything between a socket call and a frame on a segment:
//! - Addresses, interfaces and their capture logs
//! - Routing table with longest-prefix match and the ARP cache
//! - Per-host IPv4 input, forwarding and ICMP handling
//! - The virtual network that owns every host and pumps frames between them

pub mod arp;
pub mod host;
pub mod interface;
pub mod ip;
pub mod ipv4;
pub mod route;
pub mod stack;
pub mod virtual_network;

// Re-export commonly used items
pub use host::{EchoOptions, EchoReply, Host};
pub use interface::{CapturedFrame, IfIndex, InterfaceConfig, InterfaceInfo};
pub use ip::*;
pub use route::{RouteDevice, RouteEntry};
pub use stack::HostId;
pub use virtual_network::{SegmentId, VirtualNetwork};
