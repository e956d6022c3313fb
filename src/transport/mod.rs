//! Transport header codecs
//!
//! Wire formats only. Connection and socket state lives in [`crate::socket`].

pub mod tcp;
pub mod udp;

// Re-export commonly used items
pub use tcp::{TcpHeader, TcpSegment, TcpState};
pub use udp::{UdpHeader, UdpUtils};
