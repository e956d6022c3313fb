//! Socket multiplexer
//!
//! Every host owns one [`SocketTable`] holding its UDP endpoints, TCP
//! listeners and TCP connections. Applications hold small `Copy` handles;
//! the state behind them lives in the table, reachable only through the
//! [`Host`](crate::Host) API.
//!
//! Socket ids are issued from a counter and never reused. An id that was
//! issued but is no longer in the table belongs to a closed socket.

pub mod tcp;
pub mod udp;
pub(crate) mod waiter;

use crate::config::StackConfig;
use crate::error::{NetError, Result};
use crate::iface::ip::NetworkAddress;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

pub use tcp::{TcpConnInfo, TcpListenerInfo};
pub use udp::UdpSocketInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpSocketHandle {
    pub(crate) id: SocketId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpListenerHandle {
    pub(crate) id: SocketId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpConnHandle {
    pub(crate) id: SocketId,
}

macro_rules! handle_id {
    ($($handle:ty),*) => {
        $(impl $handle {
            pub fn id(&self) -> SocketId {
                self.id
            }
        })*
    };
}

handle_id!(UdpSocketHandle, TcpListenerHandle, TcpConnHandle);

/// An address/port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: NetworkAddress,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: NetworkAddress, port: u16) -> Self {
        Endpoint { addr, port }
    }

    /// Whether a socket bound here would clash with one bound at `other`.
    pub(crate) fn overlaps(&self, other: &Endpoint) -> bool {
        self.port == other.port
            && (self.addr == other.addr || self.addr.is_unspecified() || other.addr.is_unspecified())
    }

    /// Whether a socket bound here accepts traffic addressed to `dst:port`.
    pub(crate) fn accepts(&self, dst: &NetworkAddress, port: u16) -> bool {
        self.port == port && (self.addr.is_unspecified() || &self.addr == dst)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.is_unspecified() {
            write!(f, "*:{}", self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// A received UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub src_addr: NetworkAddress,
    pub src_port: u16,
    pub payload: Vec<u8>,
}

/// Result of a potentially blocking call taken under the state lock: either
/// already satisfied, or a receiver to await once the lock is released.
#[derive(Debug)]
pub(crate) enum Pending<T> {
    Ready(T),
    Wait(oneshot::Receiver<T>),
}

#[derive(Debug)]
pub(crate) struct SocketTable {
    next_id: u64,
    next_ephemeral: Option<u16>,
    pub(crate) udp: BTreeMap<SocketId, udp::UdpSocket>,
    pub(crate) listeners: BTreeMap<SocketId, tcp::TcpListener>,
    pub(crate) connections: BTreeMap<SocketId, tcp::TcpConnection>,
}

impl SocketTable {
    pub(crate) fn new() -> Self {
        SocketTable {
            next_id: 1,
            next_ephemeral: None,
            udp: BTreeMap::new(),
            listeners: BTreeMap::new(),
            connections: BTreeMap::new(),
        }
    }

    pub(crate) fn alloc_id(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Whether `id` was handed out by this table at some point.
    pub(crate) fn was_issued(&self, id: SocketId) -> bool {
        id.0 > 0 && id.0 < self.next_id
    }

    /// Error for an id that is not in the table: closed if it was ours, otherwise bogus.
    pub(crate) fn missing(&self, id: SocketId) -> NetError {
        if self.was_issued(id) {
            NetError::UseOfClosedSocket
        } else {
            NetError::InvalidArgument("unknown socket handle")
        }
    }

    pub(crate) fn udp_in_use(&self, local: &Endpoint) -> bool {
        self.udp.values().any(|s| s.local.overlaps(local))
    }

    pub(crate) fn tcp_in_use(&self, local: &Endpoint) -> bool {
        self.listeners.values().any(|l| !l.closed && l.local.overlaps(local))
            || self
                .connections
                .values()
                .any(|c| c.listener.is_none() && c.local.overlaps(local))
    }

    /// Pick a port from the ephemeral range that `in_use` rejects for no address.
    pub(crate) fn ephemeral_port(&mut self, config: &StackConfig, in_use: impl Fn(u16) -> bool) -> Result<u16> {
        let start = config.ephemeral_port_start;
        let end = config.ephemeral_port_end;
        let span = (end - start) as u32 + 1;
        let mut candidate = self.next_ephemeral.filter(|p| (start..=end).contains(p)).unwrap_or(start);
        for _ in 0..span {
            let port = candidate;
            candidate = if candidate == end { start } else { candidate + 1 };
            if !in_use(port) {
                self.next_ephemeral = Some(candidate);
                return Ok(port);
            }
        }
        Err(NetError::PortsExhausted)
    }
}

/// Bound a suspension point; elapsed time becomes [`NetError::Timeout`].
pub async fn with_timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| NetError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_overlap() {
        let any = Endpoint::new(NetworkAddress::UNSPECIFIED_V4, 53);
        let one = Endpoint::new(NetworkAddress::v4(10, 0, 0, 1), 53);
        let two = Endpoint::new(NetworkAddress::v4(10, 0, 0, 2), 53);
        assert!(any.overlaps(&one));
        assert!(!one.overlaps(&two));
        assert!(!one.overlaps(&Endpoint::new(NetworkAddress::v4(10, 0, 0, 1), 54)));
        assert!(any.accepts(&NetworkAddress::v4(1, 2, 3, 4), 53));
        assert!(!one.accepts(&NetworkAddress::v4(10, 0, 0, 2), 53));
    }

    #[test]
    fn test_ephemeral_rotation_and_exhaustion() {
        let config = StackConfig {
            ephemeral_port_start: 50000,
            ephemeral_port_end: 50002,
            ..StackConfig::default()
        };
        let mut table = SocketTable::new();
        assert_eq!(table.ephemeral_port(&config, |_| false).unwrap(), 50000);
        assert_eq!(table.ephemeral_port(&config, |_| false).unwrap(), 50001);
        assert_eq!(table.ephemeral_port(&config, |p| p == 50002).unwrap(), 50000);
        assert_eq!(
            table.ephemeral_port(&config, |_| true).unwrap_err(),
            NetError::PortsExhausted
        );
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut table = SocketTable::new();
        let a = table.alloc_id();
        let b = table.alloc_id();
        assert_ne!(a, b);
        assert!(table.was_issued(a));
        assert!(!table.was_issued(SocketId(99)));
        assert_eq!(table.missing(a), NetError::UseOfClosedSocket);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let never = std::future::pending::<()>();
        assert_eq!(
            with_timeout(Duration::from_millis(50), never).await,
            Err(NetError::Timeout)
        );
        assert_eq!(with_timeout(Duration::from_millis(50), async { 7 }).await, Ok(7));
    }
}
