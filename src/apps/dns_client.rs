//! Stub resolver: one question, id-matched answers, bounded retries.

use crate::error::{NetError, Result};
use crate::iface::host::Host;
use crate::iface::ip::NetworkAddress;
use crate::pdu::dns::{DnsMessage, DnsName, DNS_PORT};
use crate::pdu::Pdu;
use crate::socket::UdpSocketHandle;
use log::{debug, warn};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const DNS_ATTEMPTS: usize = 2;

static NEXT_QUERY_ID: AtomicU16 = AtomicU16::new(0x2A00);

/// Ask `server` for `name`/`qtype` and return its response. Each attempt
/// waits up to `timeout`; the socket is closed on every path.
pub async fn resolve(
    host: &Host,
    server: NetworkAddress,
    name: &str,
    qtype: u16,
    timeout: Duration,
) -> Result<DnsMessage> {
    let name: DnsName = name.parse()?;
    let socket = host.open_udp_socket(NetworkAddress::UNSPECIFIED_V4, 0)?;
    let result = exchange(host, socket, server, &name, qtype, timeout).await;
    if let Err(e) = host.close_udp_socket(socket) {
        debug!("resolver: closing socket: {}", e);
    }
    result
}

async fn exchange(
    host: &Host,
    socket: UdpSocketHandle,
    server: NetworkAddress,
    name: &DnsName,
    qtype: u16,
    timeout: Duration,
) -> Result<DnsMessage> {
    for attempt in 1..=DNS_ATTEMPTS {
        let id = NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed);
        let query = DnsMessage::query(id, name.clone(), qtype);
        host.send_udp_socket(socket, server, DNS_PORT, &query.encode())?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let datagram = match host.recv_udp_socket_timeout(socket, remaining).await {
                Ok(Some(datagram)) => datagram,
                Ok(None) => return Err(NetError::UseOfClosedSocket),
                Err(NetError::Timeout) => break,
                Err(e) => return Err(e),
            };
            if datagram.src_addr != server || datagram.src_port != DNS_PORT {
                continue;
            }
            match DnsMessage::decode(&datagram.payload) {
                Ok(response) if response.header.qr && response.header.id == id => return Ok(response),
                Ok(response) => debug!("resolver: ignoring response id {}", response.header.id),
                Err(e) => warn!("resolver: malformed response from {}: {}", server, e),
            }
        }
        debug!("resolver: attempt {} for {} timed out", attempt, name);
    }
    Err(NetError::Timeout)
}
