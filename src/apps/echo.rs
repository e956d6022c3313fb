//! Echo services: UDP port 7 and a TCP echo listener.

use crate::error::Result;
use crate::iface::host::Host;
use crate::iface::ip::NetworkAddress;
use crate::socket::{TcpConnHandle, TcpListenerHandle, UdpSocketHandle};
use log::{debug, info, warn};

pub const ECHO_PORT: u16 = 7;

pub struct UdpEchoServer {
    host: Host,
    socket: UdpSocketHandle,
}

impl UdpEchoServer {
    pub fn bind(host: Host, addr: NetworkAddress, port: u16) -> Result<Self> {
        let socket = host.open_udp_socket(addr, port)?;
        Ok(UdpEchoServer { host, socket })
    }

    /// Closing this socket stops `serve`.
    pub fn socket(&self) -> UdpSocketHandle {
        self.socket
    }

    /// Send every datagram back to its source. Returns how many were echoed.
    pub async fn serve(&self) -> Result<u64> {
        let mut echoed = 0;
        while let Some(datagram) = self.host.recv_udp_socket(self.socket).await? {
            self.host
                .send_udp_socket(self.socket, datagram.src_addr, datagram.src_port, &datagram.payload)?;
            echoed += 1;
        }
        info!("udp echo on {} stopped after {} datagrams", self.host.name(), echoed);
        Ok(echoed)
    }
}

pub struct TcpEchoServer {
    host: Host,
    listener: TcpListenerHandle,
}

impl TcpEchoServer {
    pub fn bind(host: Host, addr: NetworkAddress, port: u16) -> Result<Self> {
        let listener = host.open_tcp_server_socket(addr, port)?;
        Ok(TcpEchoServer { host, listener })
    }

    /// Closing this listener stops `serve`.
    pub fn listener(&self) -> TcpListenerHandle {
        self.listener
    }

    /// Accept connections until the listener closes, echoing each on its own task.
    pub async fn serve(&self) -> Result<()> {
        while let Some(conn) = self.host.accept_tcp_conn(self.listener).await? {
            let host = self.host.clone();
            tokio::spawn(async move {
                if let Err(e) = echo_connection(&host, conn).await {
                    warn!("tcp echo {}: {}", conn.id(), e);
                }
            });
        }
        info!("tcp echo on {} stopped", self.host.name());
        Ok(())
    }
}

/// Echo one stream until the peer closes, then close our side.
pub async fn echo_connection(host: &Host, conn: TcpConnHandle) -> Result<usize> {
    let mut total = 0;
    while let Some(data) = host.recv_tcp_conn(conn).await? {
        total += data.len();
        host.send_tcp_conn(conn, &data)?;
    }
    debug!("tcp echo {}: peer closed after {} bytes", conn.id(), total);
    host.close_tcp_conn(conn)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::virtual_network::VirtualNetwork;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_udp_echo_over_loopback() {
        let net = VirtualNetwork::new();
        let host = net.add_host("a");
        let server = UdpEchoServer::bind(host.clone(), NetworkAddress::UNSPECIFIED_V4, ECHO_PORT).unwrap();
        let socket = server.socket();
        let task = tokio::spawn(async move { server.serve().await });

        let client = host.open_udp_socket(NetworkAddress::UNSPECIFIED_V4, 0).unwrap();
        host.send_udp_socket(client, NetworkAddress::LOOPBACK_V4, ECHO_PORT, b"ping").unwrap();
        let reply = host
            .recv_udp_socket_timeout(client, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.payload, b"ping");
        assert_eq!(reply.src_port, ECHO_PORT);

        host.close_udp_socket(socket).unwrap();
        assert_eq!(task.await.unwrap(), Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_echo_over_loopback() {
        let net = VirtualNetwork::new();
        let host = net.add_host("a");
        let server = TcpEchoServer::bind(host.clone(), NetworkAddress::UNSPECIFIED_V4, 7007).unwrap();
        let listener = server.listener();
        let task = tokio::spawn(async move { server.serve().await });

        let conn = host.connect_tcp_conn(NetworkAddress::LOOPBACK_V4, 7007).await.unwrap();
        host.send_tcp_conn(conn, b"hello").unwrap();
        let echoed = host.recv_tcp_conn_timeout(conn, Duration::from_secs(1)).await.unwrap();
        assert_eq!(echoed.as_deref(), Some(&b"hello"[..]));

        host.close_tcp_conn(conn).unwrap();
        host.close_tcp_listener(listener).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }
}
