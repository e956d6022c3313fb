//! Host handle: the socket, configuration and diagnostic API of one node.
//!
//! Every method takes the network lock for one synchronous state transition
//! and releases it before suspending. Blocking calls (`recv_*`, `accept_*`,
//! `connect_*`, `icmp_echo`) come in a plain form and a `_timeout` form.

use crate::capture::CaptureWriter;
use crate::error::{NetError, Result};
use crate::iface::arp::ArpEntry;
use crate::iface::interface::{CapturedFrame, IfIndex, InterfaceConfig, InterfaceInfo};
use crate::iface::ip::{AddressFamily, NetworkAddress};
use crate::iface::route::{RouteDevice, RouteEntry, RouteMatch};
use crate::iface::stack::{EchoEvent, Egress, HostId, HostState};
use crate::iface::virtual_network::{SegmentId, VirtualNetwork};
use crate::socket::{
    with_timeout, Datagram, Pending, SocketId, TcpConnHandle, TcpConnInfo, TcpListenerHandle, TcpListenerInfo,
    UdpSocketHandle, UdpSocketInfo,
};
use log::{debug, info};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Puts a value back on its socket.
type GiveBack<T> = fn(&mut HostState, SocketId, T, &mut Vec<Egress>);

/// Receiver of a blocked `recv`/`accept`. If the caller gives up after the
/// value was handed over but before it was polled, the value goes back to
/// the front of the socket's queue instead of being lost.
struct Reclaim<'a, T> {
    host: &'a Host,
    socket: SocketId,
    rx: Option<oneshot::Receiver<Option<T>>>,
    give_back: GiveBack<T>,
}

impl<T> Drop for Reclaim<'_, T> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        rx.close();
        if let Ok(Some(value)) = rx.try_recv() {
            let (socket, give_back) = (self.socket, self.give_back);
            let result = self.host.with_state(|host, out| {
                give_back(host, socket, value, out);
                Ok(())
            });
            if let Err(e) = result {
                debug!("socket {}: reclaiming abandoned value: {}", socket, e);
            }
        }
    }
}

/// Parameters of one ICMP echo probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoOptions {
    pub timeout: Duration,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
    /// Hop limit; `None` uses the stack's default TTL.
    pub ttl: Option<u8>,
}

impl Default for EchoOptions {
    fn default() -> Self {
        EchoOptions {
            timeout: Duration::from_millis(1000),
            identifier: 1,
            sequence: 1,
            payload: vec![0; 56],
            ttl: None,
        }
    }
}

/// Outcome of an echo probe that got an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    /// Size of the ICMP message received.
    pub bytes: usize,
    /// TTL of the answering packet.
    pub ttl: u8,
    pub time_ms: u64,
    /// Who answered: the destination, or the hop where the TTL ran out.
    pub from: Option<NetworkAddress>,
    /// `false` when the answer is a time-exceeded from a transit hop.
    pub reached: bool,
}

/// Handle to one host on a [`VirtualNetwork`]. Clones share the host.
#[derive(Debug, Clone)]
pub struct Host {
    net: VirtualNetwork,
    id: HostId,
}

impl Host {
    pub(crate) fn new(net: VirtualNetwork, id: HostId) -> Self {
        Host { net, id }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn network(&self) -> &VirtualNetwork {
        &self.net
    }

    pub fn name(&self) -> String {
        self.inspect(|h| h.name.clone())
    }

    /// Run one state transition on this host, then put its outbox on the wire.
    fn with_state<R>(&self, f: impl FnOnce(&mut HostState, &mut Vec<Egress>) -> Result<R>) -> Result<R> {
        let mut state = self.net.lock();
        let mut outbox = Vec::new();
        let result = f(state.host_mut(self.id)?, &mut outbox);
        state.transmit(self.id, outbox);
        result
    }

    /// Await a blocking socket call, reclaiming its value if the caller drops out.
    async fn wait_for<T>(&self, socket: SocketId, pending: Pending<Option<T>>, give_back: GiveBack<T>) -> Option<T> {
        let rx = match pending {
            Pending::Ready(value) => return value,
            Pending::Wait(rx) => rx,
        };
        let mut guard = Reclaim {
            host: self,
            socket,
            rx: Some(rx),
            give_back,
        };
        let value = match guard.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or(None),
            None => None,
        };
        guard.rx = None;
        value
    }

    fn inspect<R: Default>(&self, f: impl FnOnce(&HostState) -> R) -> R {
        let state = self.net.lock();
        state.host(self.id).map(f).unwrap_or_default()
    }

    // Topology

    /// Attach a new, unconfigured IPv4 interface to `segment`.
    pub fn add_interface(&self, name: &str, segment: SegmentId) -> Result<IfIndex> {
        self.add_interface_with_family(name, segment, AddressFamily::V4)
    }

    pub fn add_interface_with_family(&self, name: &str, segment: SegmentId, family: AddressFamily) -> Result<IfIndex> {
        self.net.lock().add_interface(self.id, name, segment, family)
    }

    pub fn set_link_state(&self, index: IfIndex, up: bool) -> Result<()> {
        self.with_state(|host, _| {
            let host_name = host.name.clone();
            let iface = host.interface_mut(index)?;
            iface.up = up;
            info!("{}: {} is {}", host_name, iface.name, if up { "up" } else { "down" });
            Ok(())
        })
    }

    /// Turn router behaviour on or off.
    pub fn set_forwarding(&self, enabled: bool) {
        let result = self.with_state(|host, _| {
            host.forwarding = enabled;
            info!("{}: forwarding {}", host.name, if enabled { "enabled" } else { "disabled" });
            Ok(())
        });
        if let Err(e) = result {
            debug!("set_forwarding on host {}: {}", self.id.0, e);
        }
    }

    // Configuration

    /// Replace an interface's address and prefix and rebuild its connected route.
    pub fn configure_interface(&self, index: IfIndex, config: InterfaceConfig) -> Result<()> {
        let mut state = self.net.lock();
        let (previous, mac) = state.host_mut(self.id)?.configure_interface(index, config)?;
        if !previous.address.is_unspecified() && previous.address != config.address {
            state.purge_arp(&previous.address, mac);
        }
        Ok(())
    }

    pub fn add_route(
        &self,
        destination: NetworkAddress,
        prefix_len: u8,
        device: RouteDevice,
        next_hop: Option<NetworkAddress>,
    ) -> Result<RouteEntry> {
        self.with_state(|host, _| {
            if let RouteDevice::Interface(index) = device {
                host.interface(index)?;
            }
            host.routes.add(destination, prefix_len, device, next_hop)
        })
    }

    /// Delete matching routes. Returns whether anything was removed.
    pub fn del_route(
        &self,
        destination: NetworkAddress,
        prefix_len: u8,
        device: RouteDevice,
        next_hop: Option<NetworkAddress>,
    ) -> bool {
        self.with_state(|host, _| Ok(host.routes.delete(destination, prefix_len, device, next_hop)))
            .unwrap_or(false)
    }

    /// The route `dst` would take, like `ip route get`.
    pub fn route_get(&self, dst: NetworkAddress) -> Result<RouteMatch> {
        let state = self.net.lock();
        let host = state.host(self.id)?;
        host.routes
            .lookup(&dst, |device| host.device_up(device))
            .ok_or(NetError::NoRoute)
    }

    // Introspection

    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.inspect(|h| h.interfaces.iter().map(|i| i.info()).collect())
    }

    pub fn interface(&self, index: IfIndex) -> Result<InterfaceInfo> {
        let state = self.net.lock();
        Ok(state.host(self.id)?.interface(index)?.info())
    }

    pub fn routing_table(&self) -> Vec<RouteEntry> {
        self.inspect(|h| h.routes.entries())
    }

    pub fn arp_table(&self) -> Vec<ArpEntry> {
        self.inspect(|h| {
            h.arp
                .entries(|index| h.interfaces.get(index as usize).map(|i| i.arp_generation))
        })
    }

    pub fn udp_sockets(&self) -> Vec<UdpSocketInfo> {
        self.inspect(|h| h.udp_sockets())
    }

    pub fn tcp_listeners(&self) -> Vec<TcpListenerInfo> {
        self.inspect(|h| h.tcp_listeners())
    }

    pub fn tcp_connections(&self) -> Vec<TcpConnInfo> {
        self.inspect(|h| h.tcp_connections())
    }

    /// Copy of the frames logged by an interface so far.
    pub fn captures(&self, index: IfIndex) -> Result<Vec<CapturedFrame>> {
        let state = self.net.lock();
        Ok(state.host(self.id)?.interface(index)?.captures().to_vec())
    }

    /// Serialize an interface's frame log as a pcap file without draining it.
    pub fn export_capture(&self, index: IfIndex) -> Result<Vec<u8>> {
        let state = self.net.lock();
        let writer = CaptureWriter::new(&state.config().capture);
        Ok(writer.write(state.host(self.id)?.interface(index)?.captures()))
    }

    // UDP

    /// Bind a UDP socket. Port 0 picks an ephemeral port.
    pub fn open_udp_socket(&self, addr: NetworkAddress, port: u16) -> Result<UdpSocketHandle> {
        self.with_state(|host, _| host.udp_open(addr, port))
            .map(|id| UdpSocketHandle { id })
    }

    /// Pin a socket to one interface for sending broadcasts and receiving.
    pub fn bind_udp_device(&self, socket: UdpSocketHandle, index: IfIndex) -> Result<()> {
        self.with_state(|host, _| host.udp_bind_device(socket.id, index))
    }

    /// Fire-and-forget send; a missing route is not an error.
    pub fn send_udp_socket(&self, socket: UdpSocketHandle, dst: NetworkAddress, port: u16, payload: &[u8]) -> Result<()> {
        self.with_state(|host, out| host.udp_send(socket.id, dst, port, payload, out))
    }

    /// Wait for the next datagram. `None` means the socket was closed.
    pub async fn recv_udp_socket(&self, socket: UdpSocketHandle) -> Result<Option<Datagram>> {
        let pending = self.with_state(|host, _| host.udp_recv(socket.id))?;
        Ok(self
            .wait_for(socket.id, pending, |host, id, datagram, _| host.udp_requeue(id, datagram))
            .await)
    }

    pub async fn recv_udp_socket_timeout(&self, socket: UdpSocketHandle, timeout: Duration) -> Result<Option<Datagram>> {
        with_timeout(timeout, self.recv_udp_socket(socket)).await?
    }

    pub fn close_udp_socket(&self, socket: UdpSocketHandle) -> Result<()> {
        self.with_state(|host, _| host.udp_close(socket.id))
    }

    // TCP

    pub fn open_tcp_server_socket(&self, addr: NetworkAddress, port: u16) -> Result<TcpListenerHandle> {
        self.with_state(|host, _| host.tcp_listen(addr, port))
            .map(|id| TcpListenerHandle { id })
    }

    /// Wait for the oldest completed connection. `None` means the listener closed.
    pub async fn accept_tcp_conn(&self, listener: TcpListenerHandle) -> Result<Option<TcpConnHandle>> {
        let pending = self.with_state(|host, _| host.tcp_accept(listener.id))?;
        let accepted = self
            .wait_for(listener.id, pending, |host, id, conn, out| host.tcp_requeue_accept(id, conn, out))
            .await;
        Ok(accepted.map(|id| TcpConnHandle { id }))
    }

    pub async fn accept_tcp_conn_timeout(
        &self,
        listener: TcpListenerHandle,
        timeout: Duration,
    ) -> Result<Option<TcpConnHandle>> {
        with_timeout(timeout, self.accept_tcp_conn(listener)).await?
    }

    pub fn close_tcp_listener(&self, listener: TcpListenerHandle) -> Result<()> {
        self.with_state(|host, _| host.tcp_close_listener(listener.id))
    }

    /// Open a connection, waiting up to the configured connect timeout.
    pub async fn connect_tcp_conn(&self, dst: NetworkAddress, port: u16) -> Result<TcpConnHandle> {
        let timeout = self.net.config().connect_timeout();
        self.connect_tcp_conn_timeout(dst, port, timeout).await
    }

    pub async fn connect_tcp_conn_timeout(&self, dst: NetworkAddress, port: u16, timeout: Duration) -> Result<TcpConnHandle> {
        let (id, rx) = self.with_state(|host, out| host.tcp_connect(dst, port, out))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(TcpConnHandle { id }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(NetError::ConnectionRefused),
            Err(_) => {
                self.with_state(|host, out| {
                    host.tcp_abort(id, out);
                    Ok(())
                })?;
                Err(NetError::Timeout)
            }
        }
    }

    pub fn send_tcp_conn(&self, conn: TcpConnHandle, data: &[u8]) -> Result<()> {
        self.with_state(|host, out| host.tcp_send(conn.id, data, out))
    }

    /// Wait for the next chunk of data. `None` means end-of-stream.
    pub async fn recv_tcp_conn(&self, conn: TcpConnHandle) -> Result<Option<Vec<u8>>> {
        let pending = self.with_state(|host, _| host.tcp_recv(conn.id))?;
        Ok(self
            .wait_for(conn.id, pending, |host, id, data, _| host.tcp_requeue_data(id, data))
            .await)
    }

    pub async fn recv_tcp_conn_timeout(&self, conn: TcpConnHandle, timeout: Duration) -> Result<Option<Vec<u8>>> {
        with_timeout(timeout, self.recv_tcp_conn(conn)).await?
    }

    pub fn close_tcp_conn(&self, conn: TcpConnHandle) -> Result<()> {
        self.with_state(|host, out| host.tcp_close(conn.id, out))
    }

    // Diagnostics

    /// Send one echo request and wait for its outcome.
    pub async fn icmp_echo(&self, dst: NetworkAddress, options: EchoOptions) -> Result<EchoReply> {
        let started = Instant::now();
        let key = (options.identifier, options.sequence);
        let rx = self.with_state(|host, out| {
            host.begin_echo(&dst, options.identifier, options.sequence, &options.payload, options.ttl, out)
        })?;
        let event = match tokio::time::timeout(options.timeout, rx).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => return Err(NetError::Timeout),
            Err(_) => {
                self.with_state(|host, _| {
                    host.cancel_echo(key);
                    Ok(())
                })?;
                return Err(NetError::Timeout);
            }
        };
        let time_ms = started.elapsed().as_millis() as u64;
        match event {
            EchoEvent::Reply { from, ttl, bytes } => Ok(EchoReply {
                bytes,
                ttl,
                time_ms,
                from: Some(from),
                reached: true,
            }),
            EchoEvent::TimeExceeded { from, ttl, bytes } => Ok(EchoReply {
                bytes,
                ttl,
                time_ms,
                from: Some(from),
                reached: false,
            }),
            EchoEvent::Unreachable { .. } => Err(NetError::NoRoute),
        }
    }
}
