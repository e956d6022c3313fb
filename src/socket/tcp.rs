//! TCP listeners and connections
//!
//! Connections exchange real segments over the simulated wire. The wire never
//! loses or reorders frames, so there is no retransmission timer and no
//! window management: every data segment is acknowledged by a pure ACK and
//! an out-of-sequence segment is simply ignored.

use crate::error::{NetError, Result};
use crate::iface::ip::NetworkAddress;
use crate::iface::stack::{Egress, HostState};
use crate::network::icmp::QuotedTransport;
use crate::network::ipv4::protocol;
use crate::socket::waiter::Waiter;
use crate::socket::{Endpoint, Pending, SocketId};
use crate::transport::tcp::{flags, TcpHeader, TcpSegment, TcpState, TCP_MSS};
use log::{debug, info};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use tokio::sync::oneshot;

#[derive(Debug)]
pub(crate) struct TcpListener {
    pub local: Endpoint,
    pub closed: bool,
    accept_queue: VecDeque<SocketId>,
    waiter: Waiter<Option<SocketId>>,
}

impl TcpListener {
    fn new(local: Endpoint) -> Self {
        TcpListener {
            local,
            closed: false,
            accept_queue: VecDeque::new(),
            waiter: Waiter::new(),
        }
    }

    /// Hand a completed connection to the waiting acceptor, or queue it.
    fn enqueue(&mut self, conn: SocketId) {
        if self.accept_queue.is_empty() && self.waiter.wake(Some(conn)).is_ok() {
            return;
        }
        self.accept_queue.push_back(conn);
    }
}

/// What the host must do after a connection consumed a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    None,
    /// Passive open completed; move to the listener's accept queue.
    Accepted,
    /// Drop the connection from the table.
    Discard,
}

#[derive(Debug)]
pub(crate) struct TcpConnection {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub state: TcpState,
    /// Listener that spawned this connection (passive opens only).
    pub listener: Option<SocketId>,
    snd_nxt: u32,
    rcv_nxt: u32,
    recv_queue: VecDeque<Vec<u8>>,
    recv_waiter: Waiter<Option<Vec<u8>>>,
    connect_waiter: Waiter<Result<()>>,
}

impl TcpConnection {
    fn with_state(local: Endpoint, remote: Endpoint, state: TcpState, iss: u32) -> Self {
        TcpConnection {
            local,
            remote,
            state,
            listener: None,
            snd_nxt: iss,
            rcv_nxt: 0,
            recv_queue: VecDeque::new(),
            recv_waiter: Waiter::new(),
            connect_waiter: Waiter::new(),
        }
    }

    /// Active open: returns the connection in SYN-SENT and its SYN.
    pub(crate) fn connect(local: Endpoint, remote: Endpoint, iss: u32) -> (Self, TcpSegment) {
        let mut conn = Self::with_state(local, remote, TcpState::SynSent, iss);
        let syn = conn.segment(flags::SYN, Vec::new());
        conn.snd_nxt = iss.wrapping_add(1);
        (conn, syn)
    }

    /// Passive open from a listener: returns the connection in SYN-RECEIVED and its SYN|ACK.
    pub(crate) fn from_syn(
        local: Endpoint,
        remote: Endpoint,
        syn: &TcpHeader,
        iss: u32,
        listener: SocketId,
    ) -> (Self, TcpSegment) {
        let mut conn = Self::with_state(local, remote, TcpState::SynReceived, iss);
        conn.listener = Some(listener);
        conn.rcv_nxt = syn.seq_number.wrapping_add(1);
        let syn_ack = conn.segment(flags::SYN | flags::ACK, Vec::new());
        conn.snd_nxt = iss.wrapping_add(1);
        (conn, syn_ack)
    }

    fn segment(&self, flag_bits: u16, payload: Vec<u8>) -> TcpSegment {
        TcpSegment {
            header: TcpHeader::new(self.local.port, self.remote.port, self.snd_nxt, self.rcv_nxt, flag_bits),
            payload,
        }
    }

    fn push_data(&mut self, data: Vec<u8>) {
        if self.recv_queue.is_empty() {
            match self.recv_waiter.wake(Some(data)) {
                Ok(()) => return,
                Err(Some(data)) => self.recv_queue.push_back(data),
                Err(None) => {}
            }
        } else {
            self.recv_queue.push_back(data);
        }
    }

    /// Signal end-of-stream to a reader blocked on an empty queue.
    fn wake_eof(&mut self) {
        if self.recv_queue.is_empty() && self.recv_waiter.wake(None).is_ok() {
            self.state = TcpState::Closed;
        }
    }

    pub(crate) fn on_segment(&mut self, seg: &TcpSegment) -> (Vec<TcpSegment>, ConnEvent) {
        let header = &seg.header;
        match self.state {
            TcpState::SynSent => {
                if header.is_rst() {
                    if header.is_ack() && header.ack_number == self.snd_nxt {
                        self.state = TcpState::Closed;
                        let _ = self.connect_waiter.wake(Err(NetError::ConnectionRefused));
                        return (Vec::new(), ConnEvent::Discard);
                    }
                    return (Vec::new(), ConnEvent::None);
                }
                if header.is_syn() && header.is_ack() && header.ack_number == self.snd_nxt {
                    self.rcv_nxt = header.seq_number.wrapping_add(1);
                    self.state = TcpState::Established;
                    if self.connect_waiter.wake(Ok(())).is_err() {
                        debug!("tcp: {} -> {} handshake completed after caller gave up", self.local, self.remote);
                        self.state = TcpState::Closed;
                        return (vec![self.segment(flags::RST, Vec::new())], ConnEvent::Discard);
                    }
                    return (vec![self.segment(flags::ACK, Vec::new())], ConnEvent::None);
                }
                (Vec::new(), ConnEvent::None)
            }
            TcpState::SynReceived => {
                if header.is_rst() {
                    self.state = TcpState::Closed;
                    return (Vec::new(), ConnEvent::Discard);
                }
                if header.is_ack() && !header.is_syn() && header.ack_number == self.snd_nxt {
                    self.state = TcpState::Established;
                    return (Vec::new(), ConnEvent::Accepted);
                }
                (Vec::new(), ConnEvent::None)
            }
            TcpState::Established | TcpState::CloseWait => {
                if header.is_rst() {
                    debug!("tcp: {} reset by {}", self.local, self.remote);
                    self.state = TcpState::CloseWait;
                    self.wake_eof();
                    return (Vec::new(), ConnEvent::None);
                }
                if header.seq_number != self.rcv_nxt {
                    debug!(
                        "tcp: {} out-of-sequence segment (seq {} expected {})",
                        self.local, header.seq_number, self.rcv_nxt
                    );
                    return (Vec::new(), ConnEvent::None);
                }
                if self.state == TcpState::CloseWait {
                    return (Vec::new(), ConnEvent::None);
                }
                let mut acknowledge = false;
                if !seg.payload.is_empty() {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(seg.payload.len() as u32);
                    self.push_data(seg.payload.clone());
                    acknowledge = true;
                }
                if header.is_fin() {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                    self.state = TcpState::CloseWait;
                    debug!("tcp: {} peer {} closed", self.local, self.remote);
                    self.wake_eof();
                    acknowledge = true;
                }
                if acknowledge {
                    (vec![self.segment(flags::ACK, Vec::new())], ConnEvent::None)
                } else {
                    (Vec::new(), ConnEvent::None)
                }
            }
            TcpState::Listen | TcpState::Closed => (Vec::new(), ConnEvent::None),
        }
    }

    /// Split `data` into MSS-sized data segments.
    pub(crate) fn send(&mut self, data: &[u8]) -> Result<Vec<TcpSegment>> {
        if self.state != TcpState::Established {
            return Err(NetError::NotConnected);
        }
        let mut segments = Vec::new();
        for chunk in data.chunks(TCP_MSS) {
            segments.push(self.segment(flags::PSH | flags::ACK, chunk.to_vec()));
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk.len() as u32);
        }
        Ok(segments)
    }

    pub(crate) fn recv(&mut self) -> Result<Pending<Option<Vec<u8>>>> {
        if let Some(data) = self.recv_queue.pop_front() {
            return Ok(Pending::Ready(Some(data)));
        }
        match self.state {
            TcpState::CloseWait | TcpState::Closed => {
                self.state = TcpState::Closed;
                Ok(Pending::Ready(None))
            }
            TcpState::Established => Ok(Pending::Wait(self.recv_waiter.arm()?)),
            _ => Err(NetError::NotConnected),
        }
    }

    /// Orderly close: FIN if the connection is synchronized, RST otherwise.
    pub(crate) fn close(&mut self) -> Vec<TcpSegment> {
        let segments = match self.state {
            TcpState::Established | TcpState::CloseWait => {
                let fin = self.segment(flags::FIN | flags::ACK, Vec::new());
                self.snd_nxt = self.snd_nxt.wrapping_add(1);
                vec![fin]
            }
            TcpState::SynSent | TcpState::SynReceived => vec![self.segment(flags::RST, Vec::new())],
            TcpState::Listen | TcpState::Closed => Vec::new(),
        };
        self.state = TcpState::Closed;
        let _ = self.recv_waiter.wake(None);
        segments
    }

    /// Abortive close: RST unless already closed.
    pub(crate) fn abort(&mut self) -> Vec<TcpSegment> {
        let segments = if self.state == TcpState::Closed {
            Vec::new()
        } else {
            vec![self.segment(flags::RST | flags::ACK, Vec::new())]
        };
        self.state = TcpState::Closed;
        let _ = self.recv_waiter.wake(None);
        segments
    }

    fn matches(&self, local: &NetworkAddress, local_port: u16, remote: &NetworkAddress, remote_port: u16) -> bool {
        self.local.port == local_port
            && self.remote.port == remote_port
            && &self.remote.addr == remote
            && &self.local.addr == local
    }

    fn info(&self, id: SocketId) -> TcpConnInfo {
        TcpConnInfo {
            id,
            state: self.state,
            local: self.local,
            remote: self.remote,
            queued: self.recv_queue.iter().map(Vec::len).sum(),
        }
    }
}

/// Snapshot of a listener for `ss -lt`-style listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpListenerInfo {
    pub id: SocketId,
    pub local: Endpoint,
    pub pending: usize,
    pub backlog: usize,
}

impl fmt::Display for TcpListenerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LISTEN {:>6} {:>6} {} *:*", self.pending, self.backlog, self.local)
    }
}

/// Snapshot of a connection for `ss -t`-style listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConnInfo {
    pub id: SocketId,
    pub state: TcpState,
    pub local: Endpoint,
    pub remote: Endpoint,
    /// Bytes received but not yet read.
    pub queued: usize,
}

impl fmt::Display for TcpConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<10} {:>6} {:>6} {} {}", self.state.to_string(), self.queued, 0, self.local, self.remote)
    }
}

impl HostState {
    pub(crate) fn tcp_listen(&mut self, addr: NetworkAddress, port: u16) -> Result<SocketId> {
        self.check_bind_address(&addr)?;
        if port == 0 {
            return Err(NetError::InvalidArgument("listening port 0"));
        }
        let local = Endpoint::new(addr, port);
        if self.sockets.tcp_in_use(&local) {
            return Err(NetError::AddressInUse);
        }
        let id = self.sockets.alloc_id();
        self.sockets.listeners.insert(id, TcpListener::new(local));
        info!("{}: tcp listener {} on {}", self.name, id, local);
        Ok(id)
    }

    pub(crate) fn tcp_accept(&mut self, id: SocketId) -> Result<Pending<Option<SocketId>>> {
        let Some(listener) = self.sockets.listeners.get_mut(&id) else {
            return if self.sockets.was_issued(id) {
                Ok(Pending::Ready(None))
            } else {
                Err(self.sockets.missing(id))
            };
        };
        if let Some(conn) = listener.accept_queue.pop_front() {
            if listener.closed && listener.accept_queue.is_empty() {
                self.sockets.listeners.remove(&id);
            }
            return Ok(Pending::Ready(Some(conn)));
        }
        if listener.closed {
            self.sockets.listeners.remove(&id);
            return Ok(Pending::Ready(None));
        }
        Ok(Pending::Wait(listener.waiter.arm()?))
    }

    /// Return an accepted connection whose acceptor gave up. If the listener
    /// is gone meanwhile, nobody can accept it and it is reset.
    pub(crate) fn tcp_requeue_accept(&mut self, id: SocketId, conn: SocketId, out: &mut Vec<Egress>) {
        match self.sockets.listeners.get_mut(&id) {
            Some(listener) => listener.accept_queue.push_front(conn),
            None => self.tcp_abort(conn, out),
        }
    }

    /// Return data whose reader gave up to the head of the receive queue.
    pub(crate) fn tcp_requeue_data(&mut self, id: SocketId, data: Vec<u8>) {
        match self.sockets.connections.get_mut(&id) {
            Some(conn) => conn.recv_queue.push_front(data),
            None => debug!("{}: tcp {} closed, {} bytes discarded", self.name, id, data.len()),
        }
    }

    /// Stop accepting. Queued connections stay acceptable until drained.
    pub(crate) fn tcp_close_listener(&mut self, id: SocketId) -> Result<()> {
        let missing = self.sockets.missing(id);
        let listener = self.sockets.listeners.get_mut(&id).ok_or(missing)?;
        if listener.closed {
            return Err(NetError::UseOfClosedSocket);
        }
        listener.closed = true;
        let _ = listener.waiter.wake(None);
        let drained = listener.accept_queue.is_empty();
        info!(
            "{}: tcp listener {} on {} closed ({} queued)",
            self.name,
            id,
            listener.local,
            listener.accept_queue.len()
        );
        if drained {
            self.sockets.listeners.remove(&id);
        }
        Ok(())
    }

    /// Start an active open. The receiver resolves when the handshake ends.
    pub(crate) fn tcp_connect(
        &mut self,
        dst: NetworkAddress,
        port: u16,
        out: &mut Vec<Egress>,
    ) -> Result<(SocketId, oneshot::Receiver<Result<()>>)> {
        if port == 0 {
            return Err(NetError::InvalidArgument("destination port 0"));
        }
        if dst.is_limited_broadcast() || dst.is_unspecified() {
            return Err(NetError::InvalidAddress(format!("cannot connect to {}", dst)));
        }
        let path = self
            .output_paths(&dst, None, None)?
            .into_iter()
            .next()
            .ok_or(NetError::NoRoute)?;
        let local_addr = NetworkAddress::V4(path.src);
        let taken: HashSet<u16> = self
            .sockets
            .listeners
            .values()
            .map(|l| l.local.port)
            .chain(self.sockets.connections.values().map(|c| c.local.port))
            .collect();
        let local_port = self.sockets.ephemeral_port(&self.config, |p| taken.contains(&p))?;
        let local = Endpoint::new(local_addr, local_port);
        let remote = Endpoint::new(dst, port);

        let iss = self.next_iss();
        let (mut conn, syn) = TcpConnection::connect(local, remote, iss);
        let rx = conn.connect_waiter.arm()?;
        let id = self.sockets.alloc_id();
        self.sockets.connections.insert(id, conn);
        debug!("{}: tcp {} connecting {} -> {}", self.name, id, local, remote);
        self.tcp_output(local, remote, vec![syn], out);
        Ok((id, rx))
    }

    /// A router reported our SYN undeliverable: fail the pending connect.
    /// Errors quoting synchronized connections are ignored.
    pub(crate) fn tcp_icmp_error(&mut self, flow: &QuotedTransport, msg_type: u8) {
        let local = NetworkAddress::V4(flow.src_addr);
        let remote = NetworkAddress::V4(flow.dst_addr);
        let found = self
            .sockets
            .connections
            .iter()
            .find(|(_, c)| c.state == TcpState::SynSent && c.matches(&local, flow.src_port, &remote, flow.dst_port))
            .map(|(id, _)| *id);
        let Some(id) = found else {
            return;
        };
        if let Some(mut conn) = self.sockets.connections.remove(&id) {
            conn.state = TcpState::Closed;
            if conn.connect_waiter.wake(Err(NetError::NoRoute)).is_err() {
                debug!("{}: tcp {} unreachable after caller gave up", self.name, id);
            }
            info!("{}: tcp {} -> {} failed, ICMP type {}", self.name, id, conn.remote, msg_type);
        }
    }

    /// Drop a connection whose opener gave up.
    pub(crate) fn tcp_abort(&mut self, id: SocketId, out: &mut Vec<Egress>) {
        if let Some(mut conn) = self.sockets.connections.remove(&id) {
            let segments = conn.abort();
            self.tcp_output(conn.local, conn.remote, segments, out);
            debug!("{}: tcp {} aborted", self.name, id);
        }
    }

    pub(crate) fn tcp_send(&mut self, id: SocketId, data: &[u8], out: &mut Vec<Egress>) -> Result<()> {
        let missing = self.sockets.missing(id);
        let conn = self.sockets.connections.get_mut(&id).ok_or(missing)?;
        let segments = conn.send(data)?;
        let (local, remote) = (conn.local, conn.remote);
        self.tcp_output(local, remote, segments, out);
        Ok(())
    }

    pub(crate) fn tcp_recv(&mut self, id: SocketId) -> Result<Pending<Option<Vec<u8>>>> {
        if let Some(conn) = self.sockets.connections.get_mut(&id) {
            return conn.recv();
        }
        if self.sockets.was_issued(id) {
            Ok(Pending::Ready(None))
        } else {
            Err(self.sockets.missing(id))
        }
    }

    pub(crate) fn tcp_close(&mut self, id: SocketId, out: &mut Vec<Egress>) -> Result<()> {
        let mut conn = self
            .sockets
            .connections
            .remove(&id)
            .ok_or_else(|| self.sockets.missing(id))?;
        let segments = conn.close();
        info!("{}: tcp {} {} -> {} closed", self.name, id, conn.local, conn.remote);
        self.tcp_output(conn.local, conn.remote, segments, out);
        Ok(())
    }

    pub(crate) fn tcp_listeners(&self) -> Vec<TcpListenerInfo> {
        let backlog = self.config.tcp_backlog;
        self.sockets
            .listeners
            .iter()
            .filter(|(_, l)| !l.closed)
            .map(|(id, l)| TcpListenerInfo {
                id: *id,
                local: l.local,
                pending: l.accept_queue.len(),
                backlog,
            })
            .collect()
    }

    pub(crate) fn tcp_connections(&self) -> Vec<TcpConnInfo> {
        self.sockets.connections.iter().map(|(id, c)| c.info(*id)).collect()
    }

    fn tcp_output(&mut self, local: Endpoint, remote: Endpoint, segments: Vec<TcpSegment>, out: &mut Vec<Egress>) {
        if segments.is_empty() {
            return;
        }
        let Ok(dst) = remote.addr.require_v4() else {
            return;
        };
        let path = match self.output_paths(&remote.addr, Some(local.addr), None) {
            Ok(paths) => paths.into_iter().next(),
            Err(e) => {
                debug!("{}: tcp {} -> {} unroutable: {}", self.name, local, remote, e);
                None
            }
        };
        let Some(path) = path else {
            return;
        };
        let ttl = self.config.default_ttl;
        for segment in segments {
            let bytes = segment.to_bytes(path.src, dst);
            self.emit_ipv4(&path, dst, protocol::TCP, ttl, &bytes, out);
        }
    }

    fn reset_for(&mut self, local: Endpoint, remote: Endpoint, seq: u32, ack: u32, out: &mut Vec<Egress>) {
        let rst = TcpSegment {
            header: TcpHeader::new(local.port, remote.port, seq, ack, flags::RST | flags::ACK),
            payload: Vec::new(),
        };
        self.tcp_output(local, remote, vec![rst], out);
    }

    /// Handle an inbound segment addressed to this host.
    pub(crate) fn tcp_input(&mut self, src: NetworkAddress, dst: NetworkAddress, bytes: &[u8], out: &mut Vec<Egress>) {
        let (Some(src4), Some(dst4)) = (src.octets_v4(), dst.octets_v4()) else {
            return;
        };
        let seg = match TcpSegment::parse(src4, dst4, bytes) {
            Ok(seg) => seg,
            Err(e) => {
                debug!("{}: tcp segment from {} dropped: {}", self.name, src, e);
                return;
            }
        };
        let header = seg.header;
        let local = Endpoint::new(dst, header.dst_port);
        let remote = Endpoint::new(src, header.src_port);

        let existing = self
            .sockets
            .connections
            .iter()
            .find(|(_, c)| c.matches(&dst, header.dst_port, &src, header.src_port))
            .map(|(id, _)| *id);
        if let Some(id) = existing {
            let Some(conn) = self.sockets.connections.get_mut(&id) else {
                return;
            };
            let (replies, event) = conn.on_segment(&seg);
            let listener = conn.listener;
            self.tcp_output(local, remote, replies, out);
            match event {
                ConnEvent::None => {}
                ConnEvent::Discard => {
                    self.sockets.connections.remove(&id);
                }
                ConnEvent::Accepted => self.tcp_enqueue_accept(listener, id, out),
            }
            return;
        }

        if header.is_syn() && !header.is_ack() {
            let listener = self
                .sockets
                .listeners
                .iter()
                .filter(|(_, l)| !l.closed && l.local.accepts(&dst, header.dst_port))
                .max_by_key(|(_, l)| !l.local.addr.is_unspecified())
                .map(|(id, _)| *id);
            let Some(listener) = listener else {
                debug!("{}: tcp SYN to {} refused", self.name, local);
                self.reset_for(local, remote, 0, header.seq_number.wrapping_add(1), out);
                return;
            };
            let backlog = self.config.tcp_backlog;
            let queued = self.sockets.listeners.get(&listener).map_or(0, |l| l.accept_queue.len());
            let half_open = self
                .sockets
                .connections
                .values()
                .filter(|c| c.listener == Some(listener) && c.state == TcpState::SynReceived)
                .count();
            if queued + half_open >= backlog {
                debug!("{}: tcp backlog of {} full, SYN from {} dropped", self.name, local, remote);
                return;
            }
            let iss = self.next_iss();
            let (conn, syn_ack) = TcpConnection::from_syn(local, remote, &header, iss, listener);
            let id = self.sockets.alloc_id();
            self.sockets.connections.insert(id, conn);
            debug!("{}: tcp {} SYN-RECEIVED {} <- {}", self.name, id, local, remote);
            self.tcp_output(local, remote, vec![syn_ack], out);
            return;
        }

        // Pure ACK/FIN/RST for a connection that is gone are absorbed quietly.
        if !header.is_rst() && !seg.payload.is_empty() {
            debug!("{}: tcp data for unknown {} <- {}, resetting", self.name, local, remote);
            self.reset_for(local, remote, header.ack_number, header.seq_number.wrapping_add(seg.seq_len()), out);
        }
    }

    fn tcp_enqueue_accept(&mut self, listener: Option<SocketId>, conn: SocketId, out: &mut Vec<Egress>) {
        let open = listener.and_then(|id| self.sockets.listeners.get_mut(&id)).filter(|l| !l.closed);
        match open {
            Some(l) => {
                debug!("tcp: {} established, queued on {}", conn, l.local);
                l.enqueue(conn);
            }
            None => {
                debug!("{}: tcp {} completed after its listener closed", self.name, conn);
                self.tcp_abort(conn, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> (Endpoint, Endpoint) {
        (
            Endpoint::new(NetworkAddress::v4(10, 0, 0, 1), 50000),
            Endpoint::new(NetworkAddress::v4(10, 0, 0, 2), 80),
        )
    }

    /// Run the three-way handshake between two in-memory endpoints.
    fn handshake() -> (TcpConnection, TcpConnection, oneshot::Receiver<Result<()>>) {
        let (client_ep, server_ep) = endpoints();
        let (mut client, syn) = TcpConnection::connect(client_ep, server_ep, 100);
        let rx = client.connect_waiter.arm().unwrap();
        let (mut server, syn_ack) = TcpConnection::from_syn(server_ep, client_ep, &syn.header, 900, SocketId(1));
        assert_eq!(server.state, TcpState::SynReceived);

        let (replies, event) = client.on_segment(&syn_ack);
        assert_eq!(event, ConnEvent::None);
        assert_eq!(client.state, TcpState::Established);
        let (_, event) = server.on_segment(&replies[0]);
        assert_eq!(event, ConnEvent::Accepted);
        assert_eq!(server.state, TcpState::Established);
        (client, server, rx)
    }

    #[tokio::test]
    async fn test_handshake_resolves_connect() {
        let (_, _, rx) = handshake();
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[test]
    fn test_data_is_chunked_and_fifo() {
        let (mut client, mut server, _rx) = handshake();
        let big = vec![7u8; TCP_MSS + 10];
        let segments = client.send(&big).unwrap();
        assert_eq!(segments.len(), 2);
        for seg in &segments {
            let (acks, _) = server.on_segment(seg);
            assert_eq!(acks.len(), 1);
            assert!(acks[0].header.is_ack());
        }
        match server.recv().unwrap() {
            Pending::Ready(Some(data)) => assert_eq!(data.len(), TCP_MSS),
            other => panic!("unexpected {:?}", other),
        }
        match server.recv().unwrap() {
            Pending::Ready(Some(data)) => assert_eq!(data.len(), 10),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fin_delivers_data_then_eof() {
        let (mut client, mut server, _rx) = handshake();
        for seg in client.send(b"last words").unwrap() {
            server.on_segment(&seg);
        }
        let fin = client.close();
        assert!(fin[0].header.is_fin());
        server.on_segment(&fin[0]);
        assert_eq!(server.state, TcpState::CloseWait);
        assert!(matches!(server.recv().unwrap(), Pending::Ready(Some(_))));
        assert!(matches!(server.recv().unwrap(), Pending::Ready(None)));
        assert_eq!(server.state, TcpState::Closed);
        assert_eq!(server.send(b"x").unwrap_err(), NetError::NotConnected);
    }

    #[test]
    fn test_reset_during_connect_refuses() {
        let (client_ep, server_ep) = endpoints();
        let (mut client, syn) = TcpConnection::connect(client_ep, server_ep, 100);
        let rst = TcpSegment {
            header: TcpHeader::new(80, 50000, 0, syn.header.seq_number + 1, flags::RST | flags::ACK),
            payload: Vec::new(),
        };
        let (_, event) = client.on_segment(&rst);
        assert_eq!(event, ConnEvent::Discard);
        assert_eq!(client.state, TcpState::Closed);
    }

    #[test]
    fn test_late_handshake_is_reset() {
        let (client_ep, server_ep) = endpoints();
        let (mut client, syn) = TcpConnection::connect(client_ep, server_ep, 100);
        drop(client.connect_waiter.arm().unwrap());
        let (_, syn_ack) = TcpConnection::from_syn(server_ep, client_ep, &syn.header, 900, SocketId(1));
        let (replies, event) = client.on_segment(&syn_ack);
        assert_eq!(event, ConnEvent::Discard);
        assert!(replies[0].header.is_rst());
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let (mut client, _server, _rx) = handshake();
        let Pending::Wait(rx) = client.recv().unwrap() else {
            panic!("reader should block on an empty queue");
        };
        client.close();
        assert_eq!(rx.await.unwrap(), None);
    }

    #[test]
    fn test_out_of_sequence_ignored() {
        let (mut client, mut server, _rx) = handshake();
        let mut segments = client.send(b"abc").unwrap();
        segments[0].header.seq_number += 5;
        let (acks, _) = server.on_segment(&segments[0]);
        assert!(acks.is_empty());
        assert!(server.recv_queue.is_empty());
    }

    #[test]
    fn test_listener_queue_order() {
        let mut listener = TcpListener::new(Endpoint::new(NetworkAddress::UNSPECIFIED_V4, 80));
        listener.enqueue(SocketId(1));
        listener.enqueue(SocketId(2));
        listener.enqueue(SocketId(3));
        let order: Vec<_> = listener.accept_queue.iter().copied().collect();
        assert_eq!(order, vec![SocketId(1), SocketId(2), SocketId(3)]);
    }
}
