//! Connection-oriented transports: TCP, and TLS on top of it.
//!
//! A [`StreamTransport`] owns a listener and a table of connections, both
//! accepted and outbound. Outbound connects are non-blocking; sends queue on
//! the connection until it is established (and, for TLS, until the handshake
//! completes). Partial writes keep their offset and resume on the next
//! writable event.
//!
//! Inbound bytes accumulate per connection and are cut into messages with
//! [`scan_stream`]. A `CRLFCRLF` ping is answered with a `CRLF` pong.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use tracing::{debug, info, trace, warn};

use voxstack_sip_core::{scan_stream, StreamFrame};

use crate::error::Result;
use crate::events::{FailureReason, TransportEventSink};
use crate::send_data::{SendCommand, SendData};
#[cfg(feature = "tls")]
use crate::transport::tls::{classify_tls_error, TlsContext};
use crate::transport::{
    bind_socket, interface_addr, is_transient, raw_send, split_token, token_for, Transport,
    TransportBase, TransportOptions, KEEPALIVE_PONG, MAX_SUB_TOKEN,
};
use crate::tuple::{ConnectionId, IpVersion, TransportType, Tuple};

const READ_CHUNK: usize = 8192;
const LISTEN_BACKLOG: i32 = 1024;

enum ReadOutcome {
    Open,
    Closed(FailureReason),
}

/// Appends `data` to a connection's buffer and hands every complete frame
/// on. Fails on a framing error, or when what is left unframed exceeds
/// [`TransportOptions::max_message_size`].
fn absorb(
    rx: &mut BytesMut,
    peer: &Tuple,
    outgoing: &mut VecDeque<SendData>,
    base: &TransportBase,
    data: &[u8],
) -> std::result::Result<(), String> {
    rx.extend_from_slice(data);
    loop {
        match scan_stream(rx) {
            StreamFrame::Incomplete => break,
            StreamFrame::Message { len } => {
                let bytes = rx.split_to(len).freeze();
                if let Some(reply) = base.receive(&bytes, peer.clone()) {
                    outgoing.push_back(reply);
                }
            }
            StreamFrame::Ping => {
                rx.advance(4);
                trace!(%peer, "keep-alive ping, answering with pong");
                outgoing.push_back(raw_send(peer.clone(), KEEPALIVE_PONG));
            }
            StreamFrame::Pong => rx.advance(2),
            StreamFrame::Invalid(reason) => return Err(format!("framing error: {}", reason)),
        }
    }
    let limit = base.options().max_message_size;
    if rx.len() > limit {
        return Err(format!("{} unframed bytes exceed the {} byte limit", rx.len(), limit));
    }
    Ok(())
}

struct Connection {
    id: ConnectionId,
    peer: Tuple,
    stream: TcpStream,
    #[cfg(feature = "tls")]
    tls: Option<rustls::Connection>,
    /// Set while a non-blocking connect is in flight
    connecting: Option<Instant>,
    rx: BytesMut,
    outgoing: VecDeque<SendData>,
    /// Bytes of the front of `outgoing` already written
    write_offset: usize,
    last_activity: Instant,
    interest: Interest,
}

impl Connection {
    fn token(&self) -> Token {
        token_for(self.peer.transport_key(), self.id as usize)
    }

    fn is_secure(&self) -> bool {
        #[cfg(feature = "tls")]
        return self.tls.is_some();
        #[cfg(not(feature = "tls"))]
        return false;
    }

    fn is_handshaking(&self) -> bool {
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            return tls.is_handshaking();
        }
        false
    }

    fn desired_interest(&self) -> Interest {
        let mut wants_write = self.connecting.is_some();
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            wants_write |= tls.wants_write();
        }
        wants_write |= !self.outgoing.is_empty() && !self.is_handshaking();
        if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Checks whether a pending connect finished. `Ok(true)` once established.
    fn finish_connect(&mut self) -> io::Result<bool> {
        if self.connecting.is_none() {
            return Ok(true);
        }
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connecting = None;
                self.last_activity = Instant::now();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read(&mut self, base: &TransportBase) -> ReadOutcome {
        let mut eof = false;
        let mut chunk = [0u8; READ_CHUNK];

        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            loop {
                match tls.read_tls(&mut self.stream) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(_) => {
                        if let Err(e) = tls.process_new_packets() {
                            debug!(peer = %self.peer, error = %e, "TLS error");
                            // flush the alert, best effort
                            let _ = tls.write_tls(&mut self.stream);
                            return ReadOutcome::Closed(classify_tls_error(&e));
                        }
                        loop {
                            match tls.reader().read(&mut chunk) {
                                Ok(0) => {
                                    eof = true;
                                    break;
                                }
                                Ok(n) => {
                                    if let Err(reason) = absorb(
                                        &mut self.rx,
                                        &self.peer,
                                        &mut self.outgoing,
                                        base,
                                        &chunk[..n],
                                    ) {
                                        warn!(peer = %self.peer, reason, "closing connection");
                                        return ReadOutcome::Closed(FailureReason::ConnectionException);
                                    }
                                }
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                Err(_) => {
                                    eof = true;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) if is_transient(&e) => break,
                    Err(e) => {
                        debug!(peer = %self.peer, error = %e, "read failed");
                        return ReadOutcome::Closed(FailureReason::ConnectionException);
                    }
                }
            }
        }

        if !self.is_secure() {
            loop {
                match self.stream.read(&mut chunk) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        if let Err(reason) =
                            absorb(&mut self.rx, &self.peer, &mut self.outgoing, base, &chunk[..n])
                        {
                            warn!(peer = %self.peer, reason, "closing connection");
                            return ReadOutcome::Closed(FailureReason::ConnectionException);
                        }
                    }
                    Err(e) if is_transient(&e) => break,
                    Err(e) => {
                        debug!(peer = %self.peer, error = %e, "read failed");
                        return ReadOutcome::Closed(FailureReason::ConnectionException);
                    }
                }
            }
        }

        self.last_activity = Instant::now();
        if eof {
            debug!(peer = %self.peer, "peer closed connection");
            ReadOutcome::Closed(FailureReason::ConnectionException)
        } else {
            ReadOutcome::Open
        }
    }

    /// Writes as much queued data as the socket takes
    fn flush(&mut self) -> std::result::Result<(), FailureReason> {
        if self.connecting.is_some() {
            return Ok(());
        }

        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            if !tls.is_handshaking() {
                while let Some(sd) = self.outgoing.pop_front() {
                    tls.writer()
                        .write_all(&sd.data)
                        .map_err(|_| FailureReason::ConnectionException)?;
                }
            }
            while tls.wants_write() {
                match tls.write_tls(&mut self.stream) {
                    Ok(_) => self.last_activity = Instant::now(),
                    Err(e) if is_transient(&e) => break,
                    Err(e) => {
                        debug!(peer = %self.peer, error = %e, "TLS write failed");
                        return Err(FailureReason::ConnectionException);
                    }
                }
            }
            return Ok(());
        }

        while let Some(front) = self.outgoing.front() {
            match self.stream.write(&front.data[self.write_offset..]) {
                Ok(0) => return Err(FailureReason::ConnectionException),
                Ok(n) => {
                    self.last_activity = Instant::now();
                    self.write_offset += n;
                    if self.write_offset >= front.data.len() {
                        self.write_offset = 0;
                        self.outgoing.pop_front();
                    }
                }
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "write failed");
                    return Err(FailureReason::ConnectionException);
                }
            }
        }
        Ok(())
    }
}

/// TCP or TLS transport. See the [module docs](self).
pub struct StreamTransport {
    base: TransportBase,
    listener: TcpListener,
    #[cfg(feature = "tls")]
    tls: Option<TlsContext>,
    connections: HashMap<ConnectionId, Connection>,
    by_peer: HashMap<SocketAddr, ConnectionId>,
    next_id: ConnectionId,
    registered: bool,
}

impl StreamTransport {
    pub fn bind_tcp(
        interface: &str,
        port: u16,
        version: IpVersion,
        options: TransportOptions,
        sink: Arc<dyn TransportEventSink>,
    ) -> Result<Self> {
        let (listener, tuple) = listen(interface, port, version, TransportType::Tcp)?;
        info!("SIP TCP transport listening on {}", tuple.socket_addr());
        Ok(StreamTransport {
            base: TransportBase::new(tuple, interface, options, sink),
            listener,
            #[cfg(feature = "tls")]
            tls: None,
            connections: HashMap::new(),
            by_peer: HashMap::new(),
            next_id: 1,
            registered: false,
        })
    }

    /// TLS transport serving certificates for `domain`
    #[cfg(feature = "tls")]
    pub fn bind_tls(
        interface: &str,
        port: u16,
        version: IpVersion,
        domain: &str,
        tls: TlsContext,
        options: TransportOptions,
        sink: Arc<dyn TransportEventSink>,
    ) -> Result<Self> {
        let (listener, tuple) = listen(interface, port, version, TransportType::Tls)?;
        let tuple = tuple.with_target_domain(domain);
        info!(
            "SIP TLS transport listening on {} for domain '{}'",
            tuple.socket_addr(),
            domain
        );
        Ok(StreamTransport {
            base: TransportBase::new(tuple, interface, options, sink),
            listener,
            tls: Some(tls),
            connections: HashMap::new(),
            by_peer: HashMap::new(),
            next_id: 1,
            registered: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.base.tuple().socket_addr()
    }

    /// Connection currently used for `peer`, if any
    pub fn connection_for(&self, peer: SocketAddr) -> Option<ConnectionId> {
        self.by_peer.get(&peer).copied()
    }

    fn allocate_id(&mut self) -> Option<ConnectionId> {
        for _ in 0..MAX_SUB_TOKEN {
            let id = self.next_id;
            self.next_id = if self.next_id as usize >= MAX_SUB_TOKEN {
                1
            } else {
                self.next_id + 1
            };
            if !self.connections.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn add_connection(
        &mut self,
        registry: &Registry,
        stream: TcpStream,
        peer: SocketAddr,
        outbound: bool,
        domain: &str,
    ) -> std::result::Result<ConnectionId, FailureReason> {
        let id = self.allocate_id().ok_or_else(|| {
            warn!("connection table full");
            FailureReason::TransportNoSocket
        })?;

        #[cfg(feature = "tls")]
        let tls = match &self.tls {
            Some(ctx) if outbound => Some(ctx.connect(domain, peer.ip())?),
            Some(ctx) => Some(ctx.accept().ok_or(FailureReason::Failure)?),
            None => None,
        };
        #[cfg(not(feature = "tls"))]
        let _ = domain;

        let peer_tuple = self.base.peer_tuple(peer).with_connection_id(id);
        let mut conn = Connection {
            id,
            peer: peer_tuple,
            stream,
            #[cfg(feature = "tls")]
            tls,
            connecting: outbound.then(Instant::now),
            rx: BytesMut::new(),
            outgoing: VecDeque::new(),
            write_offset: 0,
            last_activity: Instant::now(),
            interest: Interest::READABLE,
        };
        let interest = conn.desired_interest();
        let token = conn.token();
        registry
            .register(&mut conn.stream, token, interest)
            .map_err(|e| {
                warn!(%peer, error = %e, "failed to register connection");
                FailureReason::TransportNoSocket
            })?;
        conn.interest = interest;

        debug!(
            %peer,
            id,
            direction = if outbound { "outbound" } else { "inbound" },
            "connection added"
        );
        self.by_peer.insert(peer, id);
        self.connections.insert(id, conn);
        Ok(id)
    }

    fn accept_all(&mut self, registry: &Registry) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.base.is_shutting_down() {
                        debug!(%peer, "refusing connection while shutting down");
                        continue;
                    }
                    #[cfg(feature = "tls")]
                    if self.tls.as_ref().is_some_and(|t| !t.can_accept()) {
                        debug!(%peer, "no server identity, refusing TLS connection");
                        continue;
                    }
                    if let Err(reason) = self.add_connection(registry, stream, peer, false, "") {
                        debug!(%peer, %reason, "dropping accepted connection");
                    }
                }
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn connect(&mut self, registry: &Registry, dest: &Tuple) -> std::result::Result<ConnectionId, FailureReason> {
        let addr = dest.socket_addr();
        let stream = TcpStream::connect(addr).map_err(|e| {
            debug!(%addr, error = %e, "connect failed");
            FailureReason::TransportBadConnect
        })?;
        self.add_connection(registry, stream, addr, true, dest.target_domain())
    }

    fn close(&mut self, registry: &Registry, id: ConnectionId, reason: FailureReason) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        if self.by_peer.get(&conn.peer.socket_addr()) == Some(&id) {
            self.by_peer.remove(&conn.peer.socket_addr());
        }
        #[cfg(feature = "tls")]
        if let Some(tls) = conn.tls.as_mut() {
            tls.send_close_notify();
            let _ = tls.write_tls(&mut conn.stream);
        }
        let _ = registry.deregister(&mut conn.stream);
        for sd in conn.outgoing.drain(..) {
            self.base.fail(&sd.tid, reason, None);
        }
        debug!(peer = %conn.peer, id, %reason, "connection closed");
    }

    fn service(&mut self, registry: &Registry, id: ConnectionId, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        if conn.connecting.is_some() {
            match conn.finish_connect() {
                Ok(true) => debug!(peer = %conn.peer, "connected"),
                Ok(false) => return,
                Err(e) => {
                    debug!(peer = %conn.peer, error = %e, "connect failed");
                    self.close(registry, id, FailureReason::TransportBadConnect);
                    return;
                }
            }
        }

        if readable {
            if let ReadOutcome::Closed(reason) = conn.read(&self.base) {
                // answer anything the read produced before going away
                let _ = conn.flush();
                self.close(registry, id, reason);
                return;
            }
        }
        if readable || writable || !conn.outgoing.is_empty() {
            if let Err(reason) = conn.flush() {
                self.close(registry, id, reason);
                return;
            }
        }

        let desired = conn.desired_interest();
        if desired != conn.interest {
            let token = conn.token();
            match registry.reregister(&mut conn.stream, token, desired) {
                Ok(()) => conn.interest = desired,
                Err(e) => warn!(peer = %conn.peer, error = %e, "failed to update interest"),
            }
        }
    }

    fn route(&mut self, registry: &Registry, sd: SendData) {
        let dest = &sd.destination;
        if sd.command == SendCommand::CloseConnection {
            let id = match dest.connection_id() {
                0 => self.by_peer.get(&dest.socket_addr()).copied(),
                id => Some(id),
            };
            if let Some(id) = id {
                self.close(registry, id, FailureReason::ConnectionException);
            }
            return;
        }

        let existing = match dest.connection_id() {
            0 => None,
            id if self.connections.contains_key(&id) => Some(id),
            _ => None,
        }
        .or_else(|| self.by_peer.get(&dest.socket_addr()).copied());

        let id = match existing {
            Some(id) => id,
            None if dest.only_use_existing_connection() || self.base.is_shutting_down() => {
                let reason = if self.base.is_shutting_down() {
                    FailureReason::TransportShutdown
                } else {
                    FailureReason::TransportNoExistConn
                };
                self.base.fail(&sd.tid, reason, None);
                return;
            }
            None => match self.connect(registry, dest) {
                Ok(id) => id,
                Err(reason) => {
                    self.base.fail(&sd.tid, reason, None);
                    return;
                }
            },
        };

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.outgoing.push_back(sd);
        }
        self.service(registry, id, false, false);
    }

    fn expire(&mut self, registry: &Registry) {
        let now = Instant::now();
        let options = self.base.options();
        let connect_timeout = options.connect_timeout;
        let idle_timeout = options.idle_connection_timeout;
        let expired: Vec<(ConnectionId, FailureReason)> = self
            .connections
            .values()
            .filter_map(|c| match c.connecting {
                Some(started) if now.duration_since(started) >= connect_timeout => {
                    Some((c.id, FailureReason::TransportBadConnect))
                }
                None if c.outgoing.is_empty() && now.duration_since(c.last_activity) >= idle_timeout => {
                    Some((c.id, FailureReason::ConnectionException))
                }
                _ => None,
            })
            .collect();
        for (id, reason) in expired {
            debug!(id, %reason, "closing expired connection");
            self.close(registry, id, reason);
        }
    }
}

fn listen(
    interface: &str,
    port: u16,
    version: IpVersion,
    transport_type: TransportType,
) -> Result<(TcpListener, Tuple)> {
    let addr = interface_addr(interface, port, version)?;
    let socket = bind_socket(addr, socket2::Type::STREAM, socket2::Protocol::TCP)?;
    socket.listen(LISTEN_BACKLOG)?;
    let std_listener: std::net::TcpListener = socket.into();
    let local = std_listener.local_addr()?;
    Ok((TcpListener::from_std(std_listener), Tuple::new(local, transport_type)))
}

impl Transport for StreamTransport {
    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TransportBase {
        &mut self.base
    }

    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let token = token_for(self.key(), 0);
        registry.register(&mut self.listener, token, Interest::READABLE)?;
        self.registered = true;
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.registered = false;
        for conn in self.connections.values_mut() {
            let _ = registry.deregister(&mut conn.stream);
        }
        registry.deregister(&mut self.listener)
    }

    fn handle_event(&mut self, registry: &Registry, token: Token, readable: bool, writable: bool) {
        match split_token(token).1 {
            0 => self.accept_all(registry),
            sub => self.service(registry, sub as ConnectionId, readable, writable),
        }
    }

    fn process(&mut self, registry: &Registry) {
        let fifo = self.base.tx().clone();
        while let Some(sd) = fifo.fifo().try_get() {
            self.route(registry, sd);
            if !self.base.options().tx_all {
                break;
            }
        }
        self.expire(registry);
    }

    fn time_till_next_process(&self) -> Option<Duration> {
        if self.connections.is_empty() {
            return None;
        }
        // coarse tick for connect and idle timeouts
        Some(Duration::from_secs(1))
    }

    fn has_data_to_send(&self) -> bool {
        !self.base.tx().fifo().is_empty()
            || self.connections.values().any(|c| !c.outgoing.is_empty())
    }

    fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn connected_peers(&self) -> Vec<SocketAddr> {
        self.by_peer.keys().copied().collect()
    }

    fn has_connection_to(&self, peer: SocketAddr) -> bool {
        self.by_peer.contains_key(&peer)
    }
}
