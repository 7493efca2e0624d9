//! DTLS transport
//!
//! Datagram transport with a security session per peer. The cryptography is
//! not implemented here: sessions come from a [`DtlsSessionFactory`] and are
//! driven sans-IO. The transport feeds them inbound datagrams, asks them to
//! seal outbound messages, and puts whatever they emit on the wire.
//!
//! Sessions are keyed by peer address. An inbound datagram from an unknown
//! peer creates a server-role session; a send to an unknown peer creates a
//! client-role session. A session that fails or is closed by its peer is
//! torn down alone; every other peer's session is left untouched.
//!
//! While a handshake is in flight a retransmission timer runs, doubling from
//! [`TransportOptions::dtls_handshake_timeout`] for up to
//! [`TransportOptions::dtls_handshake_retries`] attempts. Sends to a peer wait
//! until its handshake completes.
//!
//! Sessions that work in the background (see `dtls_webrtc`) hand out output
//! later through [`DtlsSession::poll_plaintext`] and
//! [`DtlsSession::poll_error`], and call their [`SessionWaker`] so the next
//! cycle collects it.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::events::{FailureReason, TransportEventSink};
use crate::send_data::{SendCommand, SendData};
use crate::transport::{
    bind_socket, interface_addr, is_transient, token_for, Transport, TransportBase,
    TransportOptions, KEEPALIVE_PING,
};
use crate::tuple::{IpVersion, TransportType, Tuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtlsRole {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DtlsError {
    /// More input from the peer is needed before this can proceed
    #[error("session wants to read")]
    WantRead,
    /// Output must drain before this can proceed
    #[error("session wants to write")]
    WantWrite,
    /// The peer closed the session
    #[error("session closed by peer")]
    Closed,
    #[error("DTLS failure: {0}")]
    Fatal(String),
}

/// One DTLS association, driven without I/O
pub trait DtlsSession: Send {
    fn role(&self) -> DtlsRole;

    fn is_handshaking(&self) -> bool;

    /// Starts the handshake, or retransmits the current flight
    fn handshake(&mut self) -> std::result::Result<(), DtlsError>;

    /// Feeds one datagram from the peer. Returns decrypted application data, if any.
    fn receive(&mut self, datagram: &[u8]) -> std::result::Result<Option<Vec<u8>>, DtlsError>;

    /// Seals `plaintext` for the peer. Returns how many bytes were taken.
    fn send(&mut self, plaintext: &[u8]) -> std::result::Result<usize, DtlsError>;

    /// Next datagram to put on the wire
    fn poll_transmit(&mut self) -> Option<Vec<u8>>;

    /// Application data decrypted outside of [`DtlsSession::receive`]
    fn poll_plaintext(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// A failure that happened outside of a call, reported once
    fn poll_error(&mut self) -> Option<DtlsError> {
        None
    }
}

/// Called by a session when it has output waiting
pub type SessionWaker = Arc<dyn Fn() + Send + Sync>;

/// Creates sessions. Shared by every session of a transport.
pub trait DtlsSessionFactory: Send + Sync {
    fn create(
        &self,
        role: DtlsRole,
        peer: SocketAddr,
        domain: &str,
        wake: SessionWaker,
    ) -> std::result::Result<Box<dyn DtlsSession>, DtlsError>;
}

struct SessionState {
    session: Box<dyn DtlsSession>,
    retries: u32,
    interval: Duration,
    next_retry: Option<Instant>,
}

impl SessionState {
    fn new(session: Box<dyn DtlsSession>, interval: Duration) -> Self {
        SessionState {
            session,
            retries: 0,
            interval,
            next_retry: None,
        }
    }

    /// Arms or clears the handshake timer to match the session state
    fn rearm(&mut self, now: Instant) {
        if !self.session.is_handshaking() {
            self.next_retry = None;
        } else if self.next_retry.is_none() {
            self.next_retry = Some(now + self.interval);
        }
    }
}

#[derive(Default)]
struct PeerSessions {
    client: Option<SessionState>,
    server: Option<SessionState>,
}

impl PeerSessions {
    fn is_empty(&self) -> bool {
        self.client.is_none() && self.server.is_none()
    }
}

enum SendOutcome {
    Done,
    Wait(SendData),
}

pub struct DtlsTransport {
    base: TransportBase,
    socket: UdpSocket,
    buffer: Vec<u8>,
    factory: Arc<dyn DtlsSessionFactory>,
    peers: HashMap<SocketAddr, PeerSessions>,
    /// Sends waiting for a handshake or for the session to accept data
    pending: VecDeque<SendData>,
    /// Sealed datagrams not yet accepted by the socket
    wire: VecDeque<(SocketAddr, Vec<u8>)>,
    write_blocked: bool,
    writable_interest: bool,
    registered: bool,
    /// Reading stopped before would-block; the socket will not signal again
    rx_pending: bool,
}

impl DtlsTransport {
    pub fn bind(
        interface: &str,
        port: u16,
        version: IpVersion,
        domain: &str,
        factory: Arc<dyn DtlsSessionFactory>,
        options: TransportOptions,
        sink: Arc<dyn TransportEventSink>,
    ) -> Result<Self> {
        let addr = interface_addr(interface, port, version)?;
        let socket = bind_socket(addr, socket2::Type::DGRAM, socket2::Protocol::UDP)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let local = std_socket.local_addr()?;
        info!("SIP DTLS transport bound to {} for domain '{}'", local, domain);

        let buffer = vec![0u8; options.max_datagram_size.max(1)];
        let tuple = Tuple::new(local, TransportType::Dtls).with_target_domain(domain);
        Ok(DtlsTransport {
            base: TransportBase::new(tuple, interface, options, sink),
            socket: UdpSocket::from_std(std_socket),
            buffer,
            factory,
            peers: HashMap::new(),
            pending: VecDeque::new(),
            wire: VecDeque::new(),
            write_blocked: false,
            writable_interest: false,
            registered: false,
            rx_pending: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.base.tuple().socket_addr()
    }

    /// Number of live sessions across all peers
    pub fn session_count(&self) -> usize {
        self.peers
            .values()
            .map(|p| usize::from(p.client.is_some()) + usize::from(p.server.is_some()))
            .sum()
    }

    fn token(&self) -> Token {
        token_for(self.key(), 0)
    }

    fn create_session(&self, role: DtlsRole, peer: SocketAddr, domain: &str) -> Option<SessionState> {
        let tx = self.base.tx().clone();
        let wake: SessionWaker = Arc::new(move || tx.poke());
        match self.factory.create(role, peer, domain, wake) {
            Ok(session) => Some(SessionState::new(
                session,
                self.base.options().dtls_handshake_timeout,
            )),
            Err(e) => {
                warn!(%peer, ?role, error = %e, "failed to create DTLS session");
                None
            }
        }
    }

    fn collect_output(wire: &mut VecDeque<(SocketAddr, Vec<u8>)>, peer: SocketAddr, state: &mut SessionState) {
        while let Some(datagram) = state.session.poll_transmit() {
            wire.push_back((peer, datagram));
        }
    }

    fn teardown(&mut self, peer: SocketAddr, role: DtlsRole, reason: FailureReason) {
        if let Some(sessions) = self.peers.get_mut(&peer) {
            match role {
                DtlsRole::Client => sessions.client = None,
                DtlsRole::Server => sessions.server = None,
            }
            if sessions.is_empty() {
                self.peers.remove(&peer);
            }
        }
        debug!(%peer, ?role, %reason, "DTLS session torn down");
        if !self.peers.contains_key(&peer) {
            let (failed, kept): (VecDeque<_>, VecDeque<_>) = self
                .pending
                .drain(..)
                .partition(|sd| sd.destination.socket_addr() == peer);
            self.pending = kept;
            for sd in failed {
                self.base.fail(&sd.tid, reason, None);
            }
        }
    }

    fn try_send(&mut self, sd: SendData) -> SendOutcome {
        let peer = sd.destination.socket_addr();
        let now = Instant::now();

        let has_usable = self.peers.get(&peer).is_some_and(|p| {
            p.client.is_some() || p.server.as_ref().is_some_and(|s| !s.session.is_handshaking())
        });
        if !has_usable {
            let domain = sd.destination.target_domain().to_string();
            let Some(mut state) = self.create_session(DtlsRole::Client, peer, &domain) else {
                self.base.fail(&sd.tid, FailureReason::TransportBadConnect, None);
                return SendOutcome::Done;
            };
            if let Err(e) = state.session.handshake() {
                if !matches!(e, DtlsError::WantRead | DtlsError::WantWrite) {
                    debug!(%peer, error = %e, "DTLS handshake could not start");
                    self.base.fail(&sd.tid, FailureReason::TransportBadConnect, None);
                    return SendOutcome::Done;
                }
            }
            state.rearm(now);
            Self::collect_output(&mut self.wire, peer, &mut state);
            self.peers.entry(peer).or_default().client = Some(state);
        }

        let Some(sessions) = self.peers.get_mut(&peer) else {
            return SendOutcome::Wait(sd);
        };
        // prefer our own association, fall back to one the peer established
        let (role, state) = match (&mut sessions.client, &mut sessions.server) {
            (Some(client), _) => (DtlsRole::Client, client),
            (None, Some(server)) => (DtlsRole::Server, server),
            (None, None) => return SendOutcome::Wait(sd),
        };
        if state.session.is_handshaking() {
            return SendOutcome::Wait(sd);
        }

        let result = state.session.send(&sd.data);
        Self::collect_output(&mut self.wire, peer, state);
        match result {
            Ok(n) if n == sd.data.len() => {
                trace!(%peer, bytes = n, "sealed message");
                SendOutcome::Done
            }
            Ok(n) => {
                warn!(%peer, sent = n, expected = sd.data.len(), "short DTLS write");
                self.base.fail(&sd.tid, FailureReason::Failure, None);
                SendOutcome::Done
            }
            Err(DtlsError::WantRead) | Err(DtlsError::WantWrite) => SendOutcome::Wait(sd),
            Err(e) => {
                debug!(%peer, error = %e, "DTLS send failed");
                self.pending.push_back(sd);
                self.teardown(peer, role, FailureReason::ConnectionException);
                SendOutcome::Done
            }
        }
    }

    fn flush_pending(&mut self) {
        let mut waiting = VecDeque::new();
        let queued: Vec<SendData> = self.pending.drain(..).collect();
        for sd in queued {
            if let SendOutcome::Wait(sd) = self.try_send(sd) {
                waiting.push_back(sd);
            }
        }
        waiting.extend(self.pending.drain(..));
        self.pending = waiting;
    }

    fn flush_wire(&mut self) {
        while let Some((peer, datagram)) = self.wire.pop_front() {
            match self.socket.send_to(&datagram, peer) {
                Ok(_) => {}
                Err(e) if is_transient(&e) => {
                    self.wire.push_front((peer, datagram));
                    self.write_blocked = true;
                    break;
                }
                Err(e) => debug!(%peer, error = %e, "DTLS datagram send failed"),
            }
        }
    }

    fn process_rx(&mut self) {
        self.rx_pending = false;
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((len, from)) => {
                    if len >= self.buffer.len() {
                        warn!(peer = %from, len, "datagram too large, discarding");
                        continue;
                    }
                    let datagram = self.buffer[..len].to_vec();
                    self.handle_datagram(&datagram, from);
                    if !self.base.options().rx_all {
                        self.rx_pending = true;
                        break;
                    }
                }
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    debug!(error = %e, "DTLS receive error");
                    if e.kind() != io::ErrorKind::ConnectionRefused {
                        break;
                    }
                }
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let now = Instant::now();
        let role = match self.peers.get(&from) {
            Some(p) if p.client.is_some() => DtlsRole::Client,
            Some(p) if p.server.is_some() => DtlsRole::Server,
            _ => {
                let domain = self.base.tuple().target_domain().to_string();
                let Some(state) = self.create_session(DtlsRole::Server, from, &domain) else {
                    return;
                };
                self.peers.entry(from).or_default().server = Some(state);
                DtlsRole::Server
            }
        };

        let Some(sessions) = self.peers.get_mut(&from) else {
            return;
        };
        let slot = match role {
            DtlsRole::Client => &mut sessions.client,
            DtlsRole::Server => &mut sessions.server,
        };
        let Some(state) = slot.as_mut() else {
            return;
        };

        let result = state.session.receive(datagram);
        state.rearm(now);
        Self::collect_output(&mut self.wire, from, state);

        match result {
            Ok(Some(plaintext)) => self.deliver(&plaintext, from),
            Ok(None) | Err(DtlsError::WantRead) | Err(DtlsError::WantWrite) => {}
            Err(e) => self.fail_session(from, role, e),
        }
    }

    fn deliver(&mut self, plaintext: &[u8], from: SocketAddr) {
        if plaintext == KEEPALIVE_PING {
            trace!(peer = %from, "keep-alive received");
            return;
        }
        let source = self.base.peer_tuple(from);
        if let Some(reply) = self.base.receive(plaintext, source) {
            self.pending.push_back(reply);
        }
    }

    fn fail_session(&mut self, peer: SocketAddr, role: DtlsRole, error: DtlsError) {
        match error {
            DtlsError::WantRead | DtlsError::WantWrite => {}
            DtlsError::Closed => self.teardown(peer, role, FailureReason::ConnectionException),
            DtlsError::Fatal(e) => {
                debug!(%peer, error = %e, "DTLS failure");
                self.teardown(peer, role, FailureReason::CertValidationFailure);
            }
        }
    }

    /// Collects what sessions produced between cycles
    fn poll_sessions(&mut self) {
        let now = Instant::now();
        let mut plaintexts = Vec::new();
        let mut failed = Vec::new();

        for (peer, sessions) in self.peers.iter_mut() {
            for (role, slot) in [
                (DtlsRole::Client, &mut sessions.client),
                (DtlsRole::Server, &mut sessions.server),
            ] {
                let Some(state) = slot.as_mut() else {
                    continue;
                };
                Self::collect_output(&mut self.wire, *peer, state);
                while let Some(plaintext) = state.session.poll_plaintext() {
                    plaintexts.push((*peer, plaintext));
                }
                match state.session.poll_error() {
                    Some(e) => failed.push((*peer, role, e)),
                    None => state.rearm(now),
                }
            }
        }

        for (peer, plaintext) in plaintexts {
            self.deliver(&plaintext, peer);
        }
        for (peer, role, error) in failed {
            self.fail_session(peer, role, error);
        }
    }

    fn run_handshake_timers(&mut self) {
        let now = Instant::now();
        let max_retries = self.base.options().dtls_handshake_retries;
        let mut exhausted = Vec::new();

        for (peer, sessions) in self.peers.iter_mut() {
            for (role, slot) in [
                (DtlsRole::Client, &mut sessions.client),
                (DtlsRole::Server, &mut sessions.server),
            ] {
                let Some(state) = slot.as_mut() else {
                    continue;
                };
                match state.next_retry {
                    Some(at) if at <= now => {}
                    _ => continue,
                }
                if !state.session.is_handshaking() {
                    state.next_retry = None;
                    continue;
                }
                if state.retries >= max_retries {
                    exhausted.push((*peer, role));
                    continue;
                }
                state.retries += 1;
                state.interval *= 2;
                state.next_retry = Some(now + state.interval);
                trace!(%peer, ?role, attempt = state.retries, "retransmitting DTLS handshake");
                if let Err(e) = state.session.handshake() {
                    if !matches!(e, DtlsError::WantRead | DtlsError::WantWrite) {
                        exhausted.push((*peer, role));
                        continue;
                    }
                }
                Self::collect_output(&mut self.wire, *peer, state);
            }
        }

        for (peer, role) in exhausted {
            debug!(%peer, ?role, "DTLS handshake failed");
            self.teardown(peer, role, FailureReason::TransportBadConnect);
        }
    }

    fn update_interest(&mut self, registry: &Registry) {
        if !self.registered || self.writable_interest == self.write_blocked {
            return;
        }
        let interest = if self.write_blocked {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let token = self.token();
        match registry.reregister(&mut self.socket, token, interest) {
            Ok(()) => self.writable_interest = self.write_blocked,
            Err(e) => warn!("failed to update DTLS interest: {}", e),
        }
    }
}

impl Transport for DtlsTransport {
    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TransportBase {
        &mut self.base
    }

    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let token = self.token();
        registry.register(&mut self.socket, token, Interest::READABLE)?;
        self.registered = true;
        self.writable_interest = false;
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.registered = false;
        registry.deregister(&mut self.socket)
    }

    fn handle_event(&mut self, registry: &Registry, _token: Token, readable: bool, writable: bool) {
        if writable {
            self.write_blocked = false;
        }
        if readable {
            self.process_rx();
            self.flush_pending();
        }
        self.flush_wire();
        self.update_interest(registry);
    }

    fn process(&mut self, registry: &Registry) {
        let fifo = self.base.tx().clone();
        while let Some(sd) = fifo.fifo().try_get() {
            if sd.command == SendCommand::CloseConnection {
                let peer = sd.destination.socket_addr();
                self.teardown(peer, DtlsRole::Client, FailureReason::ConnectionException);
                self.teardown(peer, DtlsRole::Server, FailureReason::ConnectionException);
                continue;
            }
            self.pending.push_back(sd);
            if !self.base.options().tx_all {
                break;
            }
        }
        if self.rx_pending {
            self.process_rx();
        }
        self.poll_sessions();
        self.flush_pending();
        self.run_handshake_timers();
        if !self.write_blocked {
            self.flush_wire();
        }
        self.update_interest(registry);
    }

    fn time_till_next_process(&self) -> Option<Duration> {
        if self.rx_pending {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        self.peers
            .values()
            .flat_map(|p| [p.client.as_ref(), p.server.as_ref()])
            .flatten()
            .filter_map(|s| s.next_retry)
            .min()
            .map(|at| at.saturating_duration_since(now))
    }

    fn connection_count(&self) -> usize {
        self.session_count()
    }
}
