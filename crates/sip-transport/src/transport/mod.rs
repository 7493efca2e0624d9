//! # Transports
//!
//! A [`Transport`] owns one bound local socket (or, for stream transports, a
//! listener plus its accepted and outbound connections) and moves SIP
//! messages between that socket and the rest of the stack.
//!
//! ```text
//!   selector ──SendData──▶ TxQueue (lock-protected FIFO) ──process()──▶ socket
//!   socket ──handle_event()──▶ parse ─▶ basic checks ─▶ congestion check ─▶ TransportEventSink
//!                                   │                     │
//!                                   └── 400 / 503 ◀───────┘  (answered directly, never queued)
//! ```
//!
//! All socket work is non-blocking. Transports share the controller's
//! [`mio::Poll`] loop by default; a transport wrapped in
//! [`ThreadedTransport`](threaded::ThreadedTransport) instead runs the same
//! code on a dedicated thread with its own poll instance. Either way the
//! only structure touched from two threads is the outbound [`TxQueue`].

pub mod dtls;
#[cfg(feature = "dtls")]
pub mod dtls_webrtc;
pub mod stream;
pub mod stun;
pub mod threaded;
#[cfg(feature = "tls")]
pub mod tls;
pub mod udp;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::{Registry, Token, Waker};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use voxstack_sip_core::{make_503, make_response, parse_message, HeaderName, Message, Method, StatusCode};

use crate::congestion::RejectionBehavior;
use crate::error::{Result, TransportError};
use crate::events::{FailureReason, TransportEvent, TransportEventSink, TransportFailure};
use crate::fifo::Fifo;
use crate::send_data::SendData;
use crate::tuple::{IpVersion, TransportKey, TransportType, Tuple};

/// Token reserved for the poll loop's waker
pub const WAKER_TOKEN: Token = Token(0);

const SUB_TOKEN_BITS: u32 = 20;
const SUB_TOKEN_MASK: usize = (1 << SUB_TOKEN_BITS) - 1;

/// Largest sub-token a transport may use for its own sources
pub const MAX_SUB_TOKEN: usize = SUB_TOKEN_MASK;

/// Builds the poll token for source `sub` of transport `key`.
/// Sub-token 0 is the transport's main socket.
pub fn token_for(key: TransportKey, sub: usize) -> Token {
    Token(((key as usize) << SUB_TOKEN_BITS) | (sub & SUB_TOKEN_MASK))
}

/// Inverse of [`token_for`]
pub fn split_token(token: Token) -> (TransportKey, usize) {
    (
        (token.0 >> SUB_TOKEN_BITS) as TransportKey,
        token.0 & SUB_TOKEN_MASK,
    )
}

/// The `CRLFCRLF` keep-alive probe
pub const KEEPALIVE_PING: &[u8] = b"\r\n\r\n";

/// The `CRLF` keep-alive answer used on streams
pub const KEEPALIVE_PONG: &[u8] = b"\r\n";

/// Tunables shared by all transport kinds
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Drain the whole outbound queue per process cycle instead of one entry
    pub tx_all: bool,
    /// Keep reading until the socket would block instead of one read per event
    pub rx_all: bool,
    /// Datagrams at least this large are discarded
    pub max_datagram_size: usize,
    /// Unframed bytes a stream connection may hold before it is closed
    pub max_message_size: usize,
    /// Depth bound of the outbound queue, 0 for unbounded
    pub fifo_max_depth: usize,
    pub connect_timeout: Duration,
    /// Stream connections with no traffic for this long are closed
    pub idle_connection_timeout: Duration,
    /// Initial DTLS handshake retransmission interval
    pub dtls_handshake_timeout: Duration,
    /// Handshake retries before a DTLS session is abandoned
    pub dtls_handshake_retries: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            tx_all: true,
            rx_all: true,
            max_datagram_size: 8192,
            max_message_size: 65_536,
            fifo_max_depth: 10_000,
            connect_timeout: Duration::from_secs(10),
            idle_connection_timeout: Duration::from_secs(300),
            dtls_handshake_timeout: Duration::from_millis(500),
            dtls_handshake_retries: 6,
        }
    }
}

/// Outbound queue of a transport plus the waker of whichever poll loop drains it
pub struct TxQueue {
    fifo: Fifo<SendData>,
    waker: RwLock<Option<Arc<Waker>>>,
}

impl TxQueue {
    fn new(description: String, max_depth: usize) -> Self {
        TxQueue {
            fifo: Fifo::new(description, max_depth),
            waker: RwLock::new(None),
        }
    }

    pub fn fifo(&self) -> &Fifo<SendData> {
        &self.fifo
    }

    /// Installs the waker to poke after every enqueue
    pub fn set_waker(&self, waker: Arc<Waker>) {
        *self.waker.write() = Some(waker);
    }

    pub fn poke(&self) {
        if let Some(waker) = self.waker.read().as_ref() {
            if let Err(e) = waker.wake() {
                warn!("failed to wake transport loop: {}", e);
            }
        }
    }
}

/// Cheap cloneable handle for enqueueing sends on a transport
#[derive(Clone)]
pub struct TransportSender {
    queue: Arc<TxQueue>,
    sink: Arc<dyn TransportEventSink>,
}

impl TransportSender {
    /// Queues a send. Never blocks; a full queue fails the send immediately.
    pub fn send(&self, data: SendData) {
        if let Err(rejected) = self.queue.fifo.add(data) {
            warn!(tid = %rejected.tid, "outbound queue full, dropping send");
            if !rejected.tid.is_empty() {
                self.sink
                    .post(TransportEvent::Failure(TransportFailure::new(rejected.tid, FailureReason::Failure)));
            }
            return;
        }
        self.queue.poke();
    }
}

/// State every transport kind carries. Clones share the queue, sink and flags.
#[derive(Clone)]
pub struct TransportBase {
    tuple: Tuple,
    interface: String,
    options: TransportOptions,
    tx: Arc<TxQueue>,
    sink: Arc<dyn TransportEventSink>,
    shutting_down: Arc<AtomicBool>,
    stun_result: Arc<Mutex<Option<SocketAddr>>>,
}

impl TransportBase {
    pub fn new(
        tuple: Tuple,
        interface: impl Into<String>,
        options: TransportOptions,
        sink: Arc<dyn TransportEventSink>,
    ) -> Self {
        let tx = Arc::new(TxQueue::new(
            format!("{} tx", tuple.transport_type()),
            options.fifo_max_depth,
        ));
        TransportBase {
            tuple,
            interface: interface.into(),
            options,
            tx,
            sink,
            shutting_down: Arc::new(AtomicBool::new(false)),
            stun_result: Arc::new(Mutex::new(None)),
        }
    }

    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    pub fn set_key(&mut self, key: TransportKey) {
        self.tuple.set_transport_key(key);
    }

    pub fn set_port(&mut self, port: u16) {
        self.tuple.set_port(port);
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn tx(&self) -> &Arc<TxQueue> {
        &self.tx
    }

    pub fn sink(&self) -> &Arc<dyn TransportEventSink> {
        &self.sink
    }

    pub fn sender(&self) -> TransportSender {
        TransportSender {
            queue: self.tx.clone(),
            sink: self.sink.clone(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn stun_result(&self) -> Option<SocketAddr> {
        *self.stun_result.lock()
    }

    pub fn set_stun_result(&self, mapped: SocketAddr) {
        *self.stun_result.lock() = Some(mapped);
    }

    /// Tuple describing a peer as seen from this transport
    pub fn peer_tuple(&self, peer: SocketAddr) -> Tuple {
        Tuple::new(peer, self.tuple.transport_type())
            .with_transport_key(self.tuple.transport_key())
            .with_target_domain(self.tuple.target_domain())
    }

    /// Reports a failed send for a transaction
    pub fn fail(&self, tid: &str, reason: FailureReason, os_error: Option<i32>) {
        if tid.is_empty() {
            return;
        }
        debug!(tid, %reason, transport = %self.tuple, "send failed");
        self.sink.post(TransportEvent::Failure(
            TransportFailure::new(tid, reason).with_os_error(os_error),
        ));
    }

    /// Runs the inbound pipeline on one complete wire message.
    ///
    /// Returns an immediate reply (400 or 503) when the message must be
    /// answered without involving the transaction layer.
    pub fn receive(&self, bytes: &[u8], source: Tuple) -> Option<SendData> {
        let mut message = match parse_message(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %source, error = %e, "dropping unparsable message");
                return None;
            }
        };

        if let Err(reason) = basic_check(&message) {
            return match &message {
                Message::Request(req) if req.method != Method::Ack => {
                    debug!(peer = %source, reason, "rejecting malformed request with 400");
                    let resp = make_response(req, StatusCode::BAD_REQUEST, Some(reason));
                    Some(SendData::new(source, Message::from(resp).to_bytes(), ""))
                }
                _ => {
                    debug!(peer = %source, reason, "dropping malformed message");
                    None
                }
            };
        }

        if let Message::Request(req) = &message {
            if req.method != Method::Ack {
                if self.is_shutting_down() {
                    return make_503(req, 0)
                        .map(|r| SendData::new(source.clone(), Message::from(r).to_bytes(), ""));
                }
                let behavior = self.sink.rejection_behavior();
                if behavior != RejectionBehavior::Normal {
                    let wait = self.sink.expected_wait();
                    let retry_after = (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1) as u32;
                    debug!(
                        peer = %source,
                        behavior = behavior.as_str(),
                        retry_after,
                        "congested, rejecting request with 503"
                    );
                    return make_503(req, retry_after)
                        .map(|r| SendData::new(source.clone(), Message::from(r).to_bytes(), ""));
                }
            }
            stamp_received(&mut message, &source);
        }

        trace!(peer = %source, msg = %message.brief(), "received");
        self.sink.post(TransportEvent::MessageReceived {
            message,
            source,
            destination: self.tuple.clone(),
        });
        None
    }
}

/// Sanity checks applied before a message is handed to the transaction layer
pub fn basic_check(message: &Message) -> std::result::Result<(), &'static str> {
    if message.top_via().is_none() {
        return Err("Missing Via");
    }
    let cseq = message.cseq().ok_or("Missing CSeq")?;
    if let Message::Request(req) = message {
        for (name, reason) in [
            (HeaderName::CallId, "Missing Call-ID"),
            (HeaderName::From, "Missing From"),
            (HeaderName::To, "Missing To"),
        ] {
            if !message.has_header(name) {
                return Err(reason);
            }
        }
        if cseq.method != req.method {
            return Err("CSeq method does not match request method");
        }
    }
    Ok(())
}

/// Adds `received` when the source differs from the Via sent-by, and fills an
/// empty `rport` with the source port (RFC 3261 18.2.1, RFC 3581)
pub fn stamp_received(message: &mut Message, source: &Tuple) {
    let Some(via) = message.top_via_mut() else {
        return;
    };
    let source_ip = source.ip();
    let sent_ip: Option<IpAddr> = via.sent_host.parse().ok();
    if sent_ip != Some(source_ip) {
        via.set_received(source_ip.to_string());
    }
    if via.rport() == Some(None) {
        via.set_rport(source.port());
    }
}

/// Binds a non-blocking socket2 socket, classifying address-in-use
pub fn bind_socket(
    addr: SocketAddr,
    socket_type: socket2::Type,
    protocol: socket2::Protocol,
) -> Result<socket2::Socket> {
    let domain = socket2::Domain::for_address(addr);
    let socket = socket2::Socket::new(domain, socket_type, Some(protocol))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    if socket_type == socket2::Type::STREAM {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::from_bind(addr, e))?;
    Ok(socket)
}

/// Resolves the configured interface text to a bind address.
/// Empty means the wildcard address of `version`.
pub fn interface_addr(interface: &str, port: u16, version: IpVersion) -> Result<SocketAddr> {
    let ip = if interface.is_empty() {
        version.any()
    } else {
        interface
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| TransportError::InvalidAddress(interface.to_string()))?
    };
    if IpVersion::of(&ip) != version {
        return Err(TransportError::InvalidAddress(format!(
            "{} is not an {} address",
            interface, version
        )));
    }
    Ok(SocketAddr::new(ip, port))
}

/// Classifies a socket error as transient (retry later) or fatal for the operation
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// A bound socket able to carry SIP. See the [module docs](self).
pub trait Transport: Send {
    fn base(&self) -> &TransportBase;

    fn base_mut(&mut self) -> &mut TransportBase;

    fn tuple(&self) -> &Tuple {
        self.base().tuple()
    }

    fn key(&self) -> TransportKey {
        self.tuple().transport_key()
    }

    /// Called once by the selector on registration
    fn set_key(&mut self, key: TransportKey) {
        self.base_mut().set_key(key);
    }

    fn transport_type(&self) -> TransportType {
        self.tuple().transport_type()
    }

    fn interface(&self) -> &str {
        self.base().interface()
    }

    /// Certificate domain served by a secure transport
    fn tls_domain(&self) -> &str {
        self.tuple().target_domain()
    }

    fn is_reliable(&self) -> bool {
        self.transport_type().is_reliable()
    }

    fn is_stream_oriented(&self) -> bool {
        self.transport_type().is_stream_oriented()
    }

    fn sender(&self) -> TransportSender {
        self.base().sender()
    }

    /// Queues a send; transmission happens in a later process cycle
    fn send(&self, data: SendData) {
        self.sender().send(data);
    }

    fn has_data_to_send(&self) -> bool {
        !self.base().tx().fifo().is_empty()
    }

    fn fifo_size(&self) -> usize {
        self.base().tx().fifo().len()
    }

    /// Registers the transport's sockets with a poll instance
    fn register(&mut self, registry: &Registry) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    /// Handles readiness on one of this transport's tokens
    fn handle_event(&mut self, registry: &Registry, token: Token, readable: bool, writable: bool);

    /// Flushes the outbound queue and services internal timers. Never blocks.
    fn process(&mut self, registry: &Registry);

    /// How soon [`Transport::process`] wants to run again for internal timers
    fn time_till_next_process(&self) -> Option<Duration> {
        None
    }

    /// Whether this transport runs on a dedicated thread instead of the shared loop
    fn runs_own_thread(&self) -> bool {
        false
    }

    /// Moves processing onto a dedicated thread
    fn start_own_thread(&mut self) -> Result<()> {
        Err(TransportError::ThreadStart(
            "transport shares the controller loop".to_string(),
        ))
    }

    /// Wakes a dedicated thread so it drains its queue promptly
    fn poke(&self) {
        self.base().tx().poke();
    }

    fn shutdown(&mut self) {
        self.base().begin_shutdown();
    }

    fn is_finished_shutdown(&self) -> bool {
        self.base().is_shutting_down() && !self.has_data_to_send()
    }

    /// Last address learned from a STUN binding response
    fn stun_result(&self) -> Option<SocketAddr> {
        self.base().stun_result()
    }

    /// Number of open stream connections
    fn connection_count(&self) -> usize {
        0
    }

    /// Peers this transport holds an open connection to
    fn connected_peers(&self) -> Vec<SocketAddr> {
        Vec::new()
    }

    fn has_connection_to(&self, peer: SocketAddr) -> bool {
        self.connected_peers().contains(&peer)
    }
}

/// Queues raw bytes (keep-alive answers, STUN) that are not tied to a transaction
pub(crate) fn raw_send(destination: Tuple, data: &'static [u8]) -> SendData {
    SendData::new(destination, Bytes::from_static(data), "")
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::{Duration, Instant};

    use mio::{Events, Poll};
    use parking_lot::Mutex;

    use super::*;

    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    }

    /// Drives `transports` on `poll` until `done` holds or `limit` elapses
    pub fn pump_for(
        poll: &mut Poll,
        transports: &mut [&mut dyn Transport],
        limit: Duration,
        mut done: impl FnMut() -> bool,
    ) -> bool {
        init_logging();
        let mut events = Events::with_capacity(64);
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            for t in transports.iter_mut() {
                t.process(poll.registry());
            }
            if done() {
                return true;
            }
            poll.poll(&mut events, Some(Duration::from_millis(10))).unwrap();
            for event in events.iter() {
                let (key, _) = split_token(event.token());
                for t in transports.iter_mut() {
                    if t.key() == key {
                        t.handle_event(
                            poll.registry(),
                            event.token(),
                            event.is_readable(),
                            event.is_writable(),
                        );
                    }
                }
            }
        }
        done()
    }

    pub fn pump(poll: &mut Poll, transports: &mut [&mut dyn Transport], done: impl FnMut() -> bool) -> bool {
        pump_for(poll, transports, Duration::from_secs(5), done)
    }

    /// Sink that records events and reports a settable congestion posture
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<TransportEvent>>,
        pub behavior: Mutex<RejectionBehavior>,
    }

    impl RecordingSink {
        pub fn take(&self) -> Vec<TransportEvent> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl TransportEventSink for RecordingSink {
        fn post(&self, event: TransportEvent) {
            self.events.lock().push(event);
        }

        fn rejection_behavior(&self) -> RejectionBehavior {
            *self.behavior.lock()
        }

        fn expected_wait(&self) -> Duration {
            Duration::from_millis(2500)
        }
    }

    pub const OPTIONS: &[u8] = b"OPTIONS sip:bob@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.9.9.9:5070;branch=z9hG4bKtest1;rport\r\n\
From: <sip:alice@example.com>;tag=111\r\n\
To: <sip:bob@example.com>\r\n\
Call-ID: call-1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";

    pub const RESPONSE: &[u8] = b"SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP 10.9.9.9:5070;branch=z9hG4bKtest1\r\n\
From: <sip:alice@example.com>;tag=111\r\n\
To: <sip:bob@example.com>;tag=222\r\n\
Call-ID: call-1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";
}
