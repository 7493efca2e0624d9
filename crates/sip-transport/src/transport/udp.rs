//! UDP transport
//!
//! One non-blocking datagram socket. Besides SIP it understands the
//! `CRLFCRLF` keep-alive (silently dropped) and STUN binding requests and
//! responses, which are told apart from SIP by their first two bytes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::events::{FailureReason, TransportEventSink};
use crate::send_data::{SendCommand, SendData};
use crate::transport::{
    bind_socket, interface_addr, is_transient, stun, token_for, Transport, TransportBase,
    TransportOptions, KEEPALIVE_PING,
};
use crate::tuple::{IpVersion, TransportType, Tuple};

pub struct UdpTransport {
    base: TransportBase,
    socket: UdpSocket,
    buffer: Vec<u8>,
    /// Last write hit would-block; wait for writability before flushing again
    write_blocked: bool,
    writable_interest: bool,
    registered: bool,
    /// Reading stopped before would-block; the socket will not signal again
    rx_pending: bool,
}

impl UdpTransport {
    /// Binds `interface:port`. An empty interface binds the wildcard address
    /// of `version`; port 0 picks an ephemeral port.
    pub fn bind(
        interface: &str,
        port: u16,
        version: IpVersion,
        options: TransportOptions,
        sink: Arc<dyn TransportEventSink>,
    ) -> Result<Self> {
        let addr = interface_addr(interface, port, version)?;
        let socket = bind_socket(addr, socket2::Type::DGRAM, socket2::Protocol::UDP)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let local = std_socket.local_addr()?;
        let socket = UdpSocket::from_std(std_socket);
        info!("SIP UDP transport bound to {}", local);

        let buffer = vec![0u8; options.max_datagram_size.max(1)];
        Ok(UdpTransport {
            base: TransportBase::new(Tuple::new(local, TransportType::Udp), interface, options, sink),
            socket,
            buffer,
            write_blocked: false,
            writable_interest: false,
            registered: false,
            rx_pending: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.base.tuple().socket_addr()
    }

    /// Sends a STUN binding request; the answer is exposed through
    /// [`Transport::stun_result`]
    pub fn stun_send_test(&self, server: SocketAddr) {
        let request = stun::binding_request(stun::random_transaction_id());
        self.send(SendData::new(
            Tuple::new(server, TransportType::Udp),
            Bytes::from(request),
            "",
        ));
    }

    fn token(&self) -> Token {
        token_for(self.key(), 0)
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
            Err(e) => warn!("failed to update UDP interest: {}", e),
        }
    }

    fn process_tx(&mut self) {
        let fifo = self.base.tx().clone();
        while let Some(sd) = fifo.fifo().try_get() {
            if sd.command == SendCommand::CloseConnection {
                continue;
            }
            let dest = sd.destination.socket_addr();
            match self.socket.send_to(&sd.data, dest) {
                Ok(n) if n == sd.data.len() => {
                    trace!(%dest, bytes = n, "sent datagram");
                }
                Ok(n) => {
                    warn!(%dest, sent = n, expected = sd.data.len(), "short UDP write");
                    self.base.fail(&sd.tid, FailureReason::Failure, None);
                }
                Err(e) if is_transient(&e) => {
                    fifo.fifo().push_front(sd);
                    self.write_blocked = true;
                    break;
                }
                Err(e) => {
                    debug!(%dest, error = %e, "UDP send failed");
                    self.base.fail(&sd.tid, FailureReason::Failure, e.raw_os_error());
                }
            }
            if !self.base.options().tx_all {
                break;
            }
        }
    }

    fn process_rx(&mut self) {
        self.rx_pending = false;
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((len, from)) => {
                    self.handle_datagram(len, from);
                    if !self.base.options().rx_all {
                        self.rx_pending = true;
                        break;
                    }
                }
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    // e.g. ICMP errors surfacing on the socket; nothing to correlate them with
                    debug!(error = %e, "UDP receive error");
                    if e.kind() != io::ErrorKind::ConnectionRefused {
                        break;
                    }
                }
            }
        }
    }

    fn handle_datagram(&mut self, len: usize, from: SocketAddr) {
        if len >= self.buffer.len() {
            warn!(peer = %from, len, "datagram too large, discarding");
            return;
        }
        let datagram = &self.buffer[..len];
        if datagram == KEEPALIVE_PING {
            trace!(peer = %from, "keep-alive received");
            return;
        }
        if stun::is_binding_request(datagram) {
            if let Some(response) = stun::binding_response(datagram, from) {
                trace!(peer = %from, "answering STUN binding request");
                self.send(SendData::new(
                    Tuple::new(from, TransportType::Udp),
                    Bytes::from(response),
                    "",
                ));
            }
            return;
        }
        if stun::is_binding_response(datagram) {
            match stun::mapped_address(datagram) {
                Some(mapped) => {
                    debug!(server = %from, %mapped, "STUN mapped address");
                    self.base.set_stun_result(mapped);
                }
                None => debug!(server = %from, "unusable STUN response"),
            }
            return;
        }

        let source = self.base.peer_tuple(from);
        if let Some(reply) = self.base.receive(datagram, source) {
            self.send(reply);
        }
    }
}

impl Transport for UdpTransport {
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
            self.process_tx();
        }
        if readable {
            self.process_rx();
        }
        self.update_interest(registry);
    }

    fn process(&mut self, registry: &Registry) {
        if !self.write_blocked {
            self.process_tx();
        }
        if self.rx_pending {
            self.process_rx();
        }
        self.update_interest(registry);
    }

    fn time_till_next_process(&self) -> Option<Duration> {
        self.rx_pending.then_some(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use mio::Poll;
    use voxstack_sip_core::{parse_message, StatusCode};

    use super::*;
    use crate::events::TransportEvent;
    use crate::transport::test_support::*;
    use crate::tuple::TransportKey;

    fn bind(sink: Arc<RecordingSink>, key: TransportKey) -> UdpTransport {
        let mut t = UdpTransport::bind(
            "127.0.0.1",
            0,
            IpVersion::V4,
            TransportOptions::default(),
            sink,
        )
        .unwrap();
        t.set_key(key);
        t
    }

    #[test]
    fn test_udp_loopback_delivery() {
        let mut poll = Poll::new().unwrap();
        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());
        let mut a = bind(sink_a.clone(), 1);
        let mut b = bind(sink_b.clone(), 2);
        a.register(poll.registry()).unwrap();
        b.register(poll.registry()).unwrap();

        let dest = Tuple::new(b.local_addr(), TransportType::Udp);
        a.send(SendData::new(dest, Bytes::from_static(OPTIONS), "tid-1"));

        assert!(pump(&mut poll, &mut [&mut a, &mut b], || !sink_b.events.lock().is_empty()));
        let events = sink_b.take();
        match &events[0] {
            TransportEvent::MessageReceived { message, source, .. } => {
                assert_eq!(message.call_id(), Some("call-1"));
                assert_eq!(source.socket_addr(), a.local_addr());
                assert_eq!(source.transport_key(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(sink_a.take().is_empty());
    }

    #[test]
    fn test_keepalive_and_oversize_are_dropped() {
        let mut poll = Poll::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut b = UdpTransport::bind(
            "127.0.0.1",
            0,
            IpVersion::V4,
            TransportOptions {
                max_datagram_size: 64,
                ..TransportOptions::default()
            },
            sink.clone(),
        )
        .unwrap();
        b.set_key(1);
        b.register(poll.registry()).unwrap();

        let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"\r\n\r\n", b.local_addr()).unwrap();
        raw.send_to(OPTIONS, b.local_addr()).unwrap();

        assert!(!pump_for(&mut poll, &mut [&mut b], Duration::from_millis(300), || {
            !sink.events.lock().is_empty()
        }));
    }

    #[test]
    fn test_one_datagram_per_cycle_still_drains_socket() {
        let mut poll = Poll::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut b = UdpTransport::bind(
            "127.0.0.1",
            0,
            IpVersion::V4,
            TransportOptions {
                rx_all: false,
                ..TransportOptions::default()
            },
            sink.clone(),
        )
        .unwrap();
        b.set_key(1);
        b.register(poll.registry()).unwrap();

        let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..3 {
            raw.send_to(OPTIONS, b.local_addr()).unwrap();
        }

        assert!(pump(&mut poll, &mut [&mut b], || sink.events.lock().len() == 3));
    }

    #[test]
    fn test_stun_round_trip() {
        let mut poll = Poll::new().unwrap();
        let mut a = bind(Arc::new(RecordingSink::default()), 1);
        let mut b = bind(Arc::new(RecordingSink::default()), 2);
        a.register(poll.registry()).unwrap();
        b.register(poll.registry()).unwrap();

        a.stun_send_test(b.local_addr());
        pump_for(&mut poll, &mut [&mut a, &mut b], Duration::from_millis(500), || false);
        assert_eq!(a.stun_result(), Some(a.local_addr()));
    }

    #[test]
    fn test_bad_request_answered_over_same_socket() {
        let mut poll = Poll::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut b = bind(sink.clone(), 1);
        b.register(poll.registry()).unwrap();

        let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        raw.send_to(
            b"OPTIONS sip:b@h SIP/2.0\r\nVia: SIP/2.0/UDP h;branch=z9hG4bKx\r\n\
To: <sip:b@h>\r\nCall-ID: c\r\nCSeq: 1 OPTIONS\r\n\r\n",
            b.local_addr(),
        )
        .unwrap();

        pump_for(&mut poll, &mut [&mut b], Duration::from_millis(300), || false);
        let mut buf = [0u8; 2048];
        let (len, _) = raw.recv_from(&mut buf).unwrap();
        let reply = parse_message(&buf[..len]).unwrap();
        assert_eq!(reply.status(), Some(StatusCode::BAD_REQUEST));
        assert!(sink.take().is_empty());
    }
}
