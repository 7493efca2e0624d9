//! Controller tests over real loopback UDP
//!
//! The far end is a plain `std::net::UdpSocket` that plays the peer by hand,
//! so every byte the controller puts on the wire is visible to the test.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serial_test::serial;

use voxstack_sip_core::{
    generate_branch, generate_tag, make_response, parse_message, CSeq, Header, Message, Method,
    NameAddr, Request, StatusCode, Uri, Via,
};
use voxstack_sip_transport::{
    FailureReason, GeneralCongestionManager, IpVersion, LiteralResolver, MetricType,
    TransportOptions, TransportSelector, UdpTransport,
};
use voxstack_transaction_core::{
    ControllerQueue, TimerSettings, TransactionController, TransactionFailure, TransactionUser,
    TuEvent, STATE_MACHINE_FIFO,
};

#[derive(Default)]
struct RecordingTu {
    events: Mutex<Vec<TuEvent>>,
}

impl RecordingTu {
    fn snapshot(&self) -> Vec<TuEvent> {
        self.events.lock().clone()
    }

    fn requests(&self) -> Vec<(String, Message)> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                TuEvent::Request { tid, message, .. } => Some((tid, message)),
                _ => None,
            })
            .collect()
    }

    fn responses(&self) -> Vec<(String, Message)> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                TuEvent::Response { tid, message, .. } => Some((tid, message)),
                _ => None,
            })
            .collect()
    }

    fn failures(&self) -> Vec<(TransactionFailure, Option<Message>)> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                TuEvent::Failure { reason, response, .. } => Some((reason, response)),
                _ => None,
            })
            .collect()
    }
}

impl TransactionUser for RecordingTu {
    fn deliver(&self, event: TuEvent) {
        self.events.lock().push(event);
    }
}

/// A hand-driven SIP peer on a loopback UDP socket
struct Peer {
    socket: UdpSocket,
}

impl Peer {
    fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        Peer { socket }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    fn send(&self, bytes: &[u8], port: u16) {
        self.socket.send_to(bytes, ("127.0.0.1", port)).unwrap();
    }

    fn drain(&self) -> Vec<Message> {
        let mut buf = [0u8; 8192];
        let mut out = Vec::new();
        while let Ok((n, _)) = self.socket.recv_from(&mut buf) {
            if let Ok(message) = parse_message(&buf[..n]) {
                out.push(message);
            }
        }
        out
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn stack(tu: Arc<RecordingTu>, settings: TimerSettings) -> (TransactionController, u16) {
    init_logging();
    let mut selector = TransportSelector::new(Box::new(LiteralResolver::new())).unwrap();
    let queue = ControllerQueue::new(selector.waker(), 0);
    let udp = UdpTransport::bind("127.0.0.1", 0, IpVersion::V4, TransportOptions::default(), queue.clone()).unwrap();
    let port = udp.local_addr().port();
    selector.add_transport(Box::new(udp)).unwrap();
    (TransactionController::new(selector, queue, tu, settings), port)
}

fn pump_for(controller: &mut TransactionController, limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        controller.process(Duration::from_millis(5)).unwrap();
        if done() {
            return true;
        }
    }
    done()
}

fn pump(controller: &mut TransactionController, done: impl FnMut() -> bool) -> bool {
    pump_for(controller, Duration::from_secs(3), done)
}

fn outbound(method: Method, uri: Uri) -> Request {
    Request::new(method.clone(), uri)
        .with_header(Header::Via(Via::new("UDP", generate_branch())))
        .with_header(Header::From(
            NameAddr::new(Uri::sip("example.com").with_user("alice")).with_tag(generate_tag()),
        ))
        .with_header(Header::To(NameAddr::new(Uri::sip("example.com").with_user("bob"))))
        .with_header(Header::CallId(format!("{}@example.com", generate_tag())))
        .with_header(Header::CSeq(CSeq::new(1, method)))
        .with_header(Header::MaxForwards(70))
}

fn inbound(method: &str, cseq_method: &str, branch: &str, peer_port: u16) -> Vec<u8> {
    format!(
        "{method} sip:bob@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{peer_port};branch={branch}\r\n\
From: <sip:alice@example.com>;tag=111\r\n\
To: <sip:bob@example.com>\r\n\
Call-ID: call-{branch}\r\n\
CSeq: 1 {cseq_method}\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n"
    )
    .into_bytes()
}

#[test]
#[serial]
fn test_client_request_gets_response() {
    let tu = Arc::new(RecordingTu::default());
    let (mut controller, port) = stack(tu.clone(), TimerSettings::default());
    let peer = Peer::new();

    let request = outbound(Method::Options, Uri::sip("127.0.0.1").with_user("bob").with_port(peer.port()));
    let tid = Message::from(request.clone()).transaction_id().unwrap();
    controller.handle().send(request.into(), None).unwrap();

    let mut seen = Vec::new();
    assert!(pump(&mut controller, || {
        seen.extend(peer.drain());
        !seen.is_empty()
    }));
    let on_wire = seen[0].as_request().unwrap().clone();
    let via = Message::from(on_wire.clone()).top_via().cloned().unwrap();
    assert_eq!(via.sent_host, "127.0.0.1");
    assert_eq!(via.sent_port, Some(port));

    let ok = make_response(&on_wire, StatusCode::OK, None);
    peer.send(&Message::from(ok).to_bytes(), port);
    assert!(pump(&mut controller, || !tu.responses().is_empty()));

    let responses = tu.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].0, tid);
    assert_eq!(responses[0].1.status(), Some(StatusCode::OK));
    assert!(tu.failures().is_empty());
}

#[test]
#[serial]
fn test_server_delivers_once_and_replays_final_response() {
    let tu = Arc::new(RecordingTu::default());
    let (mut controller, port) = stack(tu.clone(), TimerSettings::default());
    let peer = Peer::new();
    let options = inbound("OPTIONS", "OPTIONS", "z9hG4bKdup1", peer.port());

    for _ in 0..3 {
        peer.send(&options, port);
    }
    assert!(pump(&mut controller, || !tu.requests().is_empty()));
    pump_for(&mut controller, Duration::from_millis(100), || false);
    let requests = tu.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "z9hG4bKdup1");
    assert_eq!(controller.server_transaction_count(), 1);

    let ok = make_response(requests[0].1.as_request().unwrap(), StatusCode::OK, None);
    controller.handle().send(ok.into(), None).unwrap();
    let mut finals = Vec::new();
    assert!(pump(&mut controller, || {
        finals.extend(peer.drain());
        !finals.is_empty()
    }));

    peer.send(&options, port);
    peer.send(&options, port);
    assert!(pump(&mut controller, || {
        finals.extend(peer.drain());
        finals.len() >= 3
    }));
    assert!(finals.iter().all(|m| m.status() == Some(StatusCode::OK)));
    assert_eq!(tu.requests().len(), 1);
}

#[test]
#[serial]
fn test_cancel_answered_200_or_481() {
    let tu = Arc::new(RecordingTu::default());
    let (mut controller, port) = stack(tu.clone(), TimerSettings::default());
    let peer = Peer::new();

    peer.send(&inbound("INVITE", "INVITE", "z9hG4bKinv1", peer.port()), port);
    let mut seen = Vec::new();
    // the transaction answers 100 Trying itself when the TU stays silent
    assert!(pump(&mut controller, || {
        seen.extend(peer.drain());
        seen.iter().any(|m| m.status() == Some(StatusCode::TRYING))
    }));

    peer.send(&inbound("CANCEL", "CANCEL", "z9hG4bKinv1", peer.port()), port);
    assert!(pump(&mut controller, || {
        seen.extend(peer.drain());
        seen.iter()
            .any(|m| m.status() == Some(StatusCode::OK) && m.method() == Some(Method::Cancel))
    }));
    let cancels: Vec<_> = tu
        .requests()
        .into_iter()
        .filter(|(_, m)| m.method() == Some(Method::Cancel))
        .collect();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].0, "z9hG4bKinv1");

    peer.send(&inbound("CANCEL", "CANCEL", "z9hG4bKnone", peer.port()), port);
    assert!(pump(&mut controller, || {
        seen.extend(peer.drain());
        seen.iter()
            .any(|m| m.status() == Some(StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST))
    }));
}

#[test]
#[serial]
fn test_unanswered_request_retransmits_then_times_out() {
    let tu = Arc::new(RecordingTu::default());
    let settings = TimerSettings {
        t1: Duration::from_millis(10),
        t2: Duration::from_millis(40),
        t4: Duration::from_millis(50),
        ..TimerSettings::default()
    };
    let (mut controller, _port) = stack(tu.clone(), settings);
    let peer = Peer::new();

    let request = outbound(Method::Options, Uri::sip("127.0.0.1").with_user("bob").with_port(peer.port()));
    controller.handle().send(request.into(), None).unwrap();

    let mut copies = 0;
    assert!(pump(&mut controller, || {
        copies += peer.drain().len();
        !tu.failures().is_empty()
    }));
    pump_for(&mut controller, Duration::from_millis(100), || false);

    let failures = tu.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, TransactionFailure::Timeout);
    assert_eq!(failures[0].1.as_ref().and_then(|r| r.status()), Some(StatusCode::REQUEST_TIMEOUT));
    assert!(copies >= 4, "only {} copies on the wire", copies);
    assert_eq!(controller.client_transaction_count(), 0);
}

#[test]
#[serial]
fn test_no_matching_transport_fails_with_503() {
    let tu = Arc::new(RecordingTu::default());
    let (mut controller, _port) = stack(tu.clone(), TimerSettings::default());

    let uri = Uri::sip("127.0.0.1").with_user("bob").with_port(5099).with_param("transport", Some("tcp"));
    controller.handle().send(outbound(Method::Options, uri).into(), None).unwrap();
    assert!(pump(&mut controller, || !tu.failures().is_empty()));

    let (reason, response) = tu.failures().remove(0);
    assert_eq!(reason, TransactionFailure::TransportFailure(FailureReason::NoTransport));
    let response = response.unwrap();
    assert_eq!(response.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert!(response.header_value("Warning").unwrap().starts_with("399 "));
}

#[test]
fn test_congested_controller_refuses_requests_but_not_acks() {
    let tu = Arc::new(RecordingTu::default());
    let (controller, _port) = stack(tu.clone(), TimerSettings::default());
    let manager = GeneralCongestionManager::new();
    manager.set_tolerance(STATE_MACHINE_FIFO, MetricType::Size, 1);
    controller.queue().set_congestion_manager(manager.clone());

    let handle = controller.handle();
    let uri = Uri::sip("127.0.0.1").with_user("bob");
    handle.send(outbound(Method::Options, uri.clone()).into(), None).unwrap();
    assert_eq!(controller.queue().len(), 1);

    handle.send(outbound(Method::Invite, uri.clone()).into(), None).unwrap();
    assert_eq!(controller.queue().len(), 1);
    let failures = tu.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, TransactionFailure::Congested);
    let response = failures[0].1.as_ref().unwrap();
    assert_eq!(response.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert!(response.retry_after().unwrap() >= 1);

    handle.send(outbound(Method::Ack, uri).into(), None).unwrap();
    assert_eq!(controller.queue().len(), 2);
}
