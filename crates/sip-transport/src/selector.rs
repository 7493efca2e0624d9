//! # Transport selector
//!
//! Owns every registered transport and decides which one carries an
//! outbound message. Lookups go through a set of indexes built when a
//! transport is added:
//!
//! | index                     | key                                  | holds                             |
//! |---------------------------|--------------------------------------|-----------------------------------|
//! | exact                     | bound tuple                          | specific-interface transports     |
//! | any-interface             | (type, port, family)                 | wildcard-bound transports         |
//! | any-port                  | (type, address)                      | specific-interface, newest last   |
//! | any-port, any-interface   | (type, family)                       | wildcard-bound, newest last       |
//! | secure                    | (domain, type, family)               | TLS and DTLS transports           |
//! | by type                   | type                                 | everything                        |
//!
//! Resolving a source tuple tries, in order: exact match, a loopback match
//! within 127/8, then the any-interface index. A source without a port uses
//! the any-port indexes instead, where the most recently added transport wins.
//!
//! The selector also owns the [`mio::Poll`] that drives every transport not
//! running its own thread, plus the [`Waker`] other threads use to interrupt it.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Waker};
use tracing::{debug, info, trace, warn};

use voxstack_sip_core::{Message, NameAddr, Uri, Via};

use crate::dns::{DnsHandler, DnsResolver, DnsResultHandle, DnsState};
use crate::error::{LookupError, Result};
use crate::events::FailureReason;
use crate::send_data::SendData;
use crate::transport::{split_token, Transport, WAKER_TOKEN};
use crate::tuple::{
    AnyInterfaceKey, AnyPortAnyInterfaceKey, AnyPortKey, IpVersion, TlsTransportKey, TransportKey,
    TransportType, Tuple,
};

/// Weight of the newest sample in the message size average, as 1/N
const SIZE_AVERAGE_WINDOW: usize = 16;

pub struct TransportSelector {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    transports: BTreeMap<TransportKey, Box<dyn Transport>>,
    next_key: TransportKey,
    exact: BTreeMap<Tuple, TransportKey>,
    any_interface: BTreeMap<AnyInterfaceKey, TransportKey>,
    any_port: BTreeMap<AnyPortKey, Vec<TransportKey>>,
    any_port_any_interface: BTreeMap<AnyPortAnyInterfaceKey, Vec<TransportKey>>,
    secure: BTreeMap<TlsTransportKey, TransportKey>,
    by_type: BTreeMap<TransportType, Vec<TransportKey>>,
    avg_message_size: usize,
    dns: Box<dyn DnsResolver>,
}

impl TransportSelector {
    pub fn new(dns: Box<dyn DnsResolver>) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(TransportSelector {
            poll,
            events: Events::with_capacity(1024),
            waker,
            transports: BTreeMap::new(),
            next_key: 1,
            exact: BTreeMap::new(),
            any_interface: BTreeMap::new(),
            any_port: BTreeMap::new(),
            any_port_any_interface: BTreeMap::new(),
            secure: BTreeMap::new(),
            by_type: BTreeMap::new(),
            avg_message_size: 0,
            dns,
        })
    }

    /// Interrupts a blocked [`TransportSelector::process`] from any thread
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn dns(&mut self) -> &mut dyn DnsResolver {
        self.dns.as_mut()
    }

    pub fn create_dns_result(&self, tid: &str, handler: Arc<dyn DnsHandler>) -> DnsResultHandle {
        self.dns.create_result(tid, handler)
    }

    pub fn dns_resolve(&mut self, result: &DnsResultHandle, target: &Uri) -> DnsState {
        self.dns.lookup(result, target)
    }

    /// Registers a transport and returns its key. Transports that run their
    /// own thread are started here; the rest join the shared poll loop.
    pub fn add_transport(&mut self, mut transport: Box<dyn Transport>) -> Result<TransportKey> {
        let key = self.next_key;
        transport.set_key(key);

        if transport.runs_own_thread() {
            transport.start_own_thread()?;
        } else {
            transport.register(self.poll.registry())?;
            transport.base().tx().set_waker(self.waker.clone());
        }
        self.next_key += 1;

        let tuple = transport.tuple().clone();
        info!(
            key,
            transport = %tuple,
            interface = transport.interface(),
            own_thread = transport.runs_own_thread(),
            "transport added"
        );

        self.by_type.entry(tuple.transport_type()).or_default().push(key);
        if tuple.transport_type().is_secure() {
            self.secure.insert(
                TlsTransportKey {
                    domain: transport.tls_domain().to_ascii_lowercase(),
                    transport_type: tuple.transport_type(),
                    ip_version: tuple.ip_version(),
                },
                key,
            );
        } else if tuple.is_any_interface() {
            self.any_interface.insert(AnyInterfaceKey::from(&tuple), key);
        } else {
            self.exact.insert(tuple, key);
        }
        self.transports.insert(key, transport);
        self.rebuild_any_port_maps();
        Ok(key)
    }

    /// Unregisters a transport and hands it back
    pub fn remove_transport(&mut self, key: TransportKey) -> Option<Box<dyn Transport>> {
        let mut transport = self.transports.remove(&key)?;
        if !transport.runs_own_thread() {
            if let Err(e) = transport.deregister(self.poll.registry()) {
                warn!(key, "failed to deregister transport: {}", e);
            }
        }
        self.exact.retain(|_, k| *k != key);
        self.any_interface.retain(|_, k| *k != key);
        self.secure.retain(|_, k| *k != key);
        for keys in self.by_type.values_mut() {
            keys.retain(|k| *k != key);
        }
        self.by_type.retain(|_, keys| !keys.is_empty());
        self.rebuild_any_port_maps();
        info!(key, transport = %transport.tuple(), "transport removed");
        Some(transport)
    }

    /// Rebuilds both any-port indexes from the surviving transports in
    /// registration order, so the newest entry is always last
    fn rebuild_any_port_maps(&mut self) {
        self.any_port.clear();
        self.any_port_any_interface.clear();
        for (key, transport) in &self.transports {
            let tuple = transport.tuple();
            if tuple.transport_type().is_secure() {
                continue;
            }
            if tuple.is_any_interface() {
                self.any_port_any_interface
                    .entry(AnyPortAnyInterfaceKey::from(tuple))
                    .or_default()
                    .push(*key);
            } else {
                self.any_port.entry(AnyPortKey::from(tuple)).or_default().push(*key);
            }
        }
    }

    pub fn find_transport_by_key(&self, key: TransportKey) -> Option<&dyn Transport> {
        self.transports.get(&key).map(|t| t.as_ref())
    }

    pub fn transports(&self) -> impl Iterator<Item = &dyn Transport> {
        self.transports.values().map(|t| t.as_ref())
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub fn has_transports(&self) -> bool {
        !self.transports.is_empty()
    }

    /// Points `search` at the found transport: its key, and its address and
    /// port unless it is wildcard-bound
    fn patch(&self, search: &mut Tuple, key: TransportKey) -> Option<TransportKey> {
        let found = self.transports.get(&key)?.tuple();
        if found.is_any_interface() {
            search.set_port(found.port());
            search.set_transport_key(key);
        } else {
            let domain = search.target_domain().to_string();
            *search = found.clone();
            if !domain.is_empty() {
                search.set_target_domain(domain);
            }
        }
        Some(key)
    }

    /// Finds the transport bound to a local source tuple. On success the
    /// tuple is patched with the transport's key (and port, when it had none).
    pub fn find_transport_by_source(&self, search: &mut Tuple) -> Option<TransportKey> {
        let transport_type = search.transport_type();
        if transport_type.is_secure() {
            let key = self.find_tls_transport(search.target_domain(), transport_type, search.ip_version())?;
            return self.patch(search, key);
        }

        if search.port() != 0 {
            if let Some(&key) = self.exact.get(search) {
                trace!(%search, key, "exact source match");
                return self.patch(search, key);
            }
            if search.is_loopback() {
                if let Some((_, &key)) = self
                    .exact
                    .iter()
                    .find(|(t, _)| t.is_loopback() && t.is_equal_with_mask(search, 8, false, false))
                {
                    trace!(%search, key, "loopback source match");
                    return self.patch(search, key);
                }
            }
            if let Some(&key) = self.any_interface.get(&AnyInterfaceKey::from(&*search)) {
                trace!(%search, key, "any-interface source match");
                return self.patch(search, key);
            }
            return None;
        }

        if let Some(&key) = self.any_port.get(&AnyPortKey::from(&*search)).and_then(|k| k.last()) {
            trace!(%search, key, "any-port source match");
            return self.patch(search, key);
        }
        if search.is_loopback() {
            if let Some((_, &key)) = self
                .exact
                .iter()
                .rev()
                .find(|(t, _)| t.is_loopback() && t.is_equal_with_mask(search, 8, true, false))
            {
                trace!(%search, key, "loopback any-port source match");
                return self.patch(search, key);
            }
        }
        if let Some(&key) = self
            .any_port_any_interface
            .get(&AnyPortAnyInterfaceKey::from(&*search))
            .and_then(|k| k.last())
        {
            trace!(%search, key, "any-port any-interface source match");
            return self.patch(search, key);
        }
        None
    }

    /// Secure transport serving `domain`. An empty domain selects the
    /// default: the one registered without a domain, else the only one.
    pub fn find_tls_transport(
        &self,
        domain: &str,
        transport_type: TransportType,
        ip_version: IpVersion,
    ) -> Option<TransportKey> {
        let domain = domain.to_ascii_lowercase();
        let wanted = TlsTransportKey {
            domain: domain.clone(),
            transport_type,
            ip_version,
        };
        if let Some(&key) = self.secure.get(&wanted) {
            return Some(key);
        }
        if !domain.is_empty() {
            return None;
        }
        let mut candidates = self
            .secure
            .iter()
            .filter(|(k, _)| k.transport_type == transport_type && k.ip_version == ip_version);
        match (candidates.next(), candidates.next()) {
            (Some((_, &key)), None) => Some(key),
            _ => None,
        }
    }

    /// Transport able to reach `target`.
    ///
    /// A transport key on the target wins outright, then a stream transport
    /// with an open connection to the target. Otherwise a secure type
    /// takes the default secure transport, and a plain type takes the single
    /// transport of that type and family; with several candidates the local
    /// interface routing to the target decides.
    pub fn find_transport_by_dest(&self, target: &Tuple) -> std::result::Result<TransportKey, LookupError> {
        if target.transport_key() != 0 {
            return if self.transports.contains_key(&target.transport_key()) {
                Ok(target.transport_key())
            } else {
                Err(LookupError::NoTransport(target.to_string()))
            };
        }

        let transport_type = target.transport_type();
        if let Some(key) = self.find_connected_transport(target) {
            trace!(%target, key, "reusing existing connection");
            return Ok(key);
        }
        if transport_type.is_secure() {
            return self
                .find_tls_transport("", transport_type, target.ip_version())
                .ok_or_else(|| LookupError::NoTransport(target.to_string()));
        }

        let candidates: Vec<TransportKey> = self
            .by_type
            .get(&transport_type)
            .map(|keys| {
                keys.iter()
                    .copied()
                    .filter(|k| {
                        self.transports
                            .get(k)
                            .is_some_and(|t| t.tuple().ip_version() == target.ip_version())
                    })
                    .collect()
            })
            .unwrap_or_default();
        match candidates.as_slice() {
            [] => Err(LookupError::NoTransport(target.to_string())),
            [only] => Ok(*only),
            _ => {
                let mut source = determine_source_interface(target)?;
                self.find_transport_by_source(&mut source)
                    .ok_or_else(|| LookupError::NoTransport(target.to_string()))
            }
        }
    }

    /// Stream transport of the target's type already connected to it
    fn find_connected_transport(&self, target: &Tuple) -> Option<TransportKey> {
        if !target.transport_type().is_stream_oriented() {
            return None;
        }
        let peer = target.socket_addr();
        self.by_type
            .get(&target.transport_type())?
            .iter()
            .copied()
            .find(|k| self.transports.get(k).is_some_and(|t| t.has_connection_to(peer)))
    }

    /// Transport matching the sent-by of a Via the application already filled in
    pub fn find_transport_by_via(&self, via: &Via, target: &Tuple) -> std::result::Result<TransportKey, LookupError> {
        let port = via.sent_port.unwrap_or(0);
        let mut source = match via.sent_host.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => Tuple::from_ip(ip, port, target.transport_type()),
            _ => {
                let mut source = determine_source_interface(target)?;
                source.set_port(port);
                source
            }
        };
        if target.transport_type().is_secure() {
            source.set_target_domain(target.target_domain());
        }
        self.find_transport_by_source(&mut source)
            .ok_or_else(|| LookupError::NoTransport(source.to_string()))
    }

    /// Encodes and queues `message` for `target`.
    ///
    /// Requests get their blank Via sent-by, Contact, Record-Route and
    /// Referred-By hosts filled in from the chosen transport. Returns the
    /// queued [`SendData`] so the caller can retransmit it.
    pub fn transmit(
        &mut self,
        message: &mut Message,
        target: &Tuple,
        tid: &str,
    ) -> std::result::Result<SendData, FailureReason> {
        let lookup = if target.transport_key() != 0 || message.is_response() {
            self.find_transport_by_dest(target)
        } else {
            match message.top_via() {
                Some(via) if !via.sent_host.is_empty() => self.find_transport_by_via(via, target),
                _ => self.find_transport_by_dest(target),
            }
        };
        let key = lookup.map_err(|e| {
            debug!(tid, %target, error = %e, "no transport for message");
            e.failure_reason()
        })?;

        let Some(transport) = self.transports.get(&key) else {
            return Err(FailureReason::NoTransport);
        };
        if transport.base().is_shutting_down() {
            return Err(FailureReason::TransportShutdown);
        }

        if message.is_request() {
            let local = transport.tuple();
            let ip = if local.is_any_interface() {
                determine_source_interface(target)
                    .map(|t| t.ip())
                    .unwrap_or_else(|_| local.ip())
            } else {
                local.ip()
            };
            fill_local_address(message, local.transport_type(), ip, local.port());
        }

        let data = message.to_bytes();
        let size = data.len();
        let destination = target.clone().with_transport_key(key);
        let send = SendData::new(destination, data, tid);
        trace!(tid, %target, msg = %message.brief(), "transmitting");
        transport.send(send.clone());
        self.record_message_size(size);
        Ok(send)
    }

    /// Queues an already encoded message again, on the transport it went out on
    pub fn retransmit(&self, send: &SendData) -> std::result::Result<(), FailureReason> {
        match self.transports.get(&send.destination.transport_key()) {
            Some(transport) => {
                transport.send(send.clone());
                Ok(())
            }
            None => Err(FailureReason::NoTransport),
        }
    }

    /// Asks the owning stream transport to close its connection to `peer`
    pub fn close_connection(&self, peer: &Tuple) {
        let key = match peer.transport_key() {
            0 => self.find_transport_by_dest(peer).ok(),
            key => Some(key),
        };
        if let Some(transport) = key.and_then(|k| self.transports.get(&k)) {
            if transport.is_stream_oriented() || transport.transport_type() == TransportType::Dtls {
                transport.send(SendData::close_connection(peer.clone()));
            }
        }
    }

    fn record_message_size(&mut self, len: usize) {
        self.avg_message_size = if self.avg_message_size == 0 {
            len
        } else {
            (self.avg_message_size * (SIZE_AVERAGE_WINDOW - 1) + len) / SIZE_AVERAGE_WINDOW
        };
    }

    /// Moving average of encoded message sizes
    pub fn average_message_size(&self) -> usize {
        self.avg_message_size
    }

    /// Messages waiting in every transport's outbound queue
    pub fn sum_transport_fifo_sizes(&self) -> usize {
        self.transports.values().map(|t| t.fifo_size()).sum()
    }

    pub fn has_data_to_send(&self) -> bool {
        self.transports
            .values()
            .any(|t| !t.runs_own_thread() && t.has_data_to_send())
    }

    /// How long [`TransportSelector::process`] may block before a shared transport needs service
    pub fn time_till_next_process(&self) -> Option<Duration> {
        if self.has_data_to_send() {
            return Some(Duration::ZERO);
        }
        self.transports
            .values()
            .filter(|t| !t.runs_own_thread())
            .filter_map(|t| t.time_till_next_process())
            .min()
    }

    /// Waits up to `timeout` for socket readiness, then services every
    /// transport on the shared loop
    pub fn process(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        let ready: Vec<_> = self
            .events
            .iter()
            .filter(|e| e.token() != WAKER_TOKEN)
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        let registry = self.poll.registry();
        for (token, readable, writable) in ready {
            let (key, _) = split_token(token);
            if let Some(transport) = self.transports.get_mut(&key) {
                transport.handle_event(registry, token, readable, writable);
            }
        }
        for transport in self.transports.values_mut() {
            if !transport.runs_own_thread() {
                transport.process(registry);
            }
        }
        if self.dns.requires_process() {
            self.dns.process();
        }
        Ok(())
    }

    /// Wakes the threads of transports that run their own loop and have
    /// queued data
    pub fn poke(&self) {
        for transport in self.transports.values() {
            if transport.runs_own_thread() && transport.fifo_size() > 0 {
                transport.poke();
            }
        }
    }

    /// Interrupts a [`TransportSelector::process`] blocked in poll
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake selector: {}", e);
        }
    }

    pub fn shutdown(&mut self) {
        for transport in self.transports.values_mut() {
            transport.shutdown();
        }
    }

    pub fn is_finished_shutdown(&self) -> bool {
        self.transports.values().all(|t| t.is_finished_shutdown())
    }

    /// Drops every transport, stopping their threads
    pub fn clear(&mut self) {
        let keys: Vec<TransportKey> = self.transports.keys().copied().collect();
        for key in keys {
            self.remove_transport(key);
        }
    }
}

/// Local interface the OS would use to reach `dest`, port left at 0.
///
/// Uses a connected UDP socket, which only consults the routing table and
/// sends nothing.
pub fn determine_source_interface(dest: &Tuple) -> std::result::Result<Tuple, LookupError> {
    let mut target = dest.socket_addr();
    if target.port() == 0 {
        target.set_port(dest.transport_type().default_port());
    }
    let no_route = |e: io::Error| {
        debug!(%target, error = %e, "no route to destination");
        LookupError::NoRoute(target)
    };
    let socket = std::net::UdpSocket::bind(SocketAddr::new(dest.ip_version().any(), 0)).map_err(no_route)?;
    socket.connect(target).map_err(no_route)?;
    let local = socket.local_addr().map_err(no_route)?;
    Ok(Tuple::from_ip(local.ip(), 0, dest.transport_type()))
}

fn fill_name_addr(addr: &mut NameAddr, transport_type: TransportType, ip: IpAddr, port: u16) {
    if !addr.uri.host.is_empty() {
        return;
    }
    addr.uri.host = ip.to_string();
    addr.uri.port = Some(port);
    if transport_type != TransportType::Udp && addr.uri.transport_param().is_none() {
        addr.uri
            .params
            .set("transport", Some(transport_type.as_str().to_ascii_lowercase()));
    }
}

/// Completes the blank local-address fields of an outbound request
fn fill_local_address(message: &mut Message, transport_type: TransportType, ip: IpAddr, port: u16) {
    if let Some(via) = message.top_via_mut() {
        via.transport = transport_type.as_str().to_string();
        if via.sent_host.is_empty() {
            via.sent_host = ip.to_string();
            via.sent_port = Some(port);
        }
    }
    // several Contacts are the application's own list; leave them alone
    let mut contacts: Vec<&mut NameAddr> = message.contacts_mut().collect();
    if let [contact] = contacts.as_mut_slice() {
        fill_name_addr(contact, transport_type, ip, port);
    }
    if let Some(record_route) = message.record_routes_mut().next() {
        fill_name_addr(record_route, transport_type, ip, port);
    }
    if let Some(referred_by) = message.referred_by_mut() {
        fill_name_addr(referred_by, transport_type, ip, port);
    }
}

impl std::fmt::Debug for TransportSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSelector")
            .field("transports", &self.transports.len())
            .field("avg_message_size", &self.avg_message_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use voxstack_sip_core::{
        generate_branch, parse_message, CSeq, Header, Method, Request, Uri,
    };

    use mio::{Registry, Token};

    use super::*;
    use crate::dns::LiteralResolver;
    use crate::transport::test_support::RecordingSink;
    use crate::transport::udp::UdpTransport;
    use crate::transport::{TransportBase, TransportOptions};

    /// Transport that owns no socket, for exercising the indexes at fixed addresses
    struct FakeTransport {
        base: TransportBase,
        peers: Vec<SocketAddr>,
    }

    impl Transport for FakeTransport {
        fn base(&self) -> &TransportBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut TransportBase {
            &mut self.base
        }

        fn register(&mut self, _registry: &Registry) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
            Ok(())
        }

        fn handle_event(&mut self, _registry: &Registry, _token: Token, _readable: bool, _writable: bool) {}

        fn process(&mut self, _registry: &Registry) {}

        fn connected_peers(&self) -> Vec<SocketAddr> {
            self.peers.clone()
        }
    }

    fn fake(ip: &str, port: u16, transport_type: TransportType) -> Box<dyn Transport> {
        fake_connected(ip, port, transport_type, &[])
    }

    fn fake_connected(ip: &str, port: u16, transport_type: TransportType, peers: &[&str]) -> Box<dyn Transport> {
        let tuple = Tuple::parse(ip, port, transport_type).unwrap();
        let interface = if tuple.is_any_interface() { "" } else { ip };
        Box::new(FakeTransport {
            base: TransportBase::new(
                tuple,
                interface,
                TransportOptions::default(),
                Arc::new(RecordingSink::default()),
            ),
            peers: peers.iter().map(|p| p.parse().unwrap()).collect(),
        })
    }

    fn selector() -> TransportSelector {
        TransportSelector::new(Box::new(LiteralResolver::new())).unwrap()
    }

    fn udp(interface: &str) -> Box<dyn Transport> {
        Box::new(
            UdpTransport::bind(
                interface,
                0,
                IpVersion::V4,
                TransportOptions::default(),
                Arc::new(RecordingSink::default()),
            )
            .unwrap(),
        )
    }

    fn port_of(sel: &TransportSelector, key: TransportKey) -> u16 {
        sel.find_transport_by_key(key).unwrap().tuple().port()
    }

    fn request() -> Message {
        Request::new(Method::Options, Uri::sip("127.0.0.1").with_user("bob"))
            .with_header(Header::Via(Via::new("UDP", generate_branch())))
            .with_header(Header::From(
                NameAddr::new(Uri::sip("example.com").with_user("alice")).with_tag("a1"),
            ))
            .with_header(Header::To(NameAddr::new(Uri::sip("example.com").with_user("bob"))))
            .with_header(Header::CallId("sel-1".to_string()))
            .with_header(Header::CSeq(CSeq::new(1, Method::Options)))
            .with_header(Header::Contact(NameAddr::new(Uri::sip("").with_user("alice"))))
            .into()
    }

    #[test]
    fn test_exact_then_loopback_then_any_interface() {
        let mut sel = selector();
        let specific = sel.add_transport(udp("127.0.0.1")).unwrap();
        let wildcard = sel.add_transport(udp("")).unwrap();
        let specific_port = port_of(&sel, specific);
        let wildcard_port = port_of(&sel, wildcard);

        let mut exact = Tuple::parse("127.0.0.1", specific_port, TransportType::Udp).unwrap();
        assert_eq!(sel.find_transport_by_source(&mut exact), Some(specific));
        assert_eq!(exact.transport_key(), specific);

        let mut loopback = Tuple::parse("127.0.0.2", specific_port, TransportType::Udp).unwrap();
        assert_eq!(sel.find_transport_by_source(&mut loopback), Some(specific));
        assert_eq!(loopback.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());

        let mut any = Tuple::parse("192.0.2.50", wildcard_port, TransportType::Udp).unwrap();
        assert_eq!(sel.find_transport_by_source(&mut any), Some(wildcard));
        assert_eq!(any.ip(), "192.0.2.50".parse::<IpAddr>().unwrap());

        let mut wrong_type = Tuple::parse("127.0.0.1", specific_port, TransportType::Tcp).unwrap();
        assert_eq!(sel.find_transport_by_source(&mut wrong_type), None);
    }

    #[test]
    fn test_any_port_prefers_newest_and_survives_removal() {
        let mut sel = selector();
        let first = sel.add_transport(udp("127.0.0.1")).unwrap();
        let second = sel.add_transport(udp("127.0.0.1")).unwrap();

        let mut search = Tuple::parse("127.0.0.1", 0, TransportType::Udp).unwrap();
        assert_eq!(sel.find_transport_by_source(&mut search), Some(second));
        assert_eq!(search.port(), port_of(&sel, second));

        assert!(sel.remove_transport(second).is_some());
        let mut search = Tuple::parse("127.0.0.1", 0, TransportType::Udp).unwrap();
        assert_eq!(sel.find_transport_by_source(&mut search), Some(first));
        assert_eq!(sel.transport_count(), 1);
    }

    #[test]
    fn test_exact_beats_wildcard_on_same_port() {
        let mut sel = selector();
        let wildcard = sel.add_transport(fake("0.0.0.0", 5060, TransportType::Udp)).unwrap();
        let exact = sel.add_transport(fake("192.168.1.5", 5060, TransportType::Udp)).unwrap();

        let mut search = Tuple::parse("192.168.1.5", 5060, TransportType::Udp).unwrap();
        assert_eq!(sel.find_transport_by_source(&mut search), Some(exact));
        let mut search = Tuple::parse("10.0.0.9", 5060, TransportType::Udp).unwrap();
        assert_eq!(sel.find_transport_by_source(&mut search), Some(wildcard));
        assert_eq!(search.ip(), "10.0.0.9".parse::<IpAddr>().unwrap());

        // an outbound request whose Via names the specific address
        let mut msg = request();
        if let Some(via) = msg.top_via_mut() {
            via.sent_host = "192.168.1.5".to_string();
            via.sent_port = Some(5060);
        }
        let target = Tuple::parse("192.0.2.80", 5060, TransportType::Udp).unwrap();
        let sent = sel.transmit(&mut msg, &target, "t").unwrap();
        assert_eq!(sent.destination.transport_key(), exact);
    }

    #[test]
    fn test_exact_beats_wildcard_by_destination() {
        let mut sel = selector();
        let wildcard = sel.add_transport(fake("0.0.0.0", 5060, TransportType::Udp)).unwrap();
        let exact = sel.add_transport(fake("127.0.0.1", 5060, TransportType::Udp)).unwrap();

        let target = Tuple::parse("127.0.0.1", 5099, TransportType::Udp).unwrap();
        assert_eq!(sel.find_transport_by_dest(&target), Ok(exact));

        sel.remove_transport(exact);
        assert_eq!(sel.find_transport_by_dest(&target), Ok(wildcard));
    }

    #[test]
    fn test_removal_rebuilds_any_port_indexes() {
        let mut sel = selector();
        let first = sel.add_transport(fake("127.0.0.1", 5070, TransportType::Udp)).unwrap();
        let middle = sel.add_transport(fake("127.0.0.1", 5071, TransportType::Udp)).unwrap();
        let last = sel.add_transport(fake("127.0.0.1", 5072, TransportType::Udp)).unwrap();
        let any_old = sel.add_transport(fake("0.0.0.0", 5080, TransportType::Udp)).unwrap();
        let any_new = sel.add_transport(fake("0.0.0.0", 5081, TransportType::Udp)).unwrap();

        let lookup = |sel: &TransportSelector, ip: &str| {
            let mut search = Tuple::parse(ip, 0, TransportType::Udp).unwrap();
            sel.find_transport_by_source(&mut search).map(|key| (key, search.port()))
        };
        assert_eq!(lookup(&sel, "127.0.0.1"), Some((last, 5072)));
        assert_eq!(lookup(&sel, "10.1.1.1"), Some((any_new, 5081)));

        sel.remove_transport(middle);
        assert_eq!(lookup(&sel, "127.0.0.1"), Some((last, 5072)));
        sel.remove_transport(last);
        assert_eq!(lookup(&sel, "127.0.0.1"), Some((first, 5070)));
        sel.remove_transport(first);
        assert_eq!(lookup(&sel, "127.0.0.1"), Some((any_new, 5081)));

        sel.remove_transport(any_new);
        assert_eq!(lookup(&sel, "10.1.1.1"), Some((any_old, 5080)));
        sel.remove_transport(any_old);
        assert_eq!(lookup(&sel, "10.1.1.1"), None);
        assert!(!sel.has_transports());
    }

    #[test]
    fn test_dest_reuses_open_connection() {
        let mut sel = selector();
        let connected = sel
            .add_transport(fake_connected("127.0.0.1", 5060, TransportType::Tcp, &["192.0.2.9:5060"]))
            .unwrap();
        let _newer = sel.add_transport(fake("127.0.0.1", 5062, TransportType::Tcp)).unwrap();

        let target = Tuple::parse("192.0.2.9", 5060, TransportType::Tcp).unwrap();
        assert_eq!(sel.find_transport_by_dest(&target), Ok(connected));

        // datagram transports have no connections to reuse
        let udp_target = Tuple::parse("127.0.0.1", 5099, TransportType::Udp).unwrap();
        let udp_key = sel
            .add_transport(fake_connected("127.0.0.1", 5064, TransportType::Udp, &["127.0.0.1:5099"]))
            .unwrap();
        let udp_newer = sel.add_transport(fake("127.0.0.1", 5066, TransportType::Udp)).unwrap();
        assert_ne!(udp_key, udp_newer);
        assert_eq!(sel.find_transport_by_dest(&udp_target), Ok(udp_newer));
    }

    #[test]
    fn test_only_single_contact_is_filled() {
        let mut sel = selector();
        sel.add_transport(fake("127.0.0.1", 5060, TransportType::Udp)).unwrap();
        let target = Tuple::parse("127.0.0.1", 5099, TransportType::Udp).unwrap();

        let mut msg = request();
        msg.push_header(Header::Contact(NameAddr::new(Uri::sip("").with_user("carol"))));
        sel.transmit(&mut msg, &target, "t").unwrap();
        assert_eq!(msg.top_via().unwrap().sent_host, "127.0.0.1");
        assert_eq!(msg.contacts().count(), 2);
        assert!(msg.contacts().all(|c| c.uri.host.is_empty()));
    }

    #[test]
    fn test_find_by_dest_single_and_ambiguous() {
        let mut sel = selector();
        let target = Tuple::parse("127.0.0.1", 5099, TransportType::Udp).unwrap();
        assert!(matches!(
            sel.find_transport_by_dest(&target),
            Err(LookupError::NoTransport(_))
        ));

        let only = sel.add_transport(udp("127.0.0.1")).unwrap();
        assert_eq!(sel.find_transport_by_dest(&target), Ok(only));

        // two candidates: the routing table picks 127.0.0.1, newest wins
        let newer = sel.add_transport(udp("127.0.0.1")).unwrap();
        assert_eq!(sel.find_transport_by_dest(&target), Ok(newer));

        let keyed = target.clone().with_transport_key(only);
        assert_eq!(sel.find_transport_by_dest(&keyed), Ok(only));
        let stale = target.with_transport_key(99);
        assert!(sel.find_transport_by_dest(&stale).is_err());
    }

    #[test]
    fn test_transmit_fills_local_address_and_sends() {
        let mut sel = selector();
        let key = sel.add_transport(udp("127.0.0.1")).unwrap();
        let port = port_of(&sel, key);

        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();
        let target = Tuple::new(peer.local_addr().unwrap(), TransportType::Udp);

        let mut msg = request();
        let sent = sel.transmit(&mut msg, &target, "tid-1").unwrap();
        assert_eq!(sent.destination.transport_key(), key);
        assert_eq!(sent.tid, "tid-1");

        let encoded = parse_message(&sent.data).unwrap();
        let via = encoded.top_via().unwrap();
        assert_eq!(via.sent_host, "127.0.0.1");
        assert_eq!(via.sent_port, Some(port));
        let contact = encoded.contacts().next().unwrap();
        assert_eq!(contact.uri.host, "127.0.0.1");
        assert_eq!(contact.uri.port, Some(port));
        assert!(sel.average_message_size() > 0);

        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(5);
        let received = loop {
            sel.process(Some(Duration::from_millis(10))).unwrap();
            if let Ok((n, _)) = peer.recv_from(&mut buf) {
                break n;
            }
            assert!(Instant::now() < deadline, "datagram never arrived");
        };
        assert_eq!(&buf[..received], &sent.data[..]);

        assert!(sel.retransmit(&sent).is_ok());
    }

    #[test]
    fn test_transmit_without_transport_fails() {
        let mut sel = selector();
        let target = Tuple::parse("127.0.0.1", 5060, TransportType::Tcp).unwrap();
        let mut msg = request();
        assert_eq!(
            sel.transmit(&mut msg, &target, "t").unwrap_err(),
            FailureReason::NoTransport
        );
    }

    #[test]
    fn test_preset_via_selects_transport() {
        let mut sel = selector();
        let first = sel.add_transport(udp("127.0.0.1")).unwrap();
        let _second = sel.add_transport(udp("127.0.0.1")).unwrap();
        let first_port = port_of(&sel, first);

        let mut msg = request();
        if let Some(via) = msg.top_via_mut() {
            via.sent_host = "127.0.0.1".to_string();
            via.sent_port = Some(first_port);
        }
        let target = Tuple::parse("127.0.0.1", 5099, TransportType::Udp).unwrap();
        let sent = sel.transmit(&mut msg, &target, "t").unwrap();
        assert_eq!(sent.destination.transport_key(), first);
    }

    #[test]
    fn test_source_interface_for_loopback() {
        let dest = Tuple::parse("127.0.0.1", 5060, TransportType::Udp).unwrap();
        let source = determine_source_interface(&dest).unwrap();
        assert!(source.is_loopback());
        assert_eq!(source.port(), 0);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_default_tls_transport() {
        use crate::transport::stream::StreamTransport;
        use crate::transport::tls::{test_certs::security_for, TlsContext};

        let security = security_for("sip.example.com");
        let mut sel = selector();
        let tls = StreamTransport::bind_tls(
            "127.0.0.1",
            0,
            IpVersion::V4,
            "sip.example.com",
            TlsContext::new(security.as_ref(), "sip.example.com").unwrap(),
            TransportOptions::default(),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();
        let key = sel.add_transport(Box::new(tls)).unwrap();

        assert_eq!(sel.find_tls_transport("", TransportType::Tls, IpVersion::V4), Some(key));
        assert_eq!(
            sel.find_tls_transport("SIP.example.com", TransportType::Tls, IpVersion::V4),
            Some(key)
        );
        assert_eq!(sel.find_tls_transport("other.com", TransportType::Tls, IpVersion::V4), None);
        assert_eq!(sel.find_tls_transport("", TransportType::Dtls, IpVersion::V4), None);
    }
}
