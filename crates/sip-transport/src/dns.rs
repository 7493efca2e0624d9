//! Target resolution for outbound requests.
//!
//! A transaction asks a [`DnsResolver`] for a [`DnsResult`] and then pulls
//! candidate targets from it one at a time with [`DnsResult::next`]. Results
//! for numeric hosts are available immediately; name lookups complete later
//! and are announced through the [`DnsHandler`] given at creation.
//!
//! Feedback about targets is shared across results: a greylisted target is
//! tried only after every other candidate, a blacklisted one is skipped
//! until its mark expires.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use voxstack_sip_core::{Scheme, Uri};

use crate::tuple::{TransportType, Tuple};

/// Where a result stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsState {
    /// At least one candidate is ready
    Available,
    /// A lookup is still running
    Pending,
    /// Nothing left to try
    Finished,
}

/// Notified when a pending lookup completes
pub trait DnsHandler: Send + Sync {
    fn handle(&self, tid: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Grey,
    Black,
}

/// Greylist/blacklist marks, shared by every result of a resolver
#[derive(Default)]
pub struct TargetMarks {
    marks: Mutex<HashMap<(SocketAddr, TransportType), (Mark, Instant)>>,
}

impl TargetMarks {
    fn set(&self, target: &Tuple, mark: Mark, duration: Duration) {
        self.marks.lock().insert(
            (target.socket_addr(), target.transport_type()),
            (mark, Instant::now() + duration),
        );
    }

    fn get(&self, target: &Tuple) -> Option<Mark> {
        let key = (target.socket_addr(), target.transport_type());
        let mut marks = self.marks.lock();
        match marks.get(&key) {
            Some((mark, until)) if *until > Instant::now() => Some(*mark),
            Some(_) => {
                marks.remove(&key);
                None
            }
            None => None,
        }
    }

    fn clear(&self, target: &Tuple) {
        self.marks
            .lock()
            .remove(&(target.socket_addr(), target.transport_type()));
    }
}

pub struct DnsResult {
    tid: String,
    pending: bool,
    candidates: VecDeque<Tuple>,
    marks: Arc<TargetMarks>,
    handler: Arc<dyn DnsHandler>,
}

pub type DnsResultHandle = Arc<Mutex<DnsResult>>;

impl DnsResult {
    fn new(tid: &str, marks: Arc<TargetMarks>, handler: Arc<dyn DnsHandler>) -> Self {
        DnsResult {
            tid: tid.to_string(),
            pending: false,
            candidates: VecDeque::new(),
            marks,
            handler,
        }
    }

    pub fn tid(&self) -> &str {
        &self.tid
    }

    pub fn state(&self) -> DnsState {
        if self
            .candidates
            .iter()
            .any(|c| self.marks.get(c) != Some(Mark::Black))
        {
            DnsState::Available
        } else if self.pending {
            DnsState::Pending
        } else {
            DnsState::Finished
        }
    }

    /// Next target to try. Greylisted targets come after all others.
    pub fn next(&mut self) -> Option<Tuple> {
        let marks: Vec<Option<Mark>> = self.candidates.iter().map(|c| self.marks.get(c)).collect();
        let pick = marks
            .iter()
            .position(Option::is_none)
            .or_else(|| marks.iter().position(|m| *m == Some(Mark::Grey)))?;
        self.candidates.remove(pick)
    }

    pub fn greylist(&self, target: &Tuple, duration: Duration) {
        debug!(%target, ?duration, "greylisting target");
        self.marks.set(target, Mark::Grey, duration);
    }

    pub fn blacklist(&self, target: &Tuple, duration: Duration) {
        debug!(%target, ?duration, "blacklisting target");
        self.marks.set(target, Mark::Black, duration);
    }

    /// Clears any mark on a target that turned out to work
    pub fn whitelist(&self, target: &Tuple) {
        self.marks.clear(target);
    }

    fn complete(&mut self, targets: Vec<Tuple>) {
        self.pending = false;
        self.candidates.extend(targets);
    }
}

/// Transport implied by a URI: its `transport` parameter, else TLS for
/// `sips`, else UDP
pub fn target_transport(uri: &Uri) -> TransportType {
    if let Some(t) = uri.transport_param().and_then(|t| t.parse().ok()) {
        return t;
    }
    if uri.scheme == Scheme::Sips {
        TransportType::Tls
    } else {
        TransportType::Udp
    }
}

/// Target for a URI whose host is a numeric address
pub fn literal_target(uri: &Uri) -> Option<Tuple> {
    let ip = uri.host_ip()?;
    let transport = target_transport(uri);
    let port = uri.port.unwrap_or_else(|| transport.default_port());
    Some(Tuple::from_ip(ip, port, transport))
}

pub trait DnsResolver: Send {
    fn create_result(&self, tid: &str, handler: Arc<dyn DnsHandler>) -> DnsResultHandle;

    /// Starts resolving `target` into `result`; returns the state right after
    fn lookup(&mut self, result: &DnsResultHandle, target: &Uri) -> DnsState;

    /// Whether the resolver has I/O of its own to pump from the controller loop
    fn requires_process(&self) -> bool {
        false
    }

    fn process(&mut self) {}
}

/// Resolves numeric hosts only. Name lookups finish with no results.
#[derive(Default)]
pub struct LiteralResolver {
    marks: Arc<TargetMarks>,
}

impl LiteralResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DnsResolver for LiteralResolver {
    fn create_result(&self, tid: &str, handler: Arc<dyn DnsHandler>) -> DnsResultHandle {
        Arc::new(Mutex::new(DnsResult::new(tid, self.marks.clone(), handler)))
    }

    fn lookup(&mut self, result: &DnsResultHandle, target: &Uri) -> DnsState {
        let mut result = result.lock();
        match literal_target(target) {
            Some(tuple) => result.complete(vec![tuple]),
            None => {
                debug!(host = %target.host, "cannot resolve non-numeric host");
                result.complete(Vec::new());
            }
        }
        result.state()
    }
}

/// Resolves names with the system resolver on a tokio runtime
pub struct SystemResolver {
    runtime: tokio::runtime::Handle,
    marks: Arc<TargetMarks>,
}

impl SystemResolver {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        SystemResolver {
            runtime,
            marks: Arc::new(TargetMarks::default()),
        }
    }
}

impl DnsResolver for SystemResolver {
    fn create_result(&self, tid: &str, handler: Arc<dyn DnsHandler>) -> DnsResultHandle {
        Arc::new(Mutex::new(DnsResult::new(tid, self.marks.clone(), handler)))
    }

    fn lookup(&mut self, result: &DnsResultHandle, target: &Uri) -> DnsState {
        if let Some(tuple) = literal_target(target) {
            let mut locked = result.lock();
            locked.complete(vec![tuple]);
            return locked.state();
        }

        let transport = target_transport(target);
        let port = target.port.unwrap_or_else(|| transport.default_port());
        let host = target.host.clone();
        result.lock().pending = true;

        let result = result.clone();
        self.runtime.spawn(async move {
            let targets: Vec<Tuple> = match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => addrs
                    .map(|addr| Tuple::new(addr, transport).with_target_domain(host.as_str()))
                    .collect(),
                Err(e) => {
                    debug!(%host, error = %e, "name lookup failed");
                    Vec::new()
                }
            };
            trace!(%host, count = targets.len(), "name lookup complete");
            let (tid, handler) = {
                let mut locked = result.lock();
                locked.complete(targets);
                (locked.tid.clone(), locked.handler.clone())
            };
            handler.handle(&tid);
        });
        DnsState::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    struct Noop;

    impl DnsHandler for Noop {
        fn handle(&self, _tid: &str) {}
    }

    struct Notify(Mutex<mpsc::Sender<String>>);

    impl DnsHandler for Notify {
        fn handle(&self, tid: &str) {
            let _ = self.0.lock().send(tid.to_string());
        }
    }

    #[test]
    fn test_literal_targets() {
        let uri: Uri = "sip:bob@192.0.2.1".parse().unwrap();
        let t = literal_target(&uri).unwrap();
        assert_eq!(t.port(), 5060);
        assert_eq!(t.transport_type(), TransportType::Udp);

        let uri: Uri = "sips:bob@192.0.2.1".parse().unwrap();
        assert_eq!(literal_target(&uri).unwrap().port(), 5061);

        let uri: Uri = "sip:bob@[2001:db8::1]:5080;transport=tcp".parse().unwrap();
        let t = literal_target(&uri).unwrap();
        assert_eq!(t.port(), 5080);
        assert_eq!(t.transport_type(), TransportType::Tcp);

        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        assert!(literal_target(&uri).is_none());
    }

    #[test]
    fn test_literal_resolver_and_marks() {
        let mut resolver = LiteralResolver::new();
        let result = resolver.create_result("t1", Arc::new(Noop));
        let uri: Uri = "sip:bob@192.0.2.1:5070".parse().unwrap();
        assert_eq!(resolver.lookup(&result, &uri), DnsState::Available);

        let mut r = result.lock();
        let target = r.next().unwrap();
        assert_eq!(target.port(), 5070);
        assert_eq!(r.state(), DnsState::Finished);
        assert!(r.next().is_none());

        r.complete(vec![target.clone()]);
        r.blacklist(&target, Duration::from_secs(60));
        assert_eq!(r.state(), DnsState::Finished);
        assert!(r.next().is_none());

        r.whitelist(&target);
        assert_eq!(r.state(), DnsState::Available);
    }

    #[test]
    fn test_greylisted_targets_go_last() {
        let resolver = LiteralResolver::new();
        let result = resolver.create_result("t1", Arc::new(Noop));
        let mut r = result.lock();
        let a = Tuple::parse("192.0.2.1", 5060, TransportType::Udp).unwrap();
        let b = Tuple::parse("192.0.2.2", 5060, TransportType::Udp).unwrap();
        r.complete(vec![a.clone(), b.clone()]);
        r.greylist(&a, Duration::from_secs(32));
        assert_eq!(r.next(), Some(b));
        assert_eq!(r.next(), Some(a));
    }

    #[test]
    fn test_unresolvable_name_finishes_empty() {
        let mut resolver = LiteralResolver::new();
        let result = resolver.create_result("t1", Arc::new(Noop));
        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        assert_eq!(resolver.lookup(&result, &uri), DnsState::Finished);
    }

    #[test]
    fn test_system_resolver_notifies_handler() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let mut resolver = SystemResolver::new(runtime.handle().clone());
        let (tx, rx) = mpsc::channel();
        let result = resolver.create_result("t9", Arc::new(Notify(Mutex::new(tx))));
        let uri: Uri = "sip:bob@localhost:5099;transport=tcp".parse().unwrap();
        assert_eq!(resolver.lookup(&result, &uri), DnsState::Pending);

        let tid = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(tid, "t9");
        let mut r = result.lock();
        let target = r.next().expect("localhost resolves");
        assert_eq!(target.port(), 5099);
        assert_eq!(target.transport_type(), TransportType::Tcp);
        assert!(target.is_loopback());
        assert_eq!(target.target_domain(), "localhost");
    }
}
