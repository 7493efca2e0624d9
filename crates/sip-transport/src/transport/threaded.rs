//! Runs a transport on a dedicated thread.
//!
//! The wrapped transport gets its own [`Poll`] and is driven exactly as the
//! shared loop would drive it. The wrapper stays in the selector and
//! answers identity queries and sends; sends reach the thread through the
//! shared outbound queue, whose waker is pointed at the thread's poll.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::transport::{Transport, TransportBase, WAKER_TOKEN};
use crate::tuple::TransportKey;

/// Poll timeout when the transport has no timers of its own
const IDLE_POLL: Duration = Duration::from_millis(500);

pub struct ThreadedTransport {
    base: TransportBase,
    inner: Option<Box<dyn Transport>>,
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    waker: Option<Arc<Waker>>,
    connections: Arc<AtomicUsize>,
    /// Snapshot of the inner transport's connected peers, refreshed each loop
    peers: Arc<RwLock<Vec<SocketAddr>>>,
}

impl ThreadedTransport {
    pub fn new(inner: Box<dyn Transport>) -> Self {
        ThreadedTransport {
            base: inner.base().clone(),
            inner: Some(inner),
            thread: None,
            stop: Arc::new(AtomicBool::new(false)),
            waker: None,
            connections: Arc::new(AtomicUsize::new(0)),
            peers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

fn run(
    mut transport: Box<dyn Transport>,
    mut poll: Poll,
    stop: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    peers: Arc<RwLock<Vec<SocketAddr>>>,
) {
    let mut events = Events::with_capacity(256);
    while !stop.load(Ordering::Acquire) {
        transport.process(poll.registry());
        connections.store(transport.connection_count(), Ordering::Relaxed);
        if transport.is_stream_oriented() {
            *peers.write() = transport.connected_peers();
        }

        let timeout = if transport.has_data_to_send() {
            Duration::ZERO
        } else {
            transport
                .time_till_next_process()
                .map_or(IDLE_POLL, |t| t.min(IDLE_POLL))
        };
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(transport = %transport.tuple(), "poll failed, stopping transport thread: {}", e);
            break;
        }
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            transport.handle_event(
                poll.registry(),
                event.token(),
                event.is_readable(),
                event.is_writable(),
            );
        }
    }
    let _ = transport.deregister(poll.registry());
    debug!(transport = %transport.tuple(), "transport thread exiting");
}

impl Transport for ThreadedTransport {
    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TransportBase {
        &mut self.base
    }

    fn set_key(&mut self, key: TransportKey) {
        self.base.set_key(key);
        if let Some(inner) = self.inner.as_mut() {
            inner.set_key(key);
        }
    }

    fn register(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }

    fn handle_event(&mut self, _registry: &Registry, _token: Token, _readable: bool, _writable: bool) {}

    fn process(&mut self, _registry: &Registry) {}

    fn runs_own_thread(&self) -> bool {
        true
    }

    fn start_own_thread(&mut self) -> Result<()> {
        let Some(mut inner) = self.inner.take() else {
            return Err(TransportError::ThreadStart("already started".to_string()));
        };
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        inner.register(poll.registry())?;
        self.base.tx().set_waker(waker.clone());

        let name = format!(
            "sip-{}-{}",
            self.base.tuple().transport_type().as_str().to_ascii_lowercase(),
            self.base.tuple().port()
        );
        let stop = self.stop.clone();
        let connections = self.connections.clone();
        let peers = self.peers.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(inner, poll, stop, connections, peers))
            .map_err(|e| TransportError::ThreadStart(e.to_string()))?;
        info!(thread = %name, "transport thread started");

        self.thread = Some(handle);
        self.waker = Some(waker);
        Ok(())
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn connected_peers(&self) -> Vec<SocketAddr> {
        self.peers.read().clone()
    }
}

impl Drop for ThreadedTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
