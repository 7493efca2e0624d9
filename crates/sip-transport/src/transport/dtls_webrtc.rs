//! DTLS sessions backed by `webrtc-dtls`
//!
//! `webrtc-dtls` runs the handshake and record layer as async tasks over a
//! [`Conn`]. Each session gets an in-memory [`Conn`] whose far end is the
//! synchronous [`DtlsSession`] the transport drives: datagrams from the
//! socket are pushed in, sealed datagrams and decrypted plaintext queue up
//! until the transport polls for them. Whenever the task produces something
//! it calls the session's waker, which pokes the transport's poll loop.
//!
//! Flight retransmission is handled by the library; the transport's
//! handshake timer only bounds how long a handshake may take.
//!
//! Certificates are self-signed and generated per factory. Peers are not
//! checked against a CA; deployments that need that supply their own
//! [`DtlsSessionFactory`].

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use webrtc_dtls::config::{Config, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_dtls::crypto::Certificate;
use webrtc_util::Conn;

use crate::error::{Result, TransportError};
use crate::transport::dtls::{DtlsError, DtlsRole, DtlsSession, DtlsSessionFactory, SessionWaker};

/// Largest record the reader task accepts
const RECORD_BUFFER: usize = 65_535;

/// Subject name used when the transport has no domain
const DEFAULT_SUBJECT: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Established,
    Closed,
    Failed(String),
}

/// Everything the async task hands back to the synchronous side
struct Shared {
    phase: Mutex<Phase>,
    wire: Mutex<VecDeque<Vec<u8>>>,
    plaintext: Mutex<VecDeque<Vec<u8>>>,
    wake: SessionWaker,
}

impl Shared {
    fn set_phase(&self, phase: Phase) {
        {
            let mut current = self.phase.lock();
            // a failure is final
            if matches!(*current, Phase::Closed | Phase::Failed(_)) {
                return;
            }
            *current = phase;
        }
        (self.wake)();
    }

    fn phase(&self) -> Phase {
        self.phase.lock().clone()
    }
}

/// The library's side of a session: a datagram pipe to the transport
struct SessionConn {
    peer: SocketAddr,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Conn for SessionConn {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "session pipes are pre-connected").into())
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "session dropped").into()),
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.peer))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        self.shared.wire.lock().push_back(buf.to_vec());
        (self.shared.wake)();
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn close(&self) -> webrtc_util::Result<()> {
        Ok(())
    }
}

/// Handshakes, then pumps records both ways until either side goes away
async fn drive(
    conn: Arc<SessionConn>,
    config: Config,
    role: DtlsRole,
    peer: SocketAddr,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let shared = conn.shared.clone();
    let dtls = match DTLSConn::new(conn, config, role == DtlsRole::Client, None).await {
        Ok(dtls) => Arc::new(dtls),
        Err(e) => {
            debug!(%peer, ?role, error = %e, "DTLS handshake failed");
            shared.set_phase(Phase::Failed(e.to_string()));
            return;
        }
    };
    debug!(%peer, ?role, "DTLS handshake complete");
    shared.set_phase(Phase::Established);

    let reader = async {
        let mut buf = vec![0u8; RECORD_BUFFER];
        loop {
            match dtls.recv(&mut buf).await {
                Ok(n) => {
                    shared.plaintext.lock().push_back(buf[..n].to_vec());
                    (shared.wake)();
                }
                Err(e) => {
                    trace!(%peer, error = %e, "DTLS session ended");
                    shared.set_phase(Phase::Closed);
                    return;
                }
            }
        }
    };
    let writer = async {
        while let Some(plaintext) = outgoing.recv().await {
            if let Err(e) = dtls.send(&plaintext).await {
                shared.set_phase(Phase::Failed(e.to_string()));
                return;
            }
        }
    };
    tokio::select! {
        _ = reader => {}
        _ = writer => {}
    }
    let _ = dtls.close().await;
}

/// A session driven by a task on the factory's runtime
pub struct WebRtcDtlsSession {
    role: DtlsRole,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
    error_reported: bool,
}

impl WebRtcDtlsSession {
    fn error(&self) -> Option<DtlsError> {
        match self.shared.phase() {
            Phase::Closed => Some(DtlsError::Closed),
            Phase::Failed(reason) => Some(DtlsError::Fatal(reason)),
            Phase::Handshaking | Phase::Established => None,
        }
    }
}

impl DtlsSession for WebRtcDtlsSession {
    fn role(&self) -> DtlsRole {
        self.role
    }

    fn is_handshaking(&self) -> bool {
        self.shared.phase() == Phase::Handshaking
    }

    fn handshake(&mut self) -> std::result::Result<(), DtlsError> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn receive(&mut self, datagram: &[u8]) -> std::result::Result<Option<Vec<u8>>, DtlsError> {
        self.inbound
            .send(datagram.to_vec())
            .map_err(|_| DtlsError::Closed)?;
        Ok(None)
    }

    fn send(&mut self, plaintext: &[u8]) -> std::result::Result<usize, DtlsError> {
        match self.shared.phase() {
            Phase::Handshaking => Err(DtlsError::WantRead),
            Phase::Established => {
                self.outgoing
                    .send(plaintext.to_vec())
                    .map_err(|_| DtlsError::Closed)?;
                Ok(plaintext.len())
            }
            Phase::Closed => Err(DtlsError::Closed),
            Phase::Failed(reason) => Err(DtlsError::Fatal(reason)),
        }
    }

    fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.shared.wire.lock().pop_front()
    }

    fn poll_plaintext(&mut self) -> Option<Vec<u8>> {
        self.shared.plaintext.lock().pop_front()
    }

    fn poll_error(&mut self) -> Option<DtlsError> {
        if self.error_reported {
            return None;
        }
        let error = self.error();
        self.error_reported = error.is_some();
        error
    }
}

impl Drop for WebRtcDtlsSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Default [`DtlsSessionFactory`]: `webrtc-dtls` on a private runtime
pub struct WebRtcDtlsFactory {
    runtime: Option<Runtime>,
    certificate: Certificate,
    flight_interval: Duration,
}

impl WebRtcDtlsFactory {
    /// Factory presenting a fresh self-signed certificate for `domain`
    pub fn new(domain: &str) -> Result<Self> {
        let subject = if domain.is_empty() { DEFAULT_SUBJECT } else { domain };
        let certificate = Certificate::generate_self_signed(vec![subject.to_string()])
            .map_err(|e| TransportError::TlsConfig(format!("DTLS certificate for '{}': {}", subject, e)))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sip-dtls")
            .enable_all()
            .build()?;
        info!(subject, "DTLS session factory ready");
        Ok(WebRtcDtlsFactory {
            runtime: Some(runtime),
            certificate,
            flight_interval: Duration::from_secs(1),
        })
    }

    /// Interval between the library's own flight retransmissions
    pub fn with_flight_interval(mut self, interval: Duration) -> Self {
        self.flight_interval = interval;
        self
    }

    fn config(&self, role: DtlsRole, domain: &str) -> Config {
        Config {
            certificates: vec![self.certificate.clone()],
            extended_master_secret: ExtendedMasterSecretType::Require,
            insecure_skip_verify: true,
            flight_interval: self.flight_interval,
            server_name: match role {
                DtlsRole::Client => domain.to_string(),
                DtlsRole::Server => String::new(),
            },
            ..Default::default()
        }
    }
}

impl DtlsSessionFactory for WebRtcDtlsFactory {
    fn create(
        &self,
        role: DtlsRole,
        peer: SocketAddr,
        domain: &str,
        wake: SessionWaker,
    ) -> std::result::Result<Box<dyn DtlsSession>, DtlsError> {
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(DtlsError::Fatal("factory is shut down".to_string()));
        };
        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::Handshaking),
            wire: Mutex::new(VecDeque::new()),
            plaintext: Mutex::new(VecDeque::new()),
            wake,
        });
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(SessionConn {
            peer,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            shared: shared.clone(),
        });
        let task = runtime.spawn(drive(conn, self.config(role, domain), role, peer, outgoing_rx));
        trace!(%peer, ?role, "DTLS session created");
        Ok(Box::new(WebRtcDtlsSession {
            role,
            shared,
            inbound: inbound_tx,
            outgoing: outgoing_tx,
            task,
            error_reported: false,
        }))
    }
}

impl Drop for WebRtcDtlsFactory {
    fn drop(&mut self) {
        // may be dropped from inside another runtime
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
