//! SIP transport layer for the voxstack core
//!
//! This crate moves SIP messages on and off the wire. It provides:
//!
//! - [`Tuple`], the endpoint-plus-transport value every layer uses to name a peer
//! - UDP, TCP, TLS and DTLS transports built on [`mio`], each feeding inbound
//!   messages and send failures to a [`TransportEventSink`]. The `tls` and
//!   `dtls` features pull in rustls and webrtc-dtls.
//! - [`TransportSelector`], which owns the transports, picks one for each
//!   outbound message and drives the shared poll loop
//! - Target resolution through the [`DnsResolver`] trait
//!
//! Transports are synchronous and non-blocking. A transport either joins the
//! selector's poll loop or, wrapped in [`ThreadedTransport`], runs on a thread
//! of its own. Outbound messages always travel through the transport's
//! bounded queue, so [`Transport::send`] can be called from any thread.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use voxstack_sip_transport::{
//!     IpVersion, LiteralResolver, TransportEvent, TransportEventSink, TransportOptions,
//!     TransportSelector, UdpTransport,
//! };
//!
//! struct Print;
//!
//! impl TransportEventSink for Print {
//!     fn post(&self, event: TransportEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//!
//! let mut selector = TransportSelector::new(Box::new(LiteralResolver::new()))?;
//! let udp = UdpTransport::bind("", 5060, IpVersion::V4, TransportOptions::default(), Arc::new(Print))?;
//! selector.add_transport(Box::new(udp))?;
//! loop {
//!     selector.process(selector.time_till_next_process())?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod congestion;
pub mod dns;
pub mod error;
pub mod events;
pub mod fifo;
pub mod selector;
pub mod send_data;
pub mod transport;
pub mod tuple;

pub use congestion::{
    CongestionManager, CongestionTolerance, FifoStats, GeneralCongestionManager, MetricType,
    RejectionBehavior,
};
pub use dns::{DnsHandler, DnsResolver, DnsResult, DnsResultHandle, DnsState, LiteralResolver, SystemResolver};
pub use error::{LookupError, Result, TransportError};
pub use events::{FailureReason, TransportEvent, TransportEventSink, TransportFailure};
pub use fifo::Fifo;
pub use selector::{determine_source_interface, TransportSelector};
pub use send_data::{SendCommand, SendData};
pub use transport::dtls::{
    DtlsError, DtlsRole, DtlsSession, DtlsSessionFactory, DtlsTransport, SessionWaker,
};
#[cfg(feature = "dtls")]
pub use transport::dtls_webrtc::WebRtcDtlsFactory;
pub use transport::stream::StreamTransport;
pub use transport::threaded::ThreadedTransport;
#[cfg(feature = "tls")]
pub use transport::tls::{PemSecurity, Security, TlsContext};
pub use transport::udp::UdpTransport;
pub use transport::{Transport, TransportOptions};
pub use tuple::{ConnectionId, IpVersion, TransportKey, TransportType, Tuple};
