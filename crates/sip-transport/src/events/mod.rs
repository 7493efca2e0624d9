//! Transport events
//!
//! Everything a transport reports upward goes through a
//! [`TransportEventSink`]: parsed inbound messages, and failures of specific
//! sends. The transaction layer implements the sink on top of its inbound
//! FIFO, which is also where the congestion posture is read from.

use std::fmt;
use std::time::Duration;

use voxstack_sip_core::Message;

use crate::congestion::RejectionBehavior;
use crate::tuple::Tuple;

/// Why a send failed. Declared in increasing order of severity; the
/// transaction layer keeps the most severe reason it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum FailureReason {
    #[default]
    None,
    /// Generic send failure
    Failure,
    /// The socket could not be created
    TransportNoSocket,
    /// Connecting to the peer failed
    TransportBadConnect,
    /// The connection was lost mid-flight
    ConnectionException,
    /// The transport is shutting down
    TransportShutdown,
    /// The peer's certificate did not match the target domain
    CertNameMismatch,
    /// The peer's certificate failed validation
    CertValidationFailure,
    /// The destination may only be reached over an existing connection and there is none
    TransportNoExistConn,
    /// No registered transport can reach the destination
    NoTransport,
    /// No local interface routes to the destination
    NoRoute,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::None => "none",
            FailureReason::Failure => "send failure",
            FailureReason::TransportNoSocket => "no socket",
            FailureReason::TransportBadConnect => "connect failed",
            FailureReason::ConnectionException => "connection lost",
            FailureReason::TransportShutdown => "transport shutting down",
            FailureReason::CertNameMismatch => "certificate name mismatch",
            FailureReason::CertValidationFailure => "certificate validation failure",
            FailureReason::TransportNoExistConn => "no existing connection",
            FailureReason::NoTransport => "no transport",
            FailureReason::NoRoute => "no route",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed send, correlated to its transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub tid: String,
    pub reason: FailureReason,
    /// OS error code, when there was one
    pub os_error: Option<i32>,
}

impl TransportFailure {
    pub fn new(tid: impl Into<String>, reason: FailureReason) -> Self {
        TransportFailure {
            tid: tid.into(),
            reason,
            os_error: None,
        }
    }

    pub fn with_os_error(mut self, code: Option<i32>) -> Self {
        self.os_error = code;
        self
    }
}

/// Events emitted by transports
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A well-formed message arrived
    MessageReceived {
        message: Message,
        /// The peer, with transport key and connection id filled in
        source: Tuple,
        /// The local binding it arrived on
        destination: Tuple,
    },
    /// A specific send could not be completed
    Failure(TransportFailure),
}

/// Receiver of transport events.
///
/// Implementations must not block: transports call this from their poll loop.
pub trait TransportEventSink: Send + Sync {
    fn post(&self, event: TransportEvent);

    /// Current congestion posture of whatever consumes the events
    fn rejection_behavior(&self) -> RejectionBehavior {
        RejectionBehavior::Normal
    }

    /// Expected time before a newly posted event gets serviced
    fn expected_wait(&self) -> Duration {
        Duration::ZERO
    }
}
