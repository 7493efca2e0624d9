//! What flows into the controller and what comes out to the transaction user

use std::fmt;

use voxstack_sip_core::Message;
use voxstack_sip_transport::{FailureReason, TransportFailure, Tuple};

use crate::timer::TimerMessage;

/// Everything the controller loop consumes from its inbound queue
#[derive(Debug, Clone)]
pub enum TransactionMessage {
    /// Parsed off the wire by a transport
    FromWire { message: Message, source: Tuple },
    /// Sent by the transaction user. Without a target, requests are routed
    /// by their top Route or Request-URI and responses by their transaction.
    FromTu { message: Message, target: Option<Tuple> },
    TransportFailure(TransportFailure),
    /// A pending DNS lookup for this transaction completed
    DnsResultReady { tid: String },
    /// Stop a client INVITE: CANCEL it once a provisional response has arrived
    CancelClientInvite { tid: String },
    /// The TU will never answer this server transaction
    AbandonServerTransaction { tid: String },
    Shutdown,
}

impl TransactionMessage {
    pub fn brief(&self) -> String {
        match self {
            TransactionMessage::FromWire { message, .. } => format!("wire {}", message.brief()),
            TransactionMessage::FromTu { message, .. } => format!("tu {}", message.brief()),
            TransactionMessage::TransportFailure(f) => format!("failure tid={} {}", f.tid, f.reason),
            TransactionMessage::DnsResultReady { tid } => format!("dns tid={}", tid),
            TransactionMessage::CancelClientInvite { tid } => format!("cancel tid={}", tid),
            TransactionMessage::AbandonServerTransaction { tid } => format!("abandon tid={}", tid),
            TransactionMessage::Shutdown => "shutdown".to_string(),
        }
    }

    /// Timer firings travel separately; this only exists for logging
    pub(crate) fn timer_brief(timer: &TimerMessage) -> String {
        format!("timer {} tid={}", timer.kind, timer.tid)
    }
}

/// Why a client transaction ended without a real final response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionFailure {
    /// Timer B, C, F or H expired
    Timeout,
    /// Every target failed at the transport layer
    TransportFailure(FailureReason),
    /// DNS produced no usable target
    NoDnsResults,
    /// Rejected before entering the controller because it was congested
    Congested,
}

impl fmt::Display for TransactionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionFailure::Timeout => f.write_str("timeout"),
            TransactionFailure::TransportFailure(reason) => write!(f, "transport failure: {}", reason),
            TransactionFailure::NoDnsResults => f.write_str("no DNS results"),
            TransactionFailure::Congested => f.write_str("congested"),
        }
    }
}

/// Delivered to the transaction user
#[derive(Debug, Clone)]
pub enum TuEvent {
    /// A new request: the start of a server transaction, a CANCEL for one,
    /// or an ACK for a 2xx
    Request { tid: String, message: Message, source: Tuple },
    Response { tid: String, message: Message, source: Tuple },
    /// A client transaction failed. `response` is the locally generated final
    /// response standing in for the one that never came; a server INVITE
    /// that never saw its ACK has none.
    Failure {
        tid: String,
        reason: TransactionFailure,
        response: Option<Message>,
    },
    /// The transaction is gone from the controller
    Terminated { tid: String },
}

impl TuEvent {
    pub fn tid(&self) -> &str {
        match self {
            TuEvent::Request { tid, .. }
            | TuEvent::Response { tid, .. }
            | TuEvent::Failure { tid, .. }
            | TuEvent::Terminated { tid } => tid,
        }
    }
}
