//! Error types for the transport layer

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::events::FailureReason;

/// Errors raised while building or operating a transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The address is already bound by another socket
    #[error("address {addr} already in use")]
    AddrInUse { addr: SocketAddr },

    /// Any other bind failure, with the OS error attached
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unknown transport type: {0}")]
    UnknownTransportType(String),

    /// Certificate, key or TLS configuration problem
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("transport {0} is not registered")]
    UnknownTransport(u32),

    #[error("transport is shutting down")]
    ShuttingDown,

    #[error("transport cannot run in its own thread: {0}")]
    ThreadStart(String),
}

impl TransportError {
    /// Classifies a bind failure so address-in-use is reported distinctly
    pub fn from_bind(addr: SocketAddr, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::AddrInUse {
            TransportError::AddrInUse { addr }
        } else {
            TransportError::Bind { addr, source: err }
        }
    }
}

/// Why a transport could not be found for an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// The OS could not tell which local interface reaches the destination
    #[error("no local interface routes to {0}")]
    NoRoute(SocketAddr),

    #[error("no transport matches {0}")]
    NoTransport(String),

    /// The destination requires an existing connection and there is none
    #[error("no existing connection to {0}")]
    NoExistingConnection(String),
}

impl LookupError {
    /// Failure reported to the transaction whose send could not be routed
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            LookupError::NoRoute(_) => FailureReason::NoRoute,
            LookupError::NoTransport(_) => FailureReason::NoTransport,
            LookupError::NoExistingConnection(_) => FailureReason::TransportNoExistConn,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
