//! Error types for the transaction layer

use thiserror::Error;

use voxstack_sip_transport::TransportError;

#[derive(Debug, Error)]
pub enum TransactionError {
    /// The message carries no Via branch (or enough headers to derive a
    /// transaction id from)
    #[error("message has no transaction id")]
    MissingTransactionId,

    #[error("controller queue is full")]
    QueueFull,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, TransactionError>;
