use std::io;

use thiserror::Error;

use voxstack_infra_common::ConfigError;
use voxstack_sip_transport::TransportError;
use voxstack_transaction_core::TransactionError;

/// Errors raised while assembling or driving a stack
#[derive(Error, Debug)]
pub enum StackError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("failed to start stack thread: {0}")]
    Thread(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, StackError>;
