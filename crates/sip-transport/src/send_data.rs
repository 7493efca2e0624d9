use bytes::Bytes;

use crate::tuple::Tuple;

/// What a queued outbound entry asks the transport to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendCommand {
    /// Write `data` to the destination
    Data,
    /// Tear down the connection to the destination
    CloseConnection,
}

/// An encoded message on its way out, correlated to its transaction.
///
/// Queued into a transport's outbound FIFO by the selector; the transaction
/// layer keeps a copy for retransmission.
#[derive(Debug, Clone)]
pub struct SendData {
    pub destination: Tuple,
    pub data: Bytes,
    pub tid: String,
    pub command: SendCommand,
}

impl SendData {
    pub fn new(destination: Tuple, data: Bytes, tid: impl Into<String>) -> Self {
        SendData {
            destination,
            data,
            tid: tid.into(),
            command: SendCommand::Data,
        }
    }

    pub fn close_connection(destination: Tuple) -> Self {
        SendData {
            destination,
            data: Bytes::new(),
            tid: String::new(),
            command: SendCommand::CloseConnection,
        }
    }

    /// Same payload, same correlation, different destination
    pub fn retarget(&self, destination: Tuple) -> Self {
        SendData {
            destination,
            ..self.clone()
        }
    }
}
