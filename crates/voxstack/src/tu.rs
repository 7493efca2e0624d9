//! Transaction user adapters for applications built on the stack

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use voxstack_transaction_core::{TransactionUser, TuEvent};

/// Forwards every [`TuEvent`] into an unbounded tokio channel.
///
/// Delivery never blocks the controller thread. Events for a receiver
/// that has been dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelTransactionUser {
    tx: mpsc::UnboundedSender<TuEvent>,
    wants_terminated: bool,
}

impl ChannelTransactionUser {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TuEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ChannelTransactionUser {
                tx,
                wants_terminated: false,
            },
            rx,
        )
    }

    /// Also forward [`TuEvent::Terminated`]
    pub fn with_terminated(mut self, wants: bool) -> Self {
        self.wants_terminated = wants;
        self
    }
}

impl TransactionUser for ChannelTransactionUser {
    fn deliver(&self, event: TuEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(tid = e.0.tid(), "transaction user channel closed, event dropped");
        }
    }

    fn wants_terminated(&self) -> bool {
        self.wants_terminated
    }
}

/// Logs what arrives and answers nothing. Used by the binary when no
/// application is attached.
#[derive(Debug, Default)]
pub struct LoggingTransactionUser;

impl TransactionUser for LoggingTransactionUser {
    fn deliver(&self, event: TuEvent) {
        match event {
            TuEvent::Request { tid, message, source } => {
                info!(%tid, peer = %source, "request {}", message.brief());
            }
            TuEvent::Response { tid, message, source } => {
                info!(%tid, peer = %source, "response {}", message.brief());
            }
            TuEvent::Failure { tid, reason, .. } => {
                warn!(%tid, %reason, "transaction failed");
            }
            TuEvent::Terminated { tid } => {
                debug!(%tid, "transaction terminated");
            }
        }
    }
}
