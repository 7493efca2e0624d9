//! The controller's inbound queue.
//!
//! Transports, DNS completions and TU threads all post here; the controller
//! loop is the only consumer. Every post wakes the selector's poll so the
//! loop notices new work without waiting for its timeout.

use std::sync::Arc;
use std::time::Duration;

use mio::Waker;
use tracing::{trace, warn};

use voxstack_sip_transport::fifo::attach_congestion_manager;
use voxstack_sip_transport::{
    CongestionManager, DnsHandler, Fifo, FifoStats, RejectionBehavior, TransportEvent,
    TransportEventSink,
};

use crate::error::{Result, TransactionError};
use crate::message::TransactionMessage;

/// Description the controller queue is registered under with congestion management
pub const STATE_MACHINE_FIFO: &str = "state machine";

pub struct ControllerQueue {
    fifo: Arc<Fifo<TransactionMessage>>,
    waker: Arc<Waker>,
}

impl ControllerQueue {
    /// `max_depth` of 0 leaves the queue unbounded; congestion management
    /// is then the only brake.
    pub fn new(waker: Arc<Waker>, max_depth: usize) -> Arc<Self> {
        Arc::new(ControllerQueue {
            fifo: Arc::new(Fifo::new(STATE_MACHINE_FIFO, max_depth)),
            waker,
        })
    }

    pub fn set_congestion_manager(&self, manager: Arc<dyn CongestionManager>) {
        attach_congestion_manager(&self.fifo, manager);
    }

    pub fn post(&self, message: TransactionMessage) -> Result<()> {
        trace!(msg = %message.brief(), "posting to controller");
        self.fifo.add(message).map_err(|rejected| {
            warn!(msg = %rejected.brief(), "controller queue full, dropping");
            TransactionError::QueueFull
        })?;
        self.wake();
        Ok(())
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake controller: {}", e);
        }
    }

    pub(crate) fn take_batch(&self, max: usize) -> Vec<TransactionMessage> {
        self.fifo.get_batch(max)
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    pub fn stats(&self) -> &dyn FifoStats {
        self.fifo.as_ref()
    }
}

impl TransportEventSink for ControllerQueue {
    fn post(&self, event: TransportEvent) {
        let message = match event {
            TransportEvent::MessageReceived { message, source, .. } => {
                TransactionMessage::FromWire { message, source }
            }
            TransportEvent::Failure(failure) => TransactionMessage::TransportFailure(failure),
        };
        let _ = ControllerQueue::post(self, message);
    }

    fn rejection_behavior(&self) -> RejectionBehavior {
        self.fifo.rejection_behavior()
    }

    fn expected_wait(&self) -> Duration {
        self.fifo.expected_wait()
    }
}

impl DnsHandler for ControllerQueue {
    fn handle(&self, tid: &str) {
        let _ = self.post(TransactionMessage::DnsResultReady {
            tid: tid.to_string(),
        });
    }
}
