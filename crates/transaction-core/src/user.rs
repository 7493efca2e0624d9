//! The transaction user (TU) interface

use std::time::Duration;

use voxstack_sip_transport::RejectionBehavior;

use crate::message::TuEvent;

/// Receives transaction outcomes and inbound requests.
///
/// `deliver` runs on the controller thread and must not block.
pub trait TransactionUser: Send + Sync {
    fn deliver(&self, event: TuEvent);

    /// Whether [`TuEvent::Terminated`] notifications are wanted
    fn wants_terminated(&self) -> bool {
        false
    }

    /// Congestion posture of the TU's own queue. Anything but `Normal`
    /// makes the controller answer new requests with 503 itself.
    fn rejection_behavior(&self) -> RejectionBehavior {
        RejectionBehavior::Normal
    }

    fn expected_wait(&self) -> Duration {
        Duration::ZERO
    }
}
