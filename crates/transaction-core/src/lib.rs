//! SIP transaction layer for the voxstack core
//!
//! This crate implements the RFC 3261 Section 17 transaction machines and
//! the controller loop that drives them:
//!
//! - [`TransactionState`] runs one client or server transaction
//! - [`TimerQueue`] orders timer firings, [`TimerSettings`] holds T1/T2/T4 and friends
//! - [`TransactionController`] owns the transactions, the timers and the
//!   [`TransportSelector`](voxstack_sip_transport::TransportSelector)
//! - [`TransactionUser`] receives what the transactions produce
//! - [`ControllerHandle`] lets other threads send messages into the loop
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use voxstack_sip_transport::{IpVersion, LiteralResolver, TransportOptions, TransportSelector, UdpTransport};
//! use voxstack_transaction_core::{ControllerQueue, TimerSettings, TransactionController, TransactionUser, TuEvent};
//!
//! struct Print;
//!
//! impl TransactionUser for Print {
//!     fn deliver(&self, event: TuEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//!
//! let mut selector = TransportSelector::new(Box::new(LiteralResolver::new()))?;
//! let queue = ControllerQueue::new(selector.waker(), 0);
//! let udp = UdpTransport::bind("", 5060, IpVersion::V4, TransportOptions::default(), queue.clone())?;
//! selector.add_transport(Box::new(udp))?;
//!
//! let mut controller = TransactionController::new(selector, queue, Arc::new(Print), TimerSettings::default());
//! loop {
//!     controller.process(Duration::from_millis(100))?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod controller;
pub mod error;
pub mod message;
pub mod queue;
pub mod state;
pub mod timer;
pub mod user;

pub use controller::{
    retry_after_secs, ControllerHandle, ControllerStats, TransactionController,
    DEFAULT_MAX_MESSAGES_PER_PASS,
};
pub use error::{Result, TransactionError};
pub use message::{TransactionFailure, TransactionMessage, TuEvent};
pub use queue::{ControllerQueue, STATE_MACHINE_FIFO};
pub use state::{Disposition, Machine, State, TransactionEnv, TransactionState};
pub use timer::{TimerKind, TimerMessage, TimerQueue, TimerSettings};
pub use user::TransactionUser;
