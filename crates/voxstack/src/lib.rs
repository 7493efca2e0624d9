//! # voxstack
//!
//! A SIP transaction and transport stack. This crate assembles the layers
//! into something an application can run:
//!
//! - [`SipStack`] binds the configured transports and runs the
//!   transaction controller on a dedicated thread
//! - [`StackHandle`] sends requests and responses into the running stack
//!   from any thread
//! - [`ChannelTransactionUser`] delivers transaction events over a tokio
//!   channel
//! - [`CommandServer`] exposes stack statistics and congestion tuning over
//!   tag-delimited XML on TCP
//!
//! The layers themselves live in their own crates and are re-exported here:
//! [`sip_core`], [`sip_transport`], [`transaction_core`] and [`infra_common`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use voxstack::{ChannelTransactionUser, SipStack, TransportConfig, TransportKind, TuEvent};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (tu, mut events) = ChannelTransactionUser::new();
//! let stack = SipStack::builder()
//!     .transport(TransportConfig::new(TransportKind::Udp, 5060))
//!     .transaction_user(Arc::new(tu))
//!     .start()?;
//!
//! while let Some(event) = events.recv().await {
//!     if let TuEvent::Request { tid, message, .. } = event {
//!         println!("{} {}", tid, message.brief());
//!     }
//! }
//! stack.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod error;
pub mod stack;
pub mod tu;

pub use command::{Command, CommandHandler, CommandResponse, CommandServer, XmlRequest};
pub use error::{Result, StackError};
pub use stack::{metric_type, timer_settings, SipStack, SipStackBuilder, StackHandle};
pub use tu::{ChannelTransactionUser, LoggingTransactionUser};

pub use voxstack_infra_common as infra_common;
pub use voxstack_sip_core as sip_core;
pub use voxstack_sip_transport as sip_transport;
pub use voxstack_transaction_core as transaction_core;

pub use voxstack_infra_common::{StackConfig, TransportConfig, TransportKind};
pub use voxstack_transaction_core::{TransactionUser, TuEvent};
