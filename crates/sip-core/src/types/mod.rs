//! Typed representations of the SIP message pieces the core works with.

pub mod address;
pub mod cseq;
pub mod header;
pub mod message;
pub mod method;
pub mod param;
pub mod status;
pub mod uri;
pub mod via;
