//! # voxstack-sip-core
//!
//! The SIP message model used by the voxstack transport and transaction layers.
//!
//! This crate deliberately covers only the part of RFC 3261 that the transaction
//! and transport core needs to do its job:
//!
//! - Request and status lines, methods and status codes
//! - SIP/SIPS URIs with parameters
//! - The headers the core inspects or rewrites: `Via`, `From`, `To`, `Call-ID`,
//!   `CSeq`, `Contact`, `Route`, `Record-Route`, `Referred-By`, `Max-Forwards`,
//!   `Retry-After` and `Content-Length`
//! - Every other header is carried verbatim as an opaque name/value pair
//!
//! ## Parsing and encoding
//!
//! ```
//! use voxstack_sip_core::{parse_message, Method};
//!
//! let raw = b"OPTIONS sip:bob@192.0.2.4 SIP/2.0\r\n\
//! Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK776asdhds\r\n\
//! From: <sip:alice@example.com>;tag=1928301774\r\n\
//! To: <sip:bob@example.com>\r\n\
//! Call-ID: a84b4c76e66710\r\n\
//! CSeq: 314159 OPTIONS\r\n\
//! Content-Length: 0\r\n\r\n";
//!
//! let message = parse_message(raw).unwrap();
//! assert_eq!(message.method(), Some(Method::Options));
//! assert_eq!(message.transaction_id().as_deref(), Some("z9hG4bK776asdhds"));
//! ```
//!
//! ## Stream framing
//!
//! Stream transports have no datagram boundaries, so [`framing::scan_stream`]
//! is used to find where one message ends and the next begins.

pub mod error;
pub mod framing;
pub mod helpers;
pub mod parser;
pub mod types;

pub use error::{Error, Result};
pub use framing::{scan_stream, StreamFrame};
pub use helpers::{
    generate_branch, generate_tag, make_503, make_cancel, make_failure_ack, make_response,
    make_warning, MAGIC_COOKIE,
};
pub use parser::parse_message;
pub use types::address::NameAddr;
pub use types::cseq::CSeq;
pub use types::header::{Header, HeaderName};
pub use types::message::{Message, Request, Response};
pub use types::method::Method;
pub use types::param::{Param, Params};
pub use types::status::StatusCode;
pub use types::uri::{Scheme, Uri};
pub use types::via::Via;

/// Commonly used types
pub mod prelude {
    pub use crate::{
        parse_message, CSeq, Error, Header, HeaderName, Message, Method, NameAddr, Param, Params,
        Request, Response, Result, Scheme, StatusCode, Uri, Via,
    };
}
