//! Parsers for the SIP wire format.
//!
//! The header section is validated as UTF-8 once, then split into lines,
//! unfolded and handed to the per-header parsers in [`header`]. The small
//! grammar pieces (start lines, Via, host/port, parameters) are nom
//! combinators over `&str`.

pub mod common;
pub mod header;
pub mod message;
pub mod uri;

pub use message::parse_message;

/// Result type of the nom combinators in this module
pub type ParseResult<'a, O> = nom::IResult<&'a str, O>;
