//! # Headers
//!
//! Headers are kept in wire order as a list of [`Header`] values. The ones the
//! core reads or rewrites are parsed into typed variants; everything else is an
//! [`Header::Other`] name/value pair that is re-emitted verbatim.
//!
//! `Content-Length` is never stored: it is recomputed from the body on encode.

use std::fmt;

use crate::types::address::NameAddr;
use crate::types::cseq::CSeq;
use crate::types::via::Via;

/// Canonical names of the typed headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    Route,
    RecordRoute,
    ReferredBy,
    MaxForwards,
    ContentLength,
    RetryAfter,
}

impl HeaderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::Contact => "Contact",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::ReferredBy => "Referred-By",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::RetryAfter => "Retry-After",
        }
    }

    /// Maps a wire header name (long or compact form, any case) to a typed name
    pub fn from_wire(name: &str) -> Option<HeaderName> {
        let lower = name.to_ascii_lowercase();
        Some(match lower.as_str() {
            "via" | "v" => HeaderName::Via,
            "from" | "f" => HeaderName::From,
            "to" | "t" => HeaderName::To,
            "call-id" | "i" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "contact" | "m" => HeaderName::Contact,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            "referred-by" | "b" => HeaderName::ReferredBy,
            "max-forwards" => HeaderName::MaxForwards,
            "content-length" | "l" => HeaderName::ContentLength,
            "retry-after" => HeaderName::RetryAfter,
            _ => return None,
        })
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Via(Via),
    From(NameAddr),
    To(NameAddr),
    CallId(String),
    CSeq(CSeq),
    /// One Contact value; `Contact: *` is kept as [`Header::Other`]
    Contact(NameAddr),
    Route(NameAddr),
    RecordRoute(NameAddr),
    ReferredBy(NameAddr),
    MaxForwards(u32),
    /// Seconds
    RetryAfter(u32),
    Other(String, String),
}

impl Header {
    pub fn name(&self) -> &str {
        match self {
            Header::Via(_) => HeaderName::Via.as_str(),
            Header::From(_) => HeaderName::From.as_str(),
            Header::To(_) => HeaderName::To.as_str(),
            Header::CallId(_) => HeaderName::CallId.as_str(),
            Header::CSeq(_) => HeaderName::CSeq.as_str(),
            Header::Contact(_) => HeaderName::Contact.as_str(),
            Header::Route(_) => HeaderName::Route.as_str(),
            Header::RecordRoute(_) => HeaderName::RecordRoute.as_str(),
            Header::ReferredBy(_) => HeaderName::ReferredBy.as_str(),
            Header::MaxForwards(_) => HeaderName::MaxForwards.as_str(),
            Header::RetryAfter(_) => HeaderName::RetryAfter.as_str(),
            Header::Other(name, _) => name,
        }
    }

    pub fn is(&self, name: HeaderName) -> bool {
        self.name().eq_ignore_ascii_case(name.as_str())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.name())?;
        match self {
            Header::Via(v) => write!(f, "{}", v),
            Header::From(a)
            | Header::To(a)
            | Header::Contact(a)
            | Header::Route(a)
            | Header::RecordRoute(a)
            | Header::ReferredBy(a) => write!(f, "{}", a),
            Header::CallId(id) => f.write_str(id),
            Header::CSeq(c) => write!(f, "{}", c),
            Header::MaxForwards(n) | Header::RetryAfter(n) => write!(f, "{}", n),
            Header::Other(_, value) => f.write_str(value),
        }
    }
}
