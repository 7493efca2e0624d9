//! # SIP Messages
//!
//! [`Message`] is either a [`Request`] or a [`Response`]. Both share the same
//! header list and body representation, and most accessors are provided on
//! `Message` so callers rarely need to match on the variant.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::address::NameAddr;
use crate::types::cseq::CSeq;
use crate::types::header::{Header, HeaderName};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;
use crate::types::via::Via;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(r) => Some(r),
            Message::Request(_) => None,
        }
    }

    pub fn headers(&self) -> &[Header] {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Vec<Header> {
        match self {
            Message::Request(r) => &mut r.headers,
            Message::Response(r) => &mut r.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Message::Request(r) => &r.body,
            Message::Response(r) => &r.body,
        }
    }

    /// The request method, or the CSeq method for a response
    pub fn method(&self) -> Option<Method> {
        match self {
            Message::Request(r) => Some(r.method.clone()),
            Message::Response(_) => self.cseq().map(|c| c.method.clone()),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.as_response().map(|r| r.status)
    }

    pub fn vias(&self) -> impl Iterator<Item = &Via> {
        self.headers().iter().filter_map(|h| match h {
            Header::Via(v) => Some(v),
            _ => None,
        })
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.vias().next()
    }

    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.headers_mut().iter_mut().find_map(|h| match h {
            Header::Via(v) => Some(v),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        self.headers().iter().find_map(|h| match h {
            Header::CSeq(c) => Some(c),
            _ => None,
        })
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers().iter().find_map(|h| match h {
            Header::CallId(id) => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn from_header(&self) -> Option<&NameAddr> {
        self.headers().iter().find_map(|h| match h {
            Header::From(a) => Some(a),
            _ => None,
        })
    }

    pub fn to_header(&self) -> Option<&NameAddr> {
        self.headers().iter().find_map(|h| match h {
            Header::To(a) => Some(a),
            _ => None,
        })
    }

    pub fn to_header_mut(&mut self) -> Option<&mut NameAddr> {
        self.headers_mut().iter_mut().find_map(|h| match h {
            Header::To(a) => Some(a),
            _ => None,
        })
    }

    pub fn contacts(&self) -> impl Iterator<Item = &NameAddr> {
        self.headers().iter().filter_map(|h| match h {
            Header::Contact(a) => Some(a),
            _ => None,
        })
    }

    pub fn contacts_mut(&mut self) -> impl Iterator<Item = &mut NameAddr> {
        self.headers_mut().iter_mut().filter_map(|h| match h {
            Header::Contact(a) => Some(a),
            _ => None,
        })
    }

    pub fn record_routes_mut(&mut self) -> impl Iterator<Item = &mut NameAddr> {
        self.headers_mut().iter_mut().filter_map(|h| match h {
            Header::RecordRoute(a) => Some(a),
            _ => None,
        })
    }

    pub fn referred_by_mut(&mut self) -> Option<&mut NameAddr> {
        self.headers_mut().iter_mut().find_map(|h| match h {
            Header::ReferredBy(a) => Some(a),
            _ => None,
        })
    }

    pub fn routes(&self) -> impl Iterator<Item = &NameAddr> {
        self.headers().iter().filter_map(|h| match h {
            Header::Route(a) => Some(a),
            _ => None,
        })
    }

    /// Retry-After in seconds
    pub fn retry_after(&self) -> Option<u32> {
        self.headers().iter().find_map(|h| match h {
            Header::RetryAfter(secs) => Some(*secs),
            _ => None,
        })
    }

    /// Value of an untyped header, matched case-insensitively
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers().iter().find_map(|h| match h {
            Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn has_header(&self, name: HeaderName) -> bool {
        self.headers().iter().any(|h| h.is(name))
    }

    pub fn count_header(&self, name: HeaderName) -> usize {
        self.headers().iter().filter(|h| h.is(name)).count()
    }

    pub fn remove_headers(&mut self, name: HeaderName) {
        self.headers_mut().retain(|h| !h.is(name));
    }

    pub fn push_header(&mut self, header: Header) {
        self.headers_mut().push(header);
    }

    /// Serializes to wire form with a freshly computed `Content-Length`
    pub fn to_bytes(&self) -> Bytes {
        let body = self.body();
        let mut buf = BytesMut::with_capacity(512 + body.len());
        match self {
            Message::Request(r) => {
                buf.put_slice(format!("{} {} SIP/2.0\r\n", r.method, r.uri).as_bytes())
            }
            Message::Response(r) => {
                buf.put_slice(format!("SIP/2.0 {} {}\r\n", r.status, r.reason).as_bytes())
            }
        }
        for header in self.headers() {
            buf.put_slice(header.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        buf.put_slice(body);
        buf.freeze()
    }

    /// One-line summary for logs, e.g. `INVITE sip:bob@host tid=z9hG4bK...`
    pub fn brief(&self) -> String {
        let tid = self.transaction_id().unwrap_or_default();
        match self {
            Message::Request(r) => format!("{} {} tid={}", r.method, r.uri, tid),
            Message::Response(r) => format!(
                "{} {}/{} tid={}",
                r.status,
                self.cseq().map(|c| c.method.to_string()).unwrap_or_default(),
                self.cseq().map(|c| c.seq).unwrap_or_default(),
                tid
            ),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}
