//! Message construction helpers used by the transaction and transport layers.
//!
//! These follow the header-copying rules of RFC 3261:
//!
//! - responses: section 8.2.6.2
//! - CANCEL: section 9.1
//! - ACK for non-2xx final responses: section 17.1.1.3

use rand::Rng;

use crate::types::cseq::CSeq;
use crate::types::header::Header;
use crate::types::message::{Message, Request, Response};
use crate::types::method::Method;
use crate::types::status::StatusCode;

/// RFC 3261 branch prefix
pub const MAGIC_COOKIE: &str = "z9hG4bK";

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// A fresh RFC 3261 compliant branch parameter
pub fn generate_branch() -> String {
    format!("{}{}", MAGIC_COOKIE, random_hex(16))
}

/// A fresh From/To tag
pub fn generate_tag() -> String {
    random_hex(8)
}

impl Message {
    /// The transaction identifier.
    ///
    /// For RFC 3261 peers this is the top Via branch. For RFC 2543 peers
    /// (no magic cookie) it is computed from Call-ID, From tag, CSeq number
    /// and the top Via sent-by. The CSeq method is excluded so an ACK for a
    /// non-2xx response maps onto its INVITE; CANCEL disambiguation is left to
    /// the transaction layer.
    pub fn transaction_id(&self) -> Option<String> {
        let via = self.top_via()?;
        if let Some(branch) = via.branch() {
            let has_cookie = branch
                .get(..MAGIC_COOKIE.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(MAGIC_COOKIE));
            if has_cookie && branch.len() > MAGIC_COOKIE.len() {
                return Some(branch.to_string());
            }
        }
        let cseq = self.cseq()?;
        Some(format!(
            "{}|{}|{}|{}|{}",
            self.call_id().unwrap_or_default(),
            self.from_header().and_then(|f| f.tag()).unwrap_or_default(),
            cseq.seq,
            via.sent_by(),
            via.branch().unwrap_or_default(),
        ))
    }
}

/// Builds a response to `request`, copying Via, From, To, Call-ID and CSeq.
/// A To tag is added to non-100 responses when the request had none.
pub fn make_response(request: &Request, status: StatusCode, reason: Option<&str>) -> Response {
    let mut response = Response::new(status);
    if let Some(reason) = reason {
        response.reason = reason.to_string();
    }
    for header in &request.headers {
        match header {
            Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                response.headers.push(header.clone())
            }
            Header::To(to) => {
                let mut to = to.clone();
                if status != StatusCode::TRYING && to.tag().is_none() {
                    to.set_tag(generate_tag());
                }
                response.headers.push(Header::To(to));
            }
            _ => {}
        }
    }
    response
}

/// Builds a CANCEL for a client INVITE: same Request-URI, top Via, Call-ID,
/// From, To, CSeq number and Route set.
pub fn make_cancel(request: &Request) -> Request {
    let mut cancel = Request::new(Method::Cancel, request.uri.clone());
    let mut via_copied = false;
    for header in &request.headers {
        match header {
            Header::Via(_) if !via_copied => {
                via_copied = true;
                cancel.headers.push(header.clone());
            }
            Header::From(_) | Header::To(_) | Header::CallId(_) | Header::Route(_) => {
                cancel.headers.push(header.clone())
            }
            Header::CSeq(cseq) => cancel
                .headers
                .push(Header::CSeq(CSeq::new(cseq.seq, Method::Cancel))),
            _ => {}
        }
    }
    cancel.headers.push(Header::MaxForwards(70));
    cancel
}

/// Builds the hop-by-hop ACK for a non-2xx final response to an INVITE.
/// The To header (with its tag) comes from the response.
pub fn make_failure_ack(request: &Request, response: &Response) -> Request {
    let mut ack = Request::new(Method::Ack, request.uri.clone());
    let mut via_copied = false;
    for header in &request.headers {
        match header {
            Header::Via(_) if !via_copied => {
                via_copied = true;
                ack.headers.push(header.clone());
            }
            Header::From(_) | Header::CallId(_) | Header::Route(_) => {
                ack.headers.push(header.clone())
            }
            Header::To(original) => {
                let to = response
                    .headers
                    .iter()
                    .find_map(|h| match h {
                        Header::To(to) => Some(to.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| original.clone());
                ack.headers.push(Header::To(to));
            }
            Header::CSeq(cseq) => ack
                .headers
                .push(Header::CSeq(CSeq::new(cseq.seq, Method::Ack))),
            _ => {}
        }
    }
    ack.headers.push(Header::MaxForwards(70));
    ack
}

/// 503 with `Retry-After`. ACKs never get a response.
pub fn make_503(request: &Request, retry_after_secs: u32) -> Option<Response> {
    if request.method == Method::Ack {
        return None;
    }
    let mut response = make_response(request, StatusCode::SERVICE_UNAVAILABLE, None);
    response.headers.push(Header::RetryAfter(retry_after_secs));
    Some(response)
}

/// A `Warning: <code> <agent> "<text>"` header
pub fn make_warning(code: u16, agent: &str, text: &str) -> Header {
    let text = text.replace('"', "'");
    Header::Other("Warning".to_string(), format!("{} {} \"{}\"", code, agent, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_message;

    fn invite() -> Request {
        let raw = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKnashds8\r\n\
Via: SIP/2.0/UDP proxy.atlanta.com;branch=z9hG4bKproxy\r\n\
Route: <sip:p1.biloxi.com;lr>\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.atlanta.com>\r\n\r\n";
        match parse_message(raw).unwrap() {
            Message::Request(r) => r,
            Message::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn test_branch_and_tag_shape() {
        let branch = generate_branch();
        assert!(branch.starts_with(MAGIC_COOKIE));
        assert_eq!(branch.len(), MAGIC_COOKIE.len() + 16);
        assert_ne!(generate_branch(), branch);
        assert_eq!(generate_tag().len(), 8);
    }

    #[test]
    fn test_response_copies_and_tags() {
        let req = invite();
        let trying = make_response(&req, StatusCode::TRYING, None);
        assert_eq!(Message::from(trying.clone()).to_header().unwrap().tag(), None);
        assert_eq!(Message::from(trying).vias().count(), 2);

        let ringing = Message::from(make_response(&req, StatusCode::RINGING, Some("Ringing!")));
        assert!(ringing.to_header().unwrap().tag().is_some());
        assert!(ringing.contacts().next().is_none());
        assert_eq!(ringing.as_response().unwrap().reason, "Ringing!");
        assert_eq!(
            ringing.transaction_id(),
            Message::from(req).transaction_id()
        );
    }

    #[test]
    fn test_cancel_matches_invite_branch() {
        let req = invite();
        let cancel = Message::from(make_cancel(&req));
        assert_eq!(cancel.vias().count(), 1);
        assert_eq!(cancel.method(), Some(Method::Cancel));
        assert_eq!(cancel.cseq().unwrap().seq, 314159);
        assert_eq!(cancel.routes().count(), 1);
        assert_eq!(cancel.transaction_id().as_deref(), Some("z9hG4bKnashds8"));
    }

    #[test]
    fn test_failure_ack_takes_to_from_response() {
        let req = invite();
        let resp = make_response(&req, StatusCode::from_u16(486).unwrap(), None);
        let resp_tag = Message::from(resp.clone()).to_header().unwrap().tag().map(str::to_string);
        let ack = Message::from(make_failure_ack(&req, &resp));
        assert_eq!(ack.method(), Some(Method::Ack));
        assert_eq!(ack.to_header().unwrap().tag().map(str::to_string), resp_tag);
        assert_eq!(ack.transaction_id().as_deref(), Some("z9hG4bKnashds8"));
    }

    #[test]
    fn test_503_not_for_ack() {
        let req = invite();
        let resp = Message::from(make_503(&req, 7).unwrap());
        assert_eq!(resp.retry_after(), Some(7));
        let ack = make_failure_ack(&req, &make_response(&req, StatusCode::REQUEST_TIMEOUT, None));
        assert!(make_503(&ack, 7).is_none());
    }

    #[test]
    fn test_rfc2543_transaction_id() {
        let raw = b"OPTIONS sip:b SIP/2.0\r\nVia: SIP/2.0/UDP host:5060;branch=old1\r\n\
From: <sip:a@x>;tag=t1\r\nCall-ID: c1\r\nCSeq: 9 OPTIONS\r\n\r\n";
        let msg = parse_message(raw).unwrap();
        assert_eq!(msg.transaction_id().as_deref(), Some("c1|t1|9|host:5060|old1"));
    }
}
