use bytes::Bytes;
use nom::{
    bytes::complete::{tag_no_case, take_till1, take_while_m_n},
    character::complete::{space0, space1},
    combinator::{all_consuming, map_res, opt, rest},
    sequence::preceded,
};

use super::common::{sip_version, token};
use super::header::parse_header;
use super::uri::parse_uri;
use super::ParseResult;
use crate::error::{Error, Result};
use crate::types::message::{Message, Request, Response};
use crate::types::method::Method;
use crate::types::status::StatusCode;

fn request_line(input: &str) -> ParseResult<(&str, &str)> {
    let (input, method) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, uri) = take_till1(|c| c == ' ')(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = sip_version(input)?;
    let (input, _) = space0(input)?;
    Ok((input, (method, uri)))
}

fn status_line(input: &str) -> ParseResult<(u16, &str)> {
    let (input, _) = sip_version(input)?;
    let (input, _) = space1(input)?;
    let (input, code) = map_res(
        take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
        |s: &str| s.parse::<u16>(),
    )(input)?;
    let (input, reason) = opt(preceded(space1, rest))(input)?;
    Ok((input, (code, reason.unwrap_or("").trim())))
}

/// Position of the blank line ending the header section:
/// `(end of headers, start of body)`
pub fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, i + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Splits the header section into logical lines, unfolding continuation
/// lines that start with whitespace.
fn unfold_lines(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in head.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(line.trim_start());
                continue;
            }
        }
        lines.push(line.to_string());
    }
    lines
}

/// Parses one complete SIP message from a buffer.
///
/// Leading CRLFs are ignored (RFC 3261 section 7.5). When `Content-Length`
/// is present exactly that many body bytes are taken; when it is absent the
/// rest of the buffer is the body, which is only legitimate for datagrams.
pub fn parse_message(buf: &[u8]) -> Result<Message> {
    let start = buf
        .iter()
        .position(|b| *b != b'\r' && *b != b'\n')
        .ok_or_else(|| Error::Incomplete("empty buffer".to_string()))?;
    let buf = &buf[start..];

    let (head_end, body_start) = find_header_end(buf)
        .ok_or_else(|| Error::Incomplete("no end of header section".to_string()))?;
    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| Error::NotUtf8)?;
    let lines = unfold_lines(head);
    let (first, header_lines) = lines
        .split_first()
        .ok_or_else(|| Error::InvalidStartLine(String::new()))?;

    let mut headers = Vec::new();
    let mut content_length = None;
    for line in header_lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::MalformedHeader(line.clone()))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::MalformedHeader(line.clone()));
        }
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::header("Content-Length", value.trim().to_string()))?;
            content_length = Some(len);
            continue;
        }
        headers.extend(parse_header(name, value)?);
    }

    let available = buf.len() - body_start;
    let body = match content_length {
        Some(expected) if expected > available => {
            return Err(Error::BodyTooShort {
                expected,
                actual: available,
            })
        }
        Some(expected) => Bytes::copy_from_slice(&buf[body_start..body_start + expected]),
        None => Bytes::copy_from_slice(&buf[body_start..]),
    };

    let is_response = tag_no_case::<_, _, nom::error::Error<&str>>("SIP/")(first.as_str()).is_ok();
    if is_response {
        let (_, (code, reason)) = all_consuming(status_line)(first.as_str())
            .map_err(|_| Error::InvalidStartLine(first.clone()))?;
        let status =
            StatusCode::from_u16(code).ok_or_else(|| Error::InvalidStartLine(first.clone()))?;
        Ok(Message::Response(Response {
            status,
            reason: reason.to_string(),
            headers,
            body,
        }))
    } else {
        let (_, (method, uri)) = all_consuming(request_line)(first.as_str())
            .map_err(|_| Error::InvalidStartLine(first.clone()))?;
        let method: Method = method.parse()?;
        Ok(Message::Request(Request {
            method,
            uri: parse_uri(uri)?,
            headers,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::header::Header;

    const INVITE: &str = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.atlanta.com>\r\n\
Subject: lunch\r\n\x20tomorrow\r\n\
Content-Length: 4\r\n\r\nv=0\n";

    #[test]
    fn test_parse_invite() {
        let msg = parse_message(INVITE.as_bytes()).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.uri.host, "biloxi.com");
        assert_eq!(msg.call_id(), Some("a84b4c76e66710@pc33.atlanta.com"));
        assert_eq!(msg.cseq().unwrap().seq, 314159);
        assert_eq!(msg.header_value("subject"), Some("lunch tomorrow"));
        assert_eq!(msg.body().as_ref(), b"v=0\n");
        assert!(msg.headers().iter().any(|h| matches!(h, Header::MaxForwards(70))));
    }

    #[test]
    fn test_parse_response_without_reason() {
        let raw = b"SIP/2.0 180\r\nVia: SIP/2.0/UDP a.com;branch=z9hG4bK1\r\nCSeq: 1 INVITE\r\n\r\n";
        let msg = parse_message(raw).unwrap();
        assert_eq!(msg.status(), Some(StatusCode::RINGING));
        assert_eq!(msg.method(), Some(Method::Invite));
    }

    #[test]
    fn test_encode_reparse_keeps_headers() {
        let msg = parse_message(INVITE.as_bytes()).unwrap();
        let again = parse_message(&msg.to_bytes()).unwrap();
        assert_eq!(msg, again);
    }

    #[test]
    fn test_body_too_short_and_bad_lines() {
        let raw = b"SIP/2.0 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(parse_message(raw), Err(Error::BodyTooShort { expected: 10, actual: 3 })));
        assert!(matches!(parse_message(b"garbage\r\n\r\n"), Err(Error::InvalidStartLine(_))));
        assert!(matches!(parse_message(b"SIP/2.0 99 Low\r\n\r\n"), Err(Error::InvalidStartLine(_))));
        assert!(matches!(parse_message(b"OPTIONS sip:a SIP/2.0\r\nNoColon\r\n\r\n"), Err(Error::MalformedHeader(_))));
        assert!(parse_message(b"\r\n\r\n").is_err());
    }

    #[test]
    fn test_leading_crlf_ignored() {
        let raw = b"\r\n\r\nSIP/2.0 200 OK\r\nCSeq: 2 BYE\r\n\r\n";
        assert_eq!(parse_message(raw).unwrap().status(), Some(StatusCode::OK));
    }
}
