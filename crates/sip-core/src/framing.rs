//! Message boundary detection for stream transports.
//!
//! A TCP or TLS byte stream carries back-to-back SIP messages with no
//! framing other than the header/body structure itself, plus the RFC 5626
//! keep-alive exchange (`CRLFCRLF` ping, `CRLF` pong). [`scan_stream`]
//! looks at the front of a connection's receive buffer and reports what
//! the next complete unit is, if any.

use crate::parser::message::find_header_end;

/// Header sections larger than this without a terminating blank line are
/// treated as garbage rather than waited on forever.
pub const MAX_HEADER_SECTION: usize = 64 * 1024;

/// What sits at the front of a stream buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Not enough bytes yet
    Incomplete,
    /// A complete message occupying the first `len` bytes
    Message { len: usize },
    /// A `CRLFCRLF` keep-alive ping (4 bytes); answer with a pong
    Ping,
    /// A lone `CRLF` keep-alive pong (2 bytes)
    Pong,
    /// Unrecoverable framing error; the connection should be dropped
    Invalid(String),
}

/// Scans the front of `buf` for the next frame.
///
/// # Examples
///
/// ```
/// use voxstack_sip_core::{scan_stream, StreamFrame};
///
/// assert_eq!(scan_stream(b"\r\n\r\n"), StreamFrame::Ping);
/// assert_eq!(scan_stream(b"OPTIONS sip:a SIP/2.0\r\n"), StreamFrame::Incomplete);
/// ```
pub fn scan_stream(buf: &[u8]) -> StreamFrame {
    if buf.starts_with(b"\r\n\r\n") {
        return StreamFrame::Ping;
    }
    if buf.starts_with(b"\r\n") {
        // Could still become a ping
        if buf.len() < 4 && b"\r\n\r\n".starts_with(buf) {
            return StreamFrame::Incomplete;
        }
        return StreamFrame::Pong;
    }
    if buf.is_empty() || buf == b"\r" {
        return StreamFrame::Incomplete;
    }

    let (head_end, body_start) = match find_header_end(buf) {
        Some(found) => found,
        None if buf.len() > MAX_HEADER_SECTION => {
            return StreamFrame::Invalid("header section too large".to_string())
        }
        None => return StreamFrame::Incomplete,
    };

    let content_length = match content_length(&buf[..head_end]) {
        Ok(len) => len.unwrap_or(0),
        Err(reason) => return StreamFrame::Invalid(reason),
    };

    let total = body_start + content_length;
    if buf.len() >= total {
        StreamFrame::Message { len: total }
    } else {
        StreamFrame::Incomplete
    }
}

fn content_length(head: &[u8]) -> Result<Option<usize>, String> {
    let head = std::str::from_utf8(head).map_err(|_| "header section is not UTF-8".to_string())?;
    for line in head.split('\n') {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| format!("bad Content-Length '{}'", value.trim()));
        }
    }
    Ok(None)
}
