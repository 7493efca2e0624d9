//! Tag-delimited XML framing for the command server.
//!
//! A request is one top-level element, `<Tag>...</Tag>`, with no attributes
//! and no namespaces. Several requests may arrive in one read; they are
//! taken off the front of the buffer one at a time. Child values are found
//! by name anywhere inside the element, so both
//! `<GetStackInfo><RequestId>7</RequestId></GetStackInfo>` and a body wrapped
//! in `<Request>` work.

use std::fmt::Write as _;

use thiserror::Error;

/// Bytes a connection may buffer without completing a request
pub const MAX_PENDING: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("expected '<' at start of request, found {0:?}")]
    NotATag(char),
    #[error("malformed opening tag")]
    BadTag,
    #[error("request exceeds {} bytes", MAX_PENDING)]
    TooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlRequest {
    pub tag: String,
    pub body: String,
}

impl XmlRequest {
    /// Unescaped text of the first `<name>` element in the body. Names
    /// compare case-insensitively.
    pub fn child(&self, name: &str) -> Option<String> {
        let lower = self.body.to_ascii_lowercase();
        let open = format!("<{}>", name.to_ascii_lowercase());
        let close = format!("</{}>", name.to_ascii_lowercase());
        let start = lower.find(&open)? + open.len();
        let end = start + lower[start..].find(&close)?;
        Some(unescape(self.body[start..end].trim()))
    }

    pub fn request_id(&self) -> Option<u32> {
        self.child("RequestId")?.parse().ok()
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag.eq_ignore_ascii_case(tag)
    }
}

/// Takes the first complete request off the front of `buffer`.
///
/// `Ok(None)` means more data is needed. On error the offending bytes up to
/// the next `<` are discarded so the connection can resynchronise.
pub fn take_request(buffer: &mut String) -> Result<Option<XmlRequest>, FrameError> {
    let skipped = buffer.len() - buffer.trim_start().len();
    buffer.drain(..skipped);
    if buffer.starts_with("<?") {
        match buffer.find("?>") {
            Some(end) => {
                buffer.drain(..end + 2);
                return take_request(buffer);
            }
            None => return Ok(None),
        }
    }

    let first = match buffer.chars().next() {
        Some(c) => c,
        None => return Ok(None),
    };
    if first != '<' {
        discard_to_next_tag(buffer);
        return Err(FrameError::NotATag(first));
    }

    let open_end = match buffer.find('>') {
        Some(i) => i,
        None if buffer.len() > MAX_PENDING => {
            buffer.clear();
            return Err(FrameError::TooLarge);
        }
        None => return Ok(None),
    };
    let tag = buffer[1..open_end].trim().to_string();
    let valid = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !valid {
        discard_to_next_tag(buffer);
        return Err(FrameError::BadTag);
    }

    let close = format!("</{}>", tag.to_ascii_lowercase());
    let rest = buffer[open_end + 1..].to_ascii_lowercase();
    match rest.find(&close) {
        Some(i) => {
            let body_start = open_end + 1;
            let body = buffer[body_start..body_start + i].to_string();
            buffer.drain(..body_start + i + close.len());
            Ok(Some(XmlRequest { tag, body }))
        }
        None if buffer.len() > MAX_PENDING => {
            buffer.clear();
            Err(FrameError::TooLarge)
        }
        None => Ok(None),
    }
}

fn discard_to_next_tag(buffer: &mut String) {
    let skip = buffer.chars().next().map_or(0, char::len_utf8);
    match buffer[skip..].find('<') {
        Some(i) => {
            buffer.drain(..i + skip);
        }
        None => buffer.clear(),
    }
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// `<Tag><RequestId>n</RequestId><Result Code="c">text</Result><Data>..</Data></Tag>`;
/// the `Data` element is left out when `data` is empty
pub fn format_response(tag: &str, request_id: u32, code: u16, text: &str, data: &str) -> String {
    let mut out = String::new();
    let _ = write!(out, "<{}>\r\n", tag);
    let _ = write!(out, "  <RequestId>{}</RequestId>\r\n", request_id);
    let _ = write!(out, "  <Result Code=\"{}\">{}</Result>\r\n", code, escape(text));
    if !data.is_empty() {
        let _ = write!(out, "  <Data>\r\n{}  </Data>\r\n", escape(data));
    }
    let _ = write!(out, "</{}>\r\n", tag);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipelined_requests() {
        let mut buffer = String::from(
            "<GetStackInfo><RequestId>4</RequestId></GetStackInfo>\r\n<Shutdown></Shutdown><Get",
        );
        let first = take_request(&mut buffer).unwrap().unwrap();
        assert!(first.is("getstackinfo"));
        assert_eq!(first.request_id(), Some(4));

        let second = take_request(&mut buffer).unwrap().unwrap();
        assert_eq!(second.tag, "Shutdown");
        assert_eq!(second.request_id(), None);

        assert_eq!(take_request(&mut buffer).unwrap(), None);
        assert_eq!(buffer, "<Get");
        buffer.push_str("CongestionStats/></GetCongestionStats>");
        assert_eq!(take_request(&mut buffer), Err(FrameError::BadTag));
    }

    #[test]
    fn test_children_and_case() {
        let mut buffer = String::from(
            "<?xml version=\"1.0\"?><SetCongestionTolerance><Request>\
             <fifoDescription>state machine</fifoDescription><Metric>SIZE</Metric>\
             <maxtolerance> 200 </maxtolerance></Request></setcongestiontolerance>",
        );
        let request = take_request(&mut buffer).unwrap().unwrap();
        assert!(buffer.is_empty());
        assert_eq!(request.child("FifoDescription").as_deref(), Some("state machine"));
        assert_eq!(request.child("metric").as_deref(), Some("SIZE"));
        assert_eq!(request.child("maxtolerance").as_deref(), Some("200"));
        assert_eq!(request.child("missing"), None);
    }

    #[test]
    fn test_garbage_is_skipped() {
        let mut buffer = String::from("hello <Shutdown></Shutdown>");
        assert_eq!(take_request(&mut buffer), Err(FrameError::NotATag('h')));
        assert_eq!(take_request(&mut buffer).unwrap().unwrap().tag, "Shutdown");
    }

    #[test]
    fn test_response_format() {
        let text = format_response("GetStackInfo", 3, 200, "ok & done", "a<b\r\n");
        assert_eq!(
            text,
            "<GetStackInfo>\r\n  <RequestId>3</RequestId>\r\n  <Result Code=\"200\">ok &amp; done</Result>\r\n  \
             <Data>\r\na&lt;b\r\n  </Data>\r\n</GetStackInfo>\r\n"
        );
        assert!(!format_response("Shutdown", 1, 200, "bye", "").contains("<Data>"));
    }
}
