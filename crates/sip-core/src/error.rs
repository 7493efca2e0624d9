use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or building SIP messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The buffer ended before the message was complete
    #[error("incomplete message: {0}")]
    Incomplete(String),

    /// The start line was neither a request line nor a status line
    #[error("invalid start line: {0}")]
    InvalidStartLine(String),

    /// A header line could not be split into name and value
    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    /// A header the core relies on failed its typed parse
    #[error("invalid {header} header: {reason}")]
    InvalidHeader {
        header: &'static str,
        reason: String,
    },

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// Content-Length announced more bytes than were present
    #[error("body too short: Content-Length {expected}, got {actual}")]
    BodyTooShort { expected: usize, actual: usize },

    #[error("message is not valid UTF-8 in its header section")]
    NotUtf8,

    /// A mandatory header is absent
    #[error("missing {0} header")]
    MissingHeader(&'static str),
}

impl Error {
    pub(crate) fn header(header: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidHeader {
            header,
            reason: reason.into(),
        }
    }
}
