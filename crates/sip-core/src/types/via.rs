//! # Via header
//!
//! `Via: SIP/2.0/<transport> <sent-by>[;params]`, one value per [`Via`]
//! ([RFC 3261 Section 20.42](https://datatracker.ietf.org/doc/html/rfc3261#section-20.42)).
//!
//! The transaction layer reads the `branch` parameter to derive the transaction id.
//! The transport layer fills in `sent_host`/`sent_port`/`transport` on the way out
//! and stamps `received`/`rport` on the way in.

use std::fmt;

use crate::types::param::Params;
use crate::types::uri::format_host;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Via {
    /// Protocol name and version, almost always `SIP/2.0`
    pub protocol: String,
    /// Transport token, upper case (`UDP`, `TCP`, `TLS`, `DTLS`, ...)
    pub transport: String,
    /// Sent-by host. Empty until the transport selector fills it in.
    pub sent_host: String,
    /// Sent-by port. `None` when absent on the wire.
    pub sent_port: Option<u16>,
    pub params: Params,
}

impl Via {
    /// A Via with a fresh branch and an empty sent-by, left for the
    /// transport selector to complete.
    pub fn new(transport: impl Into<String>, branch: impl Into<String>) -> Self {
        let mut params = Params::new();
        params.set("branch", Some(branch.into()));
        Via {
            protocol: "SIP/2.0".to_string(),
            transport: transport.into(),
            sent_host: String::new(),
            sent_port: None,
            params,
        }
    }

    pub fn with_sent_by(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.sent_host = host.into();
        self.sent_port = port;
        self
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.params.set("branch", Some(branch.into()));
    }

    pub fn received(&self) -> Option<&str> {
        self.params.value("received")
    }

    pub fn set_received(&mut self, received: impl Into<String>) {
        self.params.set("received", Some(received.into()));
    }

    /// `Some(None)` when `rport` is present without a value
    pub fn rport(&self) -> Option<Option<u16>> {
        self.params
            .get("rport")
            .map(|v| v.and_then(|port| port.parse().ok()))
    }

    pub fn set_rport(&mut self, port: u16) {
        self.params.set("rport", Some(port.to_string()));
    }

    pub fn maddr(&self) -> Option<&str> {
        self.params.value("maddr")
    }

    /// `host[:port]`
    pub fn sent_by(&self) -> String {
        match self.sent_port {
            Some(port) => format!("{}:{}", format_host(&self.sent_host), port),
            None => format_host(&self.sent_host),
        }
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {}{}",
            self.protocol,
            self.transport,
            self.sent_by(),
            self.params
        )
    }
}
