//! # SIP URIs
//!
//! A reduced form of the `SIP-URI` / `SIPS-URI` grammar from
//! [RFC 3261 Section 19.1](https://datatracker.ietf.org/doc/html/rfc3261#section-19.1).
//! Only what routing needs is modelled: scheme, user, host, port, parameters.
//! URI headers (`?...`) are preserved as an opaque string.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::Error;
use crate::types::param::Params;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
    Tel,
    Other(String),
}

impl Scheme {
    pub fn as_str(&self) -> &str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
            Scheme::Other(s) => s,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed URI.
///
/// `host` never includes IPv6 brackets; they are added back on display.
/// An empty `host` marks a URI the transport selector should fill in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Option<String>,
}

impl Uri {
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Uri {
            scheme,
            user: None,
            host: host.into(),
            port: None,
            params: Params::new(),
            headers: None,
        }
    }

    pub fn sip(host: impl Into<String>) -> Self {
        Uri::new(Scheme::Sip, host)
    }

    pub fn sips(host: impl Into<String>) -> Self {
        Uri::new(Scheme::Sips, host)
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.set(name, value.map(str::to_string));
        self
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    /// Value of the `transport=` parameter, if any
    pub fn transport_param(&self) -> Option<&str> {
        self.params.value("transport")
    }

    /// The host as an IP address, if it is numeric
    pub fn host_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// `host[:port]` with brackets around IPv6 literals
    pub fn host_port(&self) -> String {
        let host = format_host(&self.host);
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }
}

pub(crate) fn format_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}{}", self.host_port(), self.params)?;
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::parser::uri::parse_uri(s)
    }
}
