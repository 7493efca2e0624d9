//! File-based stack configuration
//!
//! A stack is described by one TOML document:
//!
//! ```toml
//! command_server = "127.0.0.1:5081"
//!
//! [logging]
//! level = "debug"
//!
//! [timers]
//! t1_ms = 500
//!
//! [[transports]]
//! type = "udp"
//! port = 5060
//!
//! [[transports]]
//! type = "tls"
//! port = 5061
//! tls_domain = "sip.example.com"
//! cert_file = "/etc/voxstack/sip.example.com.crt"
//! key_file = "/etc/voxstack/sip.example.com.key"
//!
//! [[congestion]]
//! fifo = "state machine"
//! metric = "WAIT_TIME"
//! max_tolerance = 200
//! ```
//!
//! Every section is optional. The types here are plain data; the facade
//! crate turns them into transports, timer settings and congestion
//! tolerances.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::errors::{ConfigError, Result};
use crate::logging::{parse_log_level, LoggingConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub transports: Vec<TransportConfig>,
    pub timers: TimerConfig,
    pub congestion: Vec<CongestionConfig>,
    pub logging: LogSettings,
    /// Address the XML command server listens on; no server when absent
    pub command_server: Option<String>,
    /// Depth bound of the controller queue, 0 for unbounded
    pub fifo_max_depth: usize,
    pub max_messages_per_pass: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            transports: Vec::new(),
            timers: TimerConfig::default(),
            congestion: Vec::new(),
            logging: LogSettings::default(),
            command_server: None,
            fifo_max_depth: 0,
            max_messages_per_pass: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Dtls,
}

impl TransportKind {
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Dtls)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    V4,
    V6,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    /// Local address to bind; empty binds every interface
    #[serde(default)]
    pub interface: String,
    pub port: u16,
    #[serde(default)]
    pub ip_version: IpFamily,
    /// Domain whose certificate a TLS or DTLS transport presents
    #[serde(default)]
    pub tls_domain: String,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Run the transport on a thread of its own instead of the controller loop
    #[serde(default)]
    pub own_thread: bool,
}

impl TransportConfig {
    pub fn new(kind: TransportKind, port: u16) -> Self {
        TransportConfig {
            kind,
            interface: String::new(),
            port,
            ip_version: IpFamily::V4,
            tls_domain: String::new(),
            cert_file: None,
            key_file: None,
            own_thread: false,
        }
    }
}

/// Transaction timer values. Zero-free RFC 3261 defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub t100_ms: u64,
    pub trying_ms: u64,
    pub timeout_multiplier: u32,
    pub timer_c_secs: u64,
    pub timer_d_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            t1_ms: 500,
            t2_ms: 4_000,
            t4_ms: 5_000,
            t100_ms: 80,
            trying_ms: 3_500,
            timeout_multiplier: 64,
            timer_c_secs: 180,
            timer_d_ms: 32_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Metric {
    Size,
    TimeDepth,
    WaitTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CongestionConfig {
    /// Description of the FIFO, e.g. `state machine`
    pub fifo: String,
    pub metric: Metric,
    pub max_tolerance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
    pub spans: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: "info".to_string(),
            json: false,
            file_info: false,
            spans: false,
        }
    }
}

impl LogSettings {
    pub fn to_logging_config(&self, app_name: &str) -> Result<LoggingConfig> {
        let level: Level = parse_log_level(&self.level)?;
        Ok(LoggingConfig {
            level,
            json: self.json,
            file_info: self.file_info,
            log_spans: self.spans,
            app_name: app_name.to_string(),
        })
    }
}

impl StackConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StackConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, t) in self.transports.iter().enumerate() {
            if t.kind.is_secure() && (t.cert_file.is_none() != t.key_file.is_none()) {
                return Err(ConfigError::Invalid(format!(
                    "transport {} ({:?} port {}): cert_file and key_file go together",
                    i, t.kind, t.port
                )));
            }
            if t.kind.is_secure() && t.cert_file.is_some() && t.tls_domain.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "transport {} ({:?} port {}): a certificate needs a tls_domain",
                    i, t.kind, t.port
                )));
            }
            let clash = self.transports[..i].iter().any(|o| {
                o.kind == t.kind
                    && o.port == t.port
                    && o.port != 0
                    && o.interface == t.interface
                    && o.ip_version == t.ip_version
            });
            if clash {
                return Err(ConfigError::Invalid(format!(
                    "transport {} duplicates {:?} {}:{}",
                    i, t.kind, t.interface, t.port
                )));
            }
        }

        let timers = &self.timers;
        if timers.t1_ms == 0 || timers.t2_ms < timers.t1_ms || timers.timeout_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "timers need t1_ms > 0, t2_ms >= t1_ms and a non-zero timeout_multiplier".to_string(),
            ));
        }

        if let Some(c) = self.congestion.iter().find(|c| c.max_tolerance == 0) {
            return Err(ConfigError::Invalid(format!(
                "congestion tolerance for '{}' must be above zero",
                c.fifo
            )));
        }

        parse_log_level(&self.logging.level)?;
        Ok(())
    }
}
