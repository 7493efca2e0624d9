//! Shared infrastructure for the voxstack crates: logging setup and the
//! TOML stack configuration.

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    CongestionConfig, IpFamily, LogSettings, Metric, StackConfig, TimerConfig, TransportConfig,
    TransportKind,
};
pub use errors::{ConfigError, Result};
pub use logging::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
