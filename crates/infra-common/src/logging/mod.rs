//! Logging setup built on `tracing-subscriber`

mod setup;

pub use setup::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
