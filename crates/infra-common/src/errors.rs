use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading configuration or installing logging
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid log level: {0}")]
    LogLevel(String),

    #[error("failed to install logging: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
