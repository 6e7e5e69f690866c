pub mod resolve;
pub mod settings;

pub use settings::{GcSettings, ProbeSettings, RetrySettings, RunSettings, Settings};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),
    #[error("invalid root directory: {0}")]
    InvalidRoot(PathBuf),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config at {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
