//! Top-level error type for configuration and process setup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimeLoopError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid config value for `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TimeLoopError>;
