//! Configuration error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid host address: {0}")]
    InvalidAddress(String),

    #[error("invalid cloud configuration '{cloud}': {reason}")]
    InvalidCloud { cloud: String, reason: String },

    #[error("invalid template '{image}' in cloud '{cloud}': {reason}")]
    InvalidTemplate {
        cloud: String,
        image: String,
        reason: String,
    },

    #[error("duplicate cloud name: {0}")]
    DuplicateCloud(String),

    #[error("duplicate template image '{image}' in cloud '{cloud}'")]
    DuplicateTemplate { cloud: String, image: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
