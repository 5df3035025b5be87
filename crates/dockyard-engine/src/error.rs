//! Engine client error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("host {0} requires TLS credentials but none are configured")]
    MissingCredentials(String),

    #[error("cannot connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("no such container: {0}")]
    ContainerNotFound(String),

    #[error("no such image: {0}")]
    ImageNotFound(String),

    #[error("image pull failed for {image}: {reason}")]
    Pull { image: String, reason: String },

    #[error("invalid port binding: {0}")]
    InvalidPortBinding(String),

    #[error("engine rejected request: {0}")]
    Rejected(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
