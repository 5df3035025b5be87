//! Provisioning error types.

use thiserror::Error;

use dockyard_engine::EngineError;

/// A step of the container lifecycle failed.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("pulling {image} failed: {source}")]
    Pull {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("container creation failed: {0}")]
    Create(#[source] EngineError),

    #[error("container {id} failed to start: {source}")]
    Start {
        id: String,
        #[source]
        source: EngineError,
    },

    #[error("inspecting container {id} failed: {source}")]
    Inspect {
        id: String,
        #[source]
        source: EngineError,
    },

    #[error("agent in container {id} did not come up")]
    NotReady { id: String },

    #[error("launcher error: {0}")]
    Launcher(String),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors surfaced by the provisioning coordinator and its planned units.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("cloud {cloud} has no template matching label {label:?}")]
    NoTemplate { cloud: String, label: Option<String> },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("provisioning was cancelled")]
    Cancelled,

    #[error("provisioning task panicked: {0}")]
    Panicked(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

impl ProvisionError {
    /// Whether this is a configuration problem the caller must fix.
    pub fn is_config_error(&self) -> bool {
        matches!(self, ProvisionError::NoTemplate { .. })
    }
}
