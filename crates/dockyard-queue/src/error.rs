//! Queue substitution errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// A container task whose label no configured cloud can serve.
    #[error("no cloud has a template for label {label:?}")]
    NoMatchingCloud { label: Option<String> },
}

pub type QueueResult<T> = Result<T, QueueError>;
