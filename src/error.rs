//! Error taxonomy surfaced by the engine's public operations.

use chrono::{DateTime, Local};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad user input: empty or oversized activity, tag limits, negative elapsed time.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no session is being tracked")]
    NotTracking,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("wake time {at} is not in the future")]
    PastTime { at: DateTime<Local> },

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("playback error: {0:#}")]
    Playback(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            name: name.into(),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
