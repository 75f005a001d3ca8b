//! Domain error types for the processor pipeline.
//!
//! [`PipelineError`] covers conditions detected while *building* domain
//! values: invalid capability declarations, tag validation, and metadata
//! collisions. Failures that happen while a processor runs are not errors at
//! this level; they are recorded as [`crate::Outcome::Error`] results so the
//! caller always receives a structured answer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by domain constructors and merge operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// A processor or pipeline was declared with an invalid configuration.
    ///
    /// Produced by: capability declaration, pipeline construction, wire
    /// parameter validation.
    #[error("Invalid configuration: {message}")]
    ConfigurationError {
        /// Human-readable description of what is wrong.
        message: String,
    },

    /// Two sources wrote the same metadata key.
    ///
    /// Produced by: strict metadata merge. Raised even when both values are
    /// equal.
    #[error("Metadata key '{key}' is already present")]
    MetadataCollision {
        /// The colliding key.
        key: String,
    },

    /// A tag key or value was empty.
    #[error("Invalid tag: {message}")]
    InvalidTag {
        /// Human-readable description of the rejected tag.
        message: String,
    },
}

impl PipelineError {
    /// Convenience constructor for [`PipelineError::ConfigurationError`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }
}
