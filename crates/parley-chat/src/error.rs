//! Error types for the conversational core.

use serde::Serialize;

use parley_core::error::ParleyError;

/// Turn-level errors surfaced to callers of the chat core.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("conversation not found: {id}")]
    NotFound { id: String },
    #[error("{0} is unavailable")]
    ActorUnavailable(&'static str),
}

impl ChatError {
    /// Stable machine-readable code for logs and outer layers.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation_error",
            ChatError::Generation(_) => "generation_error",
            ChatError::Persistence(_) => "persistence_error",
            ChatError::NotFound { .. } => "not_found",
            ChatError::ActorUnavailable(_) => "internal_error",
        }
    }

    /// Message safe to show an end user. Never includes internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "Please provide a message, an image, or a file.",
            ChatError::Generation(_) => {
                "Sorry, I couldn't generate a response right now. Please try again."
            }
            ChatError::Persistence(_) => {
                "Sorry, your conversation couldn't be saved. Please try again."
            }
            ChatError::NotFound { .. } => "That conversation no longer exists.",
            ChatError::ActorUnavailable(_) => "Sorry, something went wrong. Please try again.",
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Persistence(_) | ChatError::ActorUnavailable(_)
        )
    }

    /// Outward-facing summary of this error.
    pub fn report(&self) -> FailureReport {
        FailureReport {
            code: self.code(),
            message: self.user_message(),
        }
    }
}

impl From<ParleyError> for ChatError {
    fn from(err: ParleyError) -> Self {
        ChatError::Persistence(err.to_string())
    }
}

/// What the outer layer shows when a turn fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub code: &'static str,
    pub message: &'static str,
}

/// Failure of a single enrichment sub-task.
///
/// Absorbed by the enrichment coordinator; never crosses its boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrichmentFailure {
    #[error("could not decode attachment: {0}")]
    Decode(String),
    #[error("vision call failed: {0}")]
    Vision(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("timed out after {0}s")]
    TimedOut(u64),
}
