//! Error types for recall-core
//!
//! Two layers:
//! - [`StoreError`](crate::store::StoreError) at the storage boundary, with
//!   distinguishable `NotFound` / `VersionConflict` / `Unavailable` outcomes
//! - [`Error`] for everything above the store (manager, turn loop)
//!
//! Version conflicts never reach this layer as such: the session manager
//! absorbs them and surfaces [`Error::Retryable`] once its budget is spent.

use crate::store::{StoreError, Version};
use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Commit gave up after repeated version conflicts
    #[error("commit for session '{session_id}' still conflicting after {attempts} attempts")]
    Retryable {
        /// Session whose commit was abandoned
        session_id: String,
        /// Number of `put` attempts made
        attempts: u32,
        /// Version last observed in the store
        last_seen_version: Version,
    },

    /// The surrounding request was cancelled before the commit finished
    #[error("commit for session '{session_id}' was cancelled")]
    Cancelled {
        /// Session whose commit was aborted
        session_id: String,
    },

    /// Malformed or unknown tool call
    #[error("tool error: {0}")]
    Tool(String),

    /// Responder (model boundary) failure
    #[error("responder error: {0}")]
    Responder(String),

    /// Configuration error (invalid settings, production safety violations)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller may retry the whole turn later.
    ///
    /// `StoreUnavailable` and an exhausted commit budget are transient;
    /// everything else is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(e) => e.is_unavailable(),
            Error::Retryable { .. } => true,
            _ => false,
        }
    }
}

/// Trait for user-friendly error messages
///
/// The turn loop renders transient failures to the end user through this
/// trait instead of leaking backend details.
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get a suggestion for how to fix the error
    fn suggestion(&self) -> Option<String>;
}

impl UserFriendlyError for Error {
    fn user_message(&self) -> String {
        match self {
            Error::Store(StoreError::Unavailable(_)) => {
                "I couldn't reach my memory just now, so nothing was saved.".to_string()
            }
            Error::Store(e) => format!("Storage error: {}", e),
            Error::Retryable { .. } => {
                "Someone else updated this conversation at the same time and I couldn't save your change."
                    .to_string()
            }
            Error::Cancelled { .. } => "The request was cancelled before it was saved.".to_string(),
            Error::Tool(msg) => format!("I couldn't use a tool: {}", msg),
            Error::Responder(msg) => format!("I couldn't produce a reply: {}", msg),
            Error::Configuration(msg) => format!("Configuration error: {}", msg),
            Error::Internal(msg) => format!("Internal error: {}", msg),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Error::Store(StoreError::Unavailable(_)) | Error::Retryable { .. } => {
                Some("Please try again in a moment.".to_string())
            }
            Error::Configuration(_) => {
                Some("Check config/default.toml or the RECALL_* environment variables.".to_string())
            }
            _ => None,
        }
    }
}

/// Format an error for display in the CLI
pub fn format_error_for_cli(error: &Error) -> String {
    let mut output = error.user_message();
    if let Some(suggestion) = error.suggestion() {
        output.push_str("\n\n");
        output.push_str(&suggestion);
    }
    output.push('\n');
    output
}

/// Format an error for display as the agent's reply
pub fn format_error_for_chat(error: &Error) -> String {
    let mut output = error.user_message();

    if let Some(suggestion) = error.suggestion() {
        output.push(' ');
        output.push_str(&suggestion);
    }

    output
}
