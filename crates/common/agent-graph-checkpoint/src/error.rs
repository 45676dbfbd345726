//! Error types shared by every checkpoint saver.

use thiserror::Error;

use crate::base::CheckpointId;

/// Result type alias for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Boxed error type carried by storage failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by checkpoint savers and the codec.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A checkpointer is configured but the caller supplied no session id.
    #[error("session_id is required when a checkpointer is configured")]
    MissingSessionId,

    /// The requested checkpoint does not exist in that session's chain.
    #[error("checkpoint {checkpoint_id} not found in session '{session_id}'")]
    NotFound {
        session_id: String,
        checkpoint_id: CheckpointId,
    },

    /// Another writer advanced the session past the head this writer observed.
    #[error(
        "session '{session_id}' was advanced concurrently: expected head {}, found {}",
        display_head(.expected),
        display_head(.found)
    )]
    Conflict {
        session_id: String,
        expected: Option<CheckpointId>,
        found: Option<CheckpointId>,
    },

    /// Another invocation holds the session and the caller asked not to wait.
    #[error("session '{session_id}' has an invocation in flight")]
    SessionBusy { session_id: String },

    /// The pending checkpoint's parent does not fit its position in the chain.
    #[error("invalid parent for checkpoint in session '{session_id}': {reason}")]
    InvalidParent {
        session_id: String,
        reason: &'static str,
    },

    /// The session has no checkpoint to resolve.
    #[error("session '{session_id}' has no checkpoints")]
    EmptySession { session_id: String },

    /// The storage backend failed.
    #[error("storage error in session '{}': {message}", .session_id.as_deref().unwrap_or("-"))]
    Storage {
        session_id: Option<String>,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn display_head(head: &Option<CheckpointId>) -> String {
    match head {
        Some(id) => id.to_string(),
        None => "<empty>".to_string(),
    }
}

impl CheckpointError {
    /// Create a not found error.
    pub fn not_found(session_id: impl Into<String>, checkpoint_id: CheckpointId) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
            checkpoint_id,
        }
    }

    /// Create a conflict error.
    pub fn conflict(
        session_id: impl Into<String>,
        expected: Option<CheckpointId>,
        found: Option<CheckpointId>,
    ) -> Self {
        Self::Conflict {
            session_id: session_id.into(),
            expected,
            found,
        }
    }

    /// Create an invalid parent error.
    pub fn invalid_parent(session_id: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidParent {
            session_id: session_id.into(),
            reason,
        }
    }

    /// Create a storage error wrapping a backend failure.
    pub fn storage<E>(session_id: Option<&str>, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            session_id: session_id.map(str::to_owned),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error without an underlying source.
    pub fn storage_msg(session_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::Storage {
            session_id: session_id.map(str::to_owned),
            message: message.into(),
            source: None,
        }
    }

    /// Whether another writer got to the session first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::SessionBusy { .. })
    }

    /// Whether retrying the whole invocation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_conflict() || matches!(self, Self::Storage { .. })
    }
}

impl From<rmp_serde::encode::Error> for CheckpointError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CheckpointError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
