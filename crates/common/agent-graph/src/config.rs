//! Run and coordinator configuration.

use agent_graph_checkpoint::{CheckpointConfig, CheckpointId, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a single call into a [`crate::CheckpointedGraph`].
///
/// Passed explicitly on every call; there is no process-wide default
/// session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConfig {
    /// Session (thread) the call reads from and appends to.
    pub session_id: Option<String>,
    /// Resume from this checkpoint instead of the latest.
    pub checkpoint_id: Option<CheckpointId>,
    /// Free-form tag recorded on the checkpoint this call commits.
    pub tag: Option<String>,
}

impl RunConfig {
    /// Create a new run configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration targeting the latest checkpoint of `session_id`.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self::new().with_session_id(session_id)
    }

    /// Set the session ID.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the checkpoint to resume from.
    pub fn with_checkpoint_id(mut self, checkpoint_id: CheckpointId) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    /// Set the tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Validated lookup key for the saver.
    ///
    /// Fails with [`agent_graph_checkpoint::CheckpointError::MissingSessionId`]
    /// when the session id is absent or blank.
    pub fn checkpoint_config(&self) -> Result<CheckpointConfig> {
        let config = CheckpointConfig {
            session_id: self.session_id.clone(),
            checkpoint_id: self.checkpoint_id,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<CheckpointConfig> for RunConfig {
    fn from(config: CheckpointConfig) -> Self {
        Self {
            session_id: config.session_id,
            checkpoint_id: config.checkpoint_id,
            tag: None,
        }
    }
}

/// What a second invocation on a busy session does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Queue behind the running invocation.
    #[default]
    Wait,
    /// Fail immediately with a conflict.
    Reject,
}

/// Settings for [`crate::CheckpointedGraph`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub concurrency: ConcurrencyPolicy,
    /// Tag for checkpoints whose [`RunConfig`] carries none.
    pub default_tag: Option<String>,
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyPolicy) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_default_tag(mut self, tag: impl Into<String>) -> Self {
        self.default_tag = Some(tag.into());
        self
    }

    pub(crate) fn tag_for(&self, config: &RunConfig) -> Option<String> {
        config.tag.clone().or_else(|| self.default_tag.clone())
    }
}
