//! Checkpoint data model and the saver interface.
//!
//! A checkpoint is an immutable snapshot of execution state keyed by
//! `(session_id, checkpoint_id)`. Parents are stored as ids, never as
//! pointers, so a whole history can be written out and read back as rows.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::EncodedValue;
use crate::error::{CheckpointError, Result};

/// Identifier of a checkpoint.
///
/// Backed by a UUIDv7, so ids minted later compare greater. The canonical
/// text form sorts the same way as the id itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    /// Mint a fresh id from the current time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Mint an id strictly greater than `prev`.
    ///
    /// Clock skew or two ids in the same millisecond fall back to the
    /// immediate successor of `prev`.
    pub fn next_after(prev: Option<&CheckpointId>) -> Self {
        let candidate = Self::new();
        match prev {
            Some(prev) if candidate <= *prev => prev.successor(),
            _ => candidate,
        }
    }

    fn successor(&self) -> Self {
        Self(Uuid::from_u128(self.0.as_u128().wrapping_add(1)))
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for CheckpointId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for CheckpointId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Lookup key for a checkpoint.
///
/// Without a checkpoint id the key resolves to the latest checkpoint of the
/// session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Session (timeline) identifier. Required by every saver operation.
    pub session_id: Option<String>,
    /// Specific checkpoint to resolve; `None` means latest.
    pub checkpoint_id: Option<CheckpointId>,
}

impl CheckpointConfig {
    /// Config resolving to the latest checkpoint of `session_id`.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            checkpoint_id: None,
        }
    }

    /// Config resolving to one exact checkpoint.
    pub fn at(session_id: impl Into<String>, checkpoint_id: CheckpointId) -> Self {
        Self {
            session_id: Some(session_id.into()),
            checkpoint_id: Some(checkpoint_id),
        }
    }

    /// Set the checkpoint id.
    pub fn with_checkpoint_id(mut self, checkpoint_id: CheckpointId) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    /// Return the session id, failing when it is absent or blank.
    pub fn session_id(&self) -> Result<&str> {
        match self.session_id.as_deref() {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(CheckpointError::MissingSessionId),
        }
    }

    /// Validate the config without borrowing the session id.
    pub fn validate(&self) -> Result<()> {
        self.session_id().map(|_| ())
    }
}

/// Reference to the parent of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub session_id: String,
    pub checkpoint_id: CheckpointId,
}

impl ParentRef {
    /// Reference `checkpoint_id` in `session_id`.
    pub fn new(session_id: impl Into<String>, checkpoint_id: CheckpointId) -> Self {
        Self {
            session_id: session_id.into(),
            checkpoint_id,
        }
    }

    /// True when the parent lives in a different session (a fork root).
    pub fn is_cross_session(&self, session_id: &str) -> bool {
        self.session_id != session_id
    }

    /// Config addressing the parent checkpoint.
    pub fn to_config(&self) -> CheckpointConfig {
        CheckpointConfig::at(self.session_id.clone(), self.checkpoint_id)
    }
}

/// What produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Written from caller input without running the executor.
    Input,
    /// Written after the executor ran.
    #[default]
    Loop,
    /// Written by a manual state update.
    Update,
    /// Root of a session forked from another checkpoint.
    Fork,
}

/// Per-checkpoint metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    /// Step counter; the root of a fresh session is step `-1`.
    pub step: i64,
    pub created_at: DateTime<Utc>,
    /// Free-form tag supplied by the caller.
    #[serde(default)]
    pub tag: Option<String>,
    /// Source checkpoint when this is a fork root.
    #[serde(default)]
    pub forked_from: Option<CheckpointConfig>,
}

impl CheckpointMetadata {
    /// Metadata stamped with the current time.
    pub fn new(source: CheckpointSource, step: i64) -> Self {
        Self {
            source,
            step,
            created_at: Utc::now(),
            tag: None,
            forked_from: None,
        }
    }

    /// Attach a caller tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Record the checkpoint a fork root was copied from.
    pub fn with_forked_from(mut self, source: CheckpointConfig) -> Self {
        self.forked_from = Some(source);
        self
    }
}

/// A committed, immutable checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub session_id: String,
    pub parent: Option<ParentRef>,
    /// Encoded state snapshot.
    pub state: EncodedValue,
    /// Encoded write-set that turned the parent's state into `state`.
    pub writes: EncodedValue,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// True when this is the first checkpoint of its session.
    pub fn is_root(&self) -> bool {
        self.parent
            .as_ref()
            .is_none_or(|parent| parent.is_cross_session(&self.session_id))
    }

    /// Config addressing this checkpoint.
    pub fn config(&self) -> CheckpointConfig {
        CheckpointConfig::at(self.session_id.clone(), self.id)
    }
}

/// A checkpoint that has not been committed yet.
#[derive(Debug, Clone)]
pub struct PendingCheckpoint {
    /// Parent of the new checkpoint, `None` for a fresh root.
    pub parent: Option<ParentRef>,
    /// Latest id the writer observed for the session; `None` when the writer
    /// saw an empty session. A mismatch at commit time is a conflict.
    pub expected_head: Option<CheckpointId>,
    pub state: EncodedValue,
}

impl PendingCheckpoint {
    /// Check that `parent` fits where the checkpoint lands in `session_id`.
    ///
    /// A continuation (`expected_head` set) needs a parent in the same
    /// session. A root may have no parent or a parent in another session,
    /// never one in its own.
    pub fn validate_parent(&self, session_id: &str) -> Result<()> {
        match (&self.parent, self.expected_head) {
            (None, Some(_)) => Err(CheckpointError::invalid_parent(
                session_id,
                "a continuation must name its parent",
            )),
            (Some(parent), Some(_)) if parent.is_cross_session(session_id) => {
                Err(CheckpointError::invalid_parent(
                    session_id,
                    "a continuation's parent must be in the same session",
                ))
            }
            (Some(parent), None) if !parent.is_cross_session(session_id) => {
                Err(CheckpointError::invalid_parent(
                    session_id,
                    "a root cannot have a parent in its own session",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// A read result: a checkpoint plus the configs that address it and its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub parent_config: Option<CheckpointConfig>,
}

impl CheckpointTuple {
    /// Build the tuple, deriving both configs from the checkpoint.
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            config: checkpoint.config(),
            parent_config: checkpoint.parent.as_ref().map(ParentRef::to_config),
            checkpoint,
        }
    }

    /// Id of the checkpoint.
    pub fn id(&self) -> CheckpointId {
        self.checkpoint.id
    }

    /// Metadata of the checkpoint.
    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.checkpoint.metadata
    }
}

/// Options for [`BaseCheckpointSaver::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Only yield checkpoints with an id strictly lower than this one.
    pub before: Option<CheckpointId>,
    /// Maximum number of tuples to yield.
    pub limit: Option<usize>,
}

impl ListOptions {
    /// No cursor and no limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume below `before`.
    pub fn with_before(mut self, before: CheckpointId) -> Self {
        self.before = Some(before);
        self
    }

    /// Stop after `limit` tuples.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Lazy stream of tuples in strictly decreasing id order.
pub type CheckpointStream<'a> = BoxStream<'a, Result<CheckpointTuple>>;

/// Interface every checkpoint backend implements.
///
/// `put` is the only mutating operation used during normal execution.
/// Reads only ever observe committed checkpoints.
#[async_trait]
pub trait BaseCheckpointSaver: Send + Sync {
    /// Commit a checkpoint atomically and return its id.
    ///
    /// Fails with [`CheckpointError::InvalidParent`] when the parent does not
    /// fit the checkpoint's position (see
    /// [`PendingCheckpoint::validate_parent`]), with
    /// [`CheckpointError::Conflict`] when the session head is no longer
    /// `checkpoint.expected_head`, and with [`CheckpointError::NotFound`]
    /// when the parent does not exist.
    async fn put(
        &self,
        session_id: &str,
        checkpoint: PendingCheckpoint,
        writes: EncodedValue,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointId>;

    /// Resolve a config to a tuple.
    ///
    /// Returns `Ok(None)` for an empty session when no checkpoint id was
    /// given. An explicit checkpoint id that is absent from the session is
    /// [`CheckpointError::NotFound`]; there is no fallback to latest.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Same as [`BaseCheckpointSaver::get_tuple`] without the parent linkage.
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|tuple| tuple.checkpoint))
    }

    /// Stream the session's checkpoints from newest to oldest.
    ///
    /// An empty session yields an empty stream. A missing session id yields
    /// a single error item.
    fn list<'a>(&'a self, config: &'a CheckpointConfig, options: ListOptions)
    -> CheckpointStream<'a>;

    /// Remove a whole session. Administrative only; execution never calls it.
    async fn delete_session(&self, session_id: &str) -> Result<()>;
}
