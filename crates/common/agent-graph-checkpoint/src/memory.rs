//! In-memory checkpoint saver.
//!
//! This module provides a volatile implementation of
//! [`BaseCheckpointSaver`] that keeps every session's chain in a process
//! local arena keyed by `(session_id, checkpoint_id)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::base::{
    BaseCheckpointSaver, Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata,
    CheckpointStream, CheckpointTuple, ListOptions, PendingCheckpoint,
};
use crate::codec::EncodedValue;
use crate::error::{CheckpointError, Result};
use crate::registry::SessionRegistry;

/// In-memory checkpoint saver.
///
/// Each session has its own chain of checkpoints. Data is lost when the
/// process exits.
///
/// Note: Only use `InMemorySaver` for debugging or testing purposes.
/// For anything that must survive a restart use the SQLite saver.
///
/// # Example
///
/// ```ignore
/// use agent_graph_checkpoint::{BaseCheckpointSaver, CheckpointConfig, InMemorySaver};
///
/// let saver = InMemorySaver::new();
/// let id = saver.put("session-1", pending, writes, metadata).await?;
/// let latest = saver.get(&CheckpointConfig::new("session-1")).await?;
/// ```
#[derive(Clone, Default)]
pub struct InMemorySaver {
    inner: Arc<RwLock<Arena>>,
}

#[derive(Default)]
struct Arena {
    registry: SessionRegistry,
    checkpoints: HashMap<(String, CheckpointId), Checkpoint>,
}

impl Arena {
    fn lookup(&self, session_id: &str, id: CheckpointId) -> Option<&Checkpoint> {
        self.checkpoints.get(&(session_id.to_string(), id))
    }

    fn next_before(
        &self,
        session_id: &str,
        cursor: Option<&CheckpointId>,
    ) -> Option<CheckpointTuple> {
        let id = self.registry.chain(session_id)?.before(cursor)?;
        self.lookup(session_id, id).cloned().map(CheckpointTuple::new)
    }
}

impl InMemorySaver {
    /// Create a new in-memory checkpoint saver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions holding at least one checkpoint.
    pub fn session_count(&self) -> usize {
        self.inner.read().registry.len()
    }
}

#[async_trait]
impl BaseCheckpointSaver for InMemorySaver {
    #[instrument(skip(self, checkpoint, writes, metadata), err)]
    async fn put(
        &self,
        session_id: &str,
        checkpoint: PendingCheckpoint,
        writes: EncodedValue,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointId> {
        CheckpointConfig::new(session_id).validate()?;
        checkpoint.validate_parent(session_id)?;

        let mut arena = self.inner.write();
        arena
            .registry
            .check_head(session_id, checkpoint.expected_head)?;

        if let Some(parent) = &checkpoint.parent {
            if arena
                .lookup(&parent.session_id, parent.checkpoint_id)
                .is_none()
            {
                return Err(CheckpointError::not_found(
                    parent.session_id.clone(),
                    parent.checkpoint_id,
                ));
            }
        }

        let id = arena.registry.next_id(session_id);
        arena.registry.advance(session_id, id)?;
        arena.checkpoints.insert(
            (session_id.to_string(), id),
            Checkpoint {
                id,
                session_id: session_id.to_string(),
                parent: checkpoint.parent,
                state: checkpoint.state,
                writes,
                metadata,
            },
        );

        debug!(%id, "committed checkpoint");
        Ok(id)
    }

    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let session_id = config.session_id()?;
        let arena = self.inner.read();

        match config.checkpoint_id {
            Some(id) => arena
                .lookup(session_id, id)
                .cloned()
                .map(|checkpoint| Some(CheckpointTuple::new(checkpoint)))
                .ok_or_else(|| CheckpointError::not_found(session_id, id)),
            None => Ok(arena.next_before(session_id, None)),
        }
    }

    fn list<'a>(
        &'a self,
        config: &'a CheckpointConfig,
        options: ListOptions,
    ) -> CheckpointStream<'a> {
        let session_id = match config.session_id() {
            Ok(id) => id.to_string(),
            Err(err) => return stream::once(async move { Err(err) }).boxed(),
        };
        let limit = options.limit.unwrap_or(usize::MAX);
        let inner = Arc::clone(&self.inner);

        stream::unfold(
            (options.before, 0usize),
            move |(cursor, yielded)| {
                let next = if yielded < limit {
                    inner.read().next_before(&session_id, cursor.as_ref())
                } else {
                    None
                };
                async move {
                    next.map(|tuple| {
                        let id = tuple.id();
                        (Ok(tuple), (Some(id), yielded + 1))
                    })
                }
            },
        )
        .boxed()
    }

    #[instrument(skip(self), err)]
    async fn delete_session(&self, session_id: &str) -> Result<()> {
        CheckpointConfig::new(session_id).validate()?;
        let mut arena = self.inner.write();
        if arena.registry.remove(session_id).is_some() {
            arena.checkpoints.retain(|(owner, _), _| owner != session_id);
            debug!("deleted session");
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemorySaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.inner.read();
        f.debug_struct("InMemorySaver")
            .field("sessions", &arena.registry.len())
            .field("checkpoints", &arena.checkpoints.len())
            .finish()
    }
}
