//! Per-session chain bookkeeping.
//!
//! The registry is updated only as a side effect of a successful `put`. It
//! never iterates across sessions.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use crate::base::CheckpointId;
use crate::error::{CheckpointError, Result};

/// Chain metadata for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChain {
    root: CheckpointId,
    latest: CheckpointId,
    /// Committed ids in ascending order.
    ids: Vec<CheckpointId>,
}

impl SessionChain {
    fn new(root: CheckpointId) -> Self {
        Self {
            root,
            latest: root,
            ids: vec![root],
        }
    }

    /// First committed id.
    pub fn root(&self) -> CheckpointId {
        self.root
    }

    /// Current head.
    pub fn latest(&self) -> CheckpointId {
        self.latest
    }

    /// Number of committed ids. A chain exists only once its root is
    /// committed, so it is never empty.
    pub fn len(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.ids.len()).unwrap_or(NonZeroUsize::MIN)
    }

    /// Whether `id` was committed to this chain.
    pub fn contains(&self, id: &CheckpointId) -> bool {
        self.ids.binary_search(id).is_ok()
    }

    /// Greatest id strictly below `cursor`, or the latest id without a cursor.
    pub fn before(&self, cursor: Option<&CheckpointId>) -> Option<CheckpointId> {
        match cursor {
            None => self.ids.last().copied(),
            Some(cursor) => {
                let idx = self.ids.partition_point(|id| id < cursor);
                idx.checked_sub(1).map(|i| self.ids[i])
            }
        }
    }
}

/// Maps session ids to their chains.
#[derive(Debug, Default, Clone)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionChain>,
}

impl SessionRegistry {
    /// Registry with no sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain of `session_id`, if it has committed anything.
    pub fn chain(&self, session_id: &str) -> Option<&SessionChain> {
        self.sessions.get(session_id)
    }

    /// Head of `session_id`.
    pub fn latest(&self, session_id: &str) -> Option<CheckpointId> {
        self.chain(session_id).map(SessionChain::latest)
    }

    /// Root of `session_id`.
    pub fn root(&self, session_id: &str) -> Option<CheckpointId> {
        self.chain(session_id).map(SessionChain::root)
    }

    /// Whether `id` belongs to `session_id`'s chain.
    pub fn contains(&self, session_id: &str, id: &CheckpointId) -> bool {
        self.chain(session_id).is_some_and(|chain| chain.contains(id))
    }

    /// Fail with a conflict unless the session head equals `expected`.
    pub fn check_head(&self, session_id: &str, expected: Option<CheckpointId>) -> Result<()> {
        let found = self.latest(session_id);
        if found != expected {
            return Err(CheckpointError::conflict(session_id, expected, found));
        }
        Ok(())
    }

    /// Mint the next id for the session.
    pub fn next_id(&self, session_id: &str) -> CheckpointId {
        CheckpointId::next_after(self.latest(session_id).as_ref())
    }

    /// Record a committed id. It must be greater than the current head.
    pub fn advance(&mut self, session_id: &str, id: CheckpointId) -> Result<()> {
        match self.sessions.get_mut(session_id) {
            Some(chain) => {
                if id <= chain.latest {
                    return Err(CheckpointError::conflict(
                        session_id,
                        Some(id),
                        Some(chain.latest),
                    ));
                }
                chain.latest = id;
                chain.ids.push(id);
            }
            None => {
                self.sessions
                    .insert(session_id.to_string(), SessionChain::new(id));
            }
        }
        Ok(())
    }

    /// Drop a session's chain.
    pub fn remove(&mut self, session_id: &str) -> Option<SessionChain> {
        self.sessions.remove(session_id)
    }

    /// Number of sessions with at least one checkpoint.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session has committed anything.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
