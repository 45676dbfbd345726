//! Single-writer discipline per session.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use agent_graph_checkpoint::{CheckpointError, Result};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

use crate::config::ConcurrencyPolicy;

/// Dead entries are swept once the map grows past this many sessions.
const SWEEP_THRESHOLD: usize = 128;

/// Held for the whole `Loading -> Running -> Committing` sequence.
pub(crate) type SessionGuard = OwnedMutexGuard<()>;

/// One async mutex per session id, created on demand.
///
/// The map only keeps weak references; a session's mutex lives as long as
/// someone holds or waits on it.
#[derive(Debug, Default)]
pub(crate) struct SessionLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl SessionLocks {
    fn handle(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > SWEEP_THRESHOLD {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }
        if let Some(existing) = locks.get(session_id).and_then(Weak::upgrade) {
            return existing;
        }
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(session_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    pub(crate) async fn acquire(
        &self,
        session_id: &str,
        policy: ConcurrencyPolicy,
    ) -> Result<SessionGuard> {
        let lock = self.handle(session_id);
        match policy {
            ConcurrencyPolicy::Wait => Ok(lock.lock_owned().await),
            ConcurrencyPolicy::Reject => lock.try_lock_owned().map_err(|_| {
                warn!(session_id, "rejected invocation on busy session");
                CheckpointError::SessionBusy {
                    session_id: session_id.to_string(),
                }
            }),
        }
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
