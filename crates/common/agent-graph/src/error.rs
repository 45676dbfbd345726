use agent_graph_checkpoint::{CheckpointError, CheckpointId};
use thiserror::Error;

/// Error returned by [`crate::CheckpointedGraph::invoke`].
///
/// `E` is the node's own error type; it is passed through untouched.
#[derive(Debug, Error)]
pub enum GraphError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The node failed. Nothing was committed.
    #[error("node failed in session '{session_id}' (from checkpoint {})", display_base(.checkpoint_id))]
    Node {
        session_id: String,
        checkpoint_id: Option<CheckpointId>,
        #[source]
        source: E,
    },
}

fn display_base(id: &Option<CheckpointId>) -> String {
    id.map_or_else(|| "<none>".to_string(), |id| id.to_string())
}

impl<E> GraphError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The saver error, if this is not a node failure.
    pub fn as_checkpoint(&self) -> Option<&CheckpointError> {
        match self {
            Self::Checkpoint(err) => Some(err),
            Self::Node { .. } => None,
        }
    }

    /// Whether the checkpoint layer reported a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        self.as_checkpoint().is_some_and(CheckpointError::is_conflict)
    }
}
