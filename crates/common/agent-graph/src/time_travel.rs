//! Time travel: reading past state and forking sessions.
//!
//! None of these take the session's write lock. They only read committed
//! checkpoints, except [`CheckpointedGraph::fork`], which writes to the
//! new session and locks that one.

use agent_graph_checkpoint::{
    CheckpointConfig, CheckpointError, CheckpointMetadata, CheckpointSource, CheckpointTuple,
    ListOptions, ParentRef, PendingCheckpoint, Result, SnapshotSerde,
};
use async_stream::stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, instrument};

use crate::config::RunConfig;
use crate::graph::CheckpointedGraph;
use crate::node::{GraphState, Node};

/// Decoded view of one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot<S> {
    pub values: S,
    /// Config pointing at this checkpoint; pass it back to resume from here.
    pub config: RunConfig,
    pub metadata: CheckpointMetadata,
    /// Config of the parent checkpoint, possibly in another session.
    pub parent_config: Option<RunConfig>,
}

impl<S: GraphState> StateSnapshot<S> {
    pub(crate) fn decode(codec: &SnapshotSerde, tuple: CheckpointTuple) -> Result<Self> {
        Ok(Self {
            values: codec.decode(&tuple.checkpoint.state)?,
            config: RunConfig::from(tuple.config),
            metadata: tuple.checkpoint.metadata,
            parent_config: tuple.parent_config.map(RunConfig::from),
        })
    }

    /// Id of the checkpoint this snapshot was read from.
    pub fn checkpoint_id(&self) -> Option<agent_graph_checkpoint::CheckpointId> {
        self.config.checkpoint_id
    }
}

impl<S, N> CheckpointedGraph<S, N>
where
    S: GraphState,
    N: Node<S>,
{
    /// Latest state of the session, or `None` if it has no checkpoints.
    pub async fn get_state(&self, session_id: &str) -> Result<Option<StateSnapshot<S>>> {
        self.get_state_at(&RunConfig::for_session(session_id)).await
    }

    /// State at `config.checkpoint_id`, or the latest without one.
    ///
    /// An explicit id missing from the session is
    /// [`CheckpointError::NotFound`].
    pub async fn get_state_at(&self, config: &RunConfig) -> Result<Option<StateSnapshot<S>>> {
        let config = config.checkpoint_config()?;
        match self.saver.get_tuple(&config).await? {
            Some(tuple) => StateSnapshot::decode(&self.codec, tuple).map(Some),
            None => Ok(None),
        }
    }

    /// The session's states from newest to oldest.
    ///
    /// Lazy: checkpoints are fetched and decoded as the stream is polled.
    pub fn get_state_history(
        &self,
        session_id: &str,
        options: ListOptions,
    ) -> BoxStream<'static, Result<StateSnapshot<S>>> {
        let saver = self.saver.clone();
        let codec = self.codec;
        let config = CheckpointConfig::new(session_id);

        Box::pin(stream! {
            let mut checkpoints = saver.list(&config, options);
            while let Some(item) = checkpoints.next().await {
                yield item.and_then(|tuple| StateSnapshot::<S>::decode(&codec, tuple));
            }
        })
    }

    /// Start `new_session_id` from the checkpoint `source` resolves to.
    ///
    /// The new root shares the source's encoded state and points back at it
    /// through a cross-session parent. The source session is not modified.
    /// Forking into a session that already has checkpoints is a conflict.
    #[instrument(
        skip(self, source),
        fields(source_session = ?source.session_id, source_checkpoint = ?source.checkpoint_id),
        err
    )]
    pub async fn fork(&self, source: &RunConfig, new_session_id: &str) -> Result<RunConfig> {
        let source_config = source.checkpoint_config()?;
        let target = RunConfig::for_session(new_session_id).checkpoint_config()?;
        let target_session = target.session_id()?;

        let origin = self
            .saver
            .get_tuple(&source_config)
            .await?
            .ok_or_else(|| CheckpointError::EmptySession {
                session_id: source_config.session_id.clone().unwrap_or_default(),
            })?;

        let _guard = self.lock(target_session).await?;

        let mut metadata = CheckpointMetadata::new(CheckpointSource::Fork, origin.metadata().step)
            .with_forked_from(origin.config.clone());
        metadata.tag = self.config.tag_for(source);

        let pending = PendingCheckpoint {
            parent: Some(ParentRef::new(
                origin.checkpoint.session_id.clone(),
                origin.id(),
            )),
            expected_head: None,
            state: origin.checkpoint.state.clone(),
        };
        let writes = self.codec.encode(&Vec::<S::Update>::new())?;

        let id = self
            .saver
            .put(target_session, pending, writes, metadata)
            .await?;
        debug!(%id, new_session = target_session, "forked session");

        Ok(RunConfig::from(CheckpointConfig::at(target_session, id)))
    }
}
