//! Execution coordinator.
//!
//! Every invocation on a session runs the same machine:
//!
//! ```text
//! Idle -> Loading -> Running -> Committing -> Idle
//! ```
//!
//! `Loading` resolves the run config to a checkpoint, `Running` hands the
//! decoded state to the node and `Committing` issues exactly one `put`. A
//! failed or cancelled `Running` skips `Committing`, so the session head is
//! untouched.

use std::marker::PhantomData;
use std::sync::Arc;

use agent_graph_checkpoint::{
    BaseCheckpointSaver, CheckpointConfig, CheckpointError, CheckpointMetadata, CheckpointSource,
    CheckpointTuple, ParentRef, PendingCheckpoint, SnapshotSerde,
};
use tracing::{debug, instrument};

use crate::config::{CoordinatorConfig, RunConfig};
use crate::error::GraphError;
use crate::lock::{SessionGuard, SessionLocks};
use crate::node::{GraphState, Node};
use crate::time_travel::StateSnapshot;

/// A node wired to a checkpoint saver.
///
/// Sessions run in parallel; within one session at most one invocation is
/// in flight (see [`crate::ConcurrencyPolicy`]). Writers in other processes
/// sharing a durable saver are caught by the saver's expected-head check.
///
/// # Example
///
/// ```ignore
/// let graph = CheckpointedGraph::new(increment, Arc::new(InMemorySaver::new()));
/// let config = RunConfig::for_session("s1");
///
/// graph.update_state(&config, 0).await?;
/// let snapshot = graph.invoke(&config, None).await?;
/// assert_eq!(snapshot.values.count, 1);
/// ```
pub struct CheckpointedGraph<S, N> {
    pub(crate) node: N,
    pub(crate) saver: Arc<dyn BaseCheckpointSaver>,
    pub(crate) codec: SnapshotSerde,
    pub(crate) config: CoordinatorConfig,
    pub(crate) locks: SessionLocks,
    _state: PhantomData<fn() -> S>,
}

/// What `Loading` resolved.
struct Loaded<S> {
    /// Latest checkpoint when loading began; the expected head for `put`.
    head: Option<CheckpointTuple>,
    /// Checkpoint the invocation continues from.
    base: Option<CheckpointTuple>,
    state: S,
}

impl<S> Loaded<S> {
    fn step(&self) -> Option<i64> {
        self.base.as_ref().map(|tuple| tuple.metadata().step)
    }
}

impl<S, N> CheckpointedGraph<S, N>
where
    S: GraphState,
    N: Node<S>,
{
    pub fn new(node: N, saver: Arc<dyn BaseCheckpointSaver>) -> Self {
        Self {
            node,
            saver,
            codec: SnapshotSerde::default(),
            config: CoordinatorConfig::default(),
            locks: SessionLocks::default(),
            _state: PhantomData,
        }
    }

    /// Replace the coordinator settings.
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Encode new snapshots with `codec`. Existing ones decode by their tag.
    pub fn with_codec(mut self, codec: SnapshotSerde) -> Self {
        self.codec = codec;
        self
    }

    /// The saver checkpoints are committed to.
    pub fn saver(&self) -> &Arc<dyn BaseCheckpointSaver> {
        &self.saver
    }

    /// The node run on every invocation.
    pub fn node(&self) -> &N {
        &self.node
    }

    /// Run the node once on the session and commit the result.
    ///
    /// `input` is applied to the loaded state before the node runs. With
    /// `config.checkpoint_id` set the run continues from that checkpoint; the
    /// new checkpoint is still appended after the session's latest one.
    ///
    /// On an empty session the committed checkpoint becomes the root, so `n`
    /// invocations on a fresh session leave `n` checkpoints. Seed the session
    /// with [`CheckpointedGraph::update_state`] first to get a separate input
    /// root, giving `n + 1`.
    #[instrument(
        skip(self, config, input),
        fields(session_id = ?config.session_id, checkpoint_id = ?config.checkpoint_id),
        err
    )]
    pub async fn invoke(
        &self,
        config: &RunConfig,
        input: Option<S::Update>,
    ) -> Result<StateSnapshot<S>, GraphError<N::Error>> {
        let checkpoint_config = config.checkpoint_config()?;
        let session_id = checkpoint_config.session_id()?;
        let _guard = self.lock(session_id).await?;

        debug!("loading");
        let mut loaded = self.load(&checkpoint_config).await?;

        let mut writes = Vec::with_capacity(2);
        if let Some(input) = input {
            loaded.state.apply(input.clone());
            writes.push(input);
        }

        debug!("running");
        let update = self
            .node
            .run(&loaded.state)
            .await
            .map_err(|source| GraphError::Node {
                session_id: session_id.to_string(),
                checkpoint_id: loaded.base.as_ref().map(CheckpointTuple::id),
                source,
            })?;
        loaded.state.apply(update.clone());
        writes.push(update);

        debug!("committing");
        let (source, step) = match loaded.step() {
            Some(step) => (CheckpointSource::Loop, step + 1),
            None => (CheckpointSource::Input, 0),
        };
        let snapshot = self
            .commit(session_id, config, loaded, &writes, source, step)
            .await?;
        Ok(snapshot)
    }

    /// Commit `update` without running the node.
    ///
    /// Applies on top of `config.checkpoint_id` (or the latest). On an empty
    /// session this creates the root checkpoint.
    #[instrument(
        skip(self, config, update),
        fields(session_id = ?config.session_id, checkpoint_id = ?config.checkpoint_id),
        err
    )]
    pub async fn update_state(
        &self,
        config: &RunConfig,
        update: S::Update,
    ) -> Result<StateSnapshot<S>, CheckpointError> {
        let checkpoint_config = config.checkpoint_config()?;
        let session_id = checkpoint_config.session_id()?;
        let _guard = self.lock(session_id).await?;

        let mut loaded = self.load(&checkpoint_config).await?;
        loaded.state.apply(update.clone());
        let step = loaded.step().map_or(-1, |step| step + 1);

        self.commit(
            session_id,
            config,
            loaded,
            &[update],
            CheckpointSource::Update,
            step,
        )
        .await
    }

    pub(crate) async fn lock(&self, session_id: &str) -> Result<SessionGuard, CheckpointError> {
        self.locks
            .acquire(session_id, self.config.concurrency)
            .await
    }

    async fn load(&self, config: &CheckpointConfig) -> Result<Loaded<S>, CheckpointError> {
        let session_id = config.session_id()?;
        let head = self
            .saver
            .get_tuple(&CheckpointConfig::new(session_id))
            .await?;

        let base = match config.checkpoint_id {
            None => head.clone(),
            Some(id) if head.as_ref().is_some_and(|tuple| tuple.id() == id) => head.clone(),
            Some(_) => self.saver.get_tuple(config).await?,
        };

        let state = match &base {
            Some(tuple) => self.codec.decode(&tuple.checkpoint.state)?,
            None => S::default(),
        };

        Ok(Loaded { head, base, state })
    }

    async fn commit(
        &self,
        session_id: &str,
        config: &RunConfig,
        loaded: Loaded<S>,
        writes: &[S::Update],
        source: CheckpointSource,
        step: i64,
    ) -> Result<StateSnapshot<S>, CheckpointError> {
        let mut metadata = CheckpointMetadata::new(source, step);
        metadata.tag = self.config.tag_for(config);

        let parent = loaded
            .base
            .as_ref()
            .map(|tuple| ParentRef::new(session_id, tuple.id()));
        let pending = PendingCheckpoint {
            parent: parent.clone(),
            expected_head: loaded.head.as_ref().map(CheckpointTuple::id),
            state: self.codec.encode(&loaded.state)?,
        };
        let writes = self.codec.encode(writes)?;

        let id = self
            .saver
            .put(session_id, pending, writes, metadata.clone())
            .await?;
        debug!(%id, ?source, step, "committed");

        Ok(StateSnapshot {
            values: loaded.state,
            config: RunConfig::from(CheckpointConfig::at(session_id, id)),
            metadata,
            parent_config: parent.map(|parent| RunConfig::from(parent.to_config())),
        })
    }
}

impl<S, N> std::fmt::Debug for CheckpointedGraph<S, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointedGraph")
            .field("codec", &self.codec)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
