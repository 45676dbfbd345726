//! Base interfaces for agent-graph checkpoint savers.
//!
//! A checkpointer gives an execution graph durable, resumable and
//! inspectable state. Every session (an independent timeline) owns a chain
//! of immutable checkpoints keyed by `(session_id, checkpoint_id)`; each
//! checkpoint stores an encoded state snapshot, the write-set that produced
//! it, and a link to its parent.
//!
//! # Overview
//!
//! - [`SnapshotSerde`] encodes state and write-sets to tagged bytes.
//! - [`BaseCheckpointSaver`] is the backend contract: `put`, `get`,
//!   `get_tuple` and a lazy, newest-first `list`.
//! - [`SessionRegistry`] tracks the root and head of each chain.
//! - [`InMemorySaver`] is the volatile backend. The durable one lives in
//!   `agent-graph-checkpoint-sqlite`.
//!
//! # Example
//!
//! ```ignore
//! use agent_graph_checkpoint::{
//!     BaseCheckpointSaver, CheckpointConfig, CheckpointMetadata, CheckpointSource,
//!     InMemorySaver, PendingCheckpoint, SnapshotSerde,
//! };
//!
//! let saver = InMemorySaver::new();
//! let codec = SnapshotSerde::default();
//!
//! let root = saver
//!     .put(
//!         "session-1",
//!         PendingCheckpoint {
//!             parent: None,
//!             expected_head: None,
//!             state: codec.encode(&serde_json::json!({"count": 0}))?,
//!         },
//!         codec.encode(&Vec::<()>::new())?,
//!         CheckpointMetadata::new(CheckpointSource::Input, -1),
//!     )
//!     .await?;
//!
//! let latest = saver.get(&CheckpointConfig::new("session-1")).await?;
//! assert_eq!(latest.map(|c| c.id), Some(root));
//! ```

pub mod base;
pub mod codec;
pub mod error;
pub mod memory;
pub mod registry;

pub use base::{
    BaseCheckpointSaver, Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata,
    CheckpointSource, CheckpointStream, CheckpointTuple, ListOptions, ParentRef,
    PendingCheckpoint,
};
pub use codec::{EncodedValue, SerdeFormat, SnapshotSerde};
pub use error::{BoxError, CheckpointError, Result};
pub use memory::InMemorySaver;
pub use registry::{SessionChain, SessionRegistry};
