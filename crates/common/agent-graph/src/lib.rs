//! Agent Graph - checkpointed execution with time travel.
//!
//! A [`CheckpointedGraph`] wires a [`Node`] to any
//! [`agent_graph_checkpoint::BaseCheckpointSaver`]. Each invocation loads a
//! session's state, runs the node and commits exactly one new checkpoint,
//! so a session can be resumed after a restart, inspected, rewound or
//! forked.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use agent_graph::{CheckpointedGraph, GraphState, RunConfig, node_fn};
//! use agent_graph_checkpoint::InMemorySaver;
//! use futures::TryStreamExt;
//!
//! #[derive(Clone, Default, Serialize, Deserialize)]
//! struct Counter {
//!     count: i64,
//! }
//!
//! impl GraphState for Counter {
//!     type Update = i64;
//!
//!     fn apply(&mut self, delta: i64) {
//!         self.count += delta;
//!     }
//! }
//!
//! let increment = node_fn(|_: Counter| async { Ok::<_, std::io::Error>(1) });
//! let graph = CheckpointedGraph::new(increment, Arc::new(InMemorySaver::new()));
//! let config = RunConfig::for_session("s1");
//!
//! graph.update_state(&config, 0).await?;
//! graph.invoke(&config, None).await?;
//! graph.invoke(&config, None).await?;
//!
//! let latest = graph.get_state("s1").await?.unwrap();
//! assert_eq!(latest.values.count, 2);
//!
//! // Branch off the first invocation without touching "s1".
//! let history: Vec<_> = graph
//!     .get_state_history("s1", Default::default())
//!     .try_collect()
//!     .await?;
//! let forked = graph.fork(&history[1].config, "s1-retry").await?;
//! graph.invoke(&forked, None).await?;
//! ```

pub mod config;
pub mod error;
pub mod graph;
mod lock;
pub mod node;
pub mod time_travel;

pub use config::{ConcurrencyPolicy, CoordinatorConfig, RunConfig};
pub use error::GraphError;
pub use graph::CheckpointedGraph;
pub use node::{FnNode, GraphState, Node, node_fn};
pub use time_travel::StateSnapshot;
