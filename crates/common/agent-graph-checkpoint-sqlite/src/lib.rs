//! SQLite implementation of an agent-graph checkpoint saver.
//!
//! Stores every session of a checkpointer in one database file so execution
//! can resume after the process restarts.
//!
//! # Example
//!
//! ```ignore
//! use agent_graph_checkpoint::{BaseCheckpointSaver, CheckpointConfig};
//! use agent_graph_checkpoint_sqlite::{SqliteSaver, SqliteSaverConfig};
//!
//! let saver = SqliteSaver::connect(&SqliteSaverConfig::new("assistant.sqlite")).await?;
//! let latest = saver.get_tuple(&CheckpointConfig::new("user-john")).await?;
//! ```

mod config;
mod saver;

pub use config::SqliteSaverConfig;
pub use saver::SqliteSaver;
