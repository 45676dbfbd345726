use std::io;
use std::sync::Arc;

use agent_graph::{CheckpointedGraph, GraphState, RunConfig, StateSnapshot, node_fn};
use agent_graph_checkpoint::ListOptions;
use agent_graph_checkpoint_sqlite::{SqliteSaver, SqliteSaverConfig};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Conversation {
    messages: Vec<String>,
}

impl GraphState for Conversation {
    type Update = Vec<String>;

    fn apply(&mut self, messages: Vec<String>) {
        self.messages.extend(messages);
    }
}

async fn open(config: &SqliteSaverConfig) -> Arc<SqliteSaver> {
    Arc::new(SqliteSaver::connect(config).await.unwrap())
}

fn echo_graph(
    saver: Arc<SqliteSaver>,
) -> CheckpointedGraph<Conversation, impl agent_graph::Node<Conversation>> {
    CheckpointedGraph::new(
        node_fn(|state: Conversation| async move {
            let last = state.messages.last().cloned().unwrap_or_default();
            Ok::<_, io::Error>(vec![format!("echo: {last}")])
        }),
        saver,
    )
}

#[tokio::test]
async fn test_session_resumes_after_restart() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dir = TempDir::new().unwrap();
    let settings = SqliteSaverConfig::new(dir.path().join("memory.sqlite"));
    let config = RunConfig::for_session("user-42");

    {
        let saver = open(&settings).await;
        let graph = echo_graph(saver.clone());
        graph
            .invoke(&config, Some(vec!["hello".into()]))
            .await
            .unwrap();
        graph
            .invoke(&config, Some(vec!["again".into()]))
            .await
            .unwrap();
        saver.close().await;
    }

    let graph = echo_graph(open(&settings).await);
    let latest = graph.get_state("user-42").await.unwrap().unwrap();
    assert_eq!(
        latest.values.messages,
        vec!["hello", "echo: hello", "again", "echo: again"]
    );

    let history: Vec<StateSnapshot<Conversation>> = graph
        .get_state_history("user-42", ListOptions::default())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].parent_config, Some(history[1].config.clone()));
}

#[tokio::test]
async fn test_undo_by_forking_a_past_checkpoint() {
    let dir = TempDir::new().unwrap();
    let settings = SqliteSaverConfig::new(dir.path().join("memory.sqlite"));
    let graph = echo_graph(open(&settings).await);
    let config = RunConfig::for_session("user-42");

    let first = graph
        .invoke(&config, Some(vec!["draft one".into()]))
        .await
        .unwrap();
    graph
        .invoke(&config, Some(vec!["draft two".into()]))
        .await
        .unwrap();

    let undo = graph.fork(&first.config, "user-42-undo").await.unwrap();
    let retried = graph
        .invoke(&undo, Some(vec!["draft two, revised".into()]))
        .await
        .unwrap();
    assert_eq!(
        retried.values.messages,
        vec![
            "draft one",
            "echo: draft one",
            "draft two, revised",
            "echo: draft two, revised"
        ]
    );

    let original = graph.get_state("user-42").await.unwrap().unwrap();
    assert_eq!(original.values.messages.len(), 4);
    assert_eq!(original.values.messages[2], "draft two");
}
