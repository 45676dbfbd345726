use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use agent_graph::{
    CheckpointedGraph, ConcurrencyPolicy, CoordinatorConfig, GraphError, GraphState, Node,
    RunConfig, StateSnapshot, node_fn,
};
use agent_graph_checkpoint::{
    BaseCheckpointSaver, CheckpointConfig, CheckpointError, CheckpointId, CheckpointMetadata,
    CheckpointSource, CheckpointStream, CheckpointTuple, EncodedValue, InMemorySaver, ListOptions,
    PendingCheckpoint, SnapshotSerde,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Counter {
    count: i64,
}

impl GraphState for Counter {
    type Update = i64;

    fn apply(&mut self, delta: i64) {
        self.count += delta;
    }
}

/// Adds one and counts how often it ran.
#[derive(Default)]
struct Increment {
    calls: AtomicUsize,
}

#[async_trait]
impl Node<Counter> for Increment {
    type Error = io::Error;

    async fn run(&self, _state: &Counter) -> Result<i64, io::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }
}

/// Delegates to an [`InMemorySaver`] but can be told to fail every `put`.
#[derive(Default)]
struct FlakySaver {
    inner: InMemorySaver,
    fail_puts: AtomicBool,
}

#[async_trait]
impl BaseCheckpointSaver for FlakySaver {
    async fn put(
        &self,
        session_id: &str,
        checkpoint: PendingCheckpoint,
        writes: EncodedValue,
        metadata: CheckpointMetadata,
    ) -> agent_graph_checkpoint::Result<CheckpointId> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(CheckpointError::storage_msg(Some(session_id), "disk full"));
        }
        self.inner.put(session_id, checkpoint, writes, metadata).await
    }

    async fn get_tuple(
        &self,
        config: &CheckpointConfig,
    ) -> agent_graph_checkpoint::Result<Option<CheckpointTuple>> {
        self.inner.get_tuple(config).await
    }

    fn list<'a>(
        &'a self,
        config: &'a CheckpointConfig,
        options: ListOptions,
    ) -> CheckpointStream<'a> {
        self.inner.list(config, options)
    }

    async fn delete_session(&self, session_id: &str) -> agent_graph_checkpoint::Result<()> {
        self.inner.delete_session(session_id).await
    }
}

fn counter_graph() -> CheckpointedGraph<Counter, Increment> {
    CheckpointedGraph::new(Increment::default(), Arc::new(InMemorySaver::new()))
}

async fn history<N: Node<Counter>>(
    graph: &CheckpointedGraph<Counter, N>,
    session_id: &str,
) -> Vec<StateSnapshot<Counter>> {
    graph
        .get_state_history(session_id, ListOptions::default())
        .try_collect()
        .await
        .unwrap()
}

fn ids(snapshots: &[StateSnapshot<Counter>]) -> Vec<CheckpointId> {
    snapshots
        .iter()
        .map(|snapshot| snapshot.checkpoint_id().unwrap())
        .collect()
}

#[tokio::test]
async fn test_counter_scenario() {
    let graph = counter_graph();
    let config = RunConfig::for_session("s1");

    let root = graph.update_state(&config, 0).await.unwrap();
    let c1 = graph.invoke(&config, None).await.unwrap();
    let c2 = graph.invoke(&config, None).await.unwrap();
    assert_eq!(c1.values, Counter { count: 1 });
    assert_eq!(c2.values, Counter { count: 2 });

    let latest = graph.get_state("s1").await.unwrap().unwrap();
    assert_eq!(latest.values, Counter { count: 2 });
    assert_eq!(latest.config, c2.config);
    assert_eq!(latest.parent_config, Some(c1.config.clone()));

    let states = history(&graph, "s1").await;
    let values: Vec<_> = states.iter().map(|s| s.values.count).collect();
    assert_eq!(values, vec![2, 1, 0]);
    assert_eq!(
        ids(&states),
        vec![
            c2.checkpoint_id().unwrap(),
            c1.checkpoint_id().unwrap(),
            root.checkpoint_id().unwrap(),
        ]
    );
    assert_eq!(states[2].metadata.source, CheckpointSource::Update);
    assert_eq!(states[2].metadata.step, -1);
    assert_eq!(states[0].metadata.source, CheckpointSource::Loop);
    assert_eq!(states[0].metadata.step, 1);
}

#[tokio::test]
async fn test_history_has_one_entry_per_invocation_plus_root() {
    let graph = counter_graph();
    let config = RunConfig::for_session("s1");
    graph.update_state(&config, 0).await.unwrap();

    let mut last = None;
    for _ in 0..6 {
        last = Some(graph.invoke(&config, None).await.unwrap());
    }

    let latest = graph.get_state("s1").await.unwrap().unwrap();
    assert_eq!(latest.config, last.unwrap().config);

    let states = history(&graph, "s1").await;
    assert_eq!(states.len(), 7);
    let ids = ids(&states);
    assert!(ids.windows(2).all(|pair| pair[0] > pair[1]));
}

#[tokio::test]
async fn test_unseeded_history_has_one_entry_per_invocation() {
    let graph = counter_graph();
    let config = RunConfig::for_session("s1");
    for _ in 0..6 {
        graph.invoke(&config, None).await.unwrap();
    }

    let states = history(&graph, "s1").await;
    assert_eq!(states.len(), 6);
    assert_eq!(states[5].metadata.source, CheckpointSource::Input);
    assert_eq!(states[5].parent_config, None);
    assert_eq!(states[0].values.count, 6);
}

#[tokio::test]
async fn test_invoke_on_empty_session_commits_root() {
    let graph = counter_graph();
    let snapshot = graph
        .invoke(&RunConfig::for_session("fresh"), Some(10))
        .await
        .unwrap();

    assert_eq!(snapshot.values.count, 11);
    assert_eq!(snapshot.parent_config, None);
    assert_eq!(snapshot.metadata.source, CheckpointSource::Input);

    let checkpoint = graph
        .saver()
        .get(&CheckpointConfig::new("fresh"))
        .await
        .unwrap()
        .unwrap();
    assert!(checkpoint.is_root());
    let writes: Vec<i64> = SnapshotSerde::default().decode(&checkpoint.writes).unwrap();
    assert_eq!(writes, vec![10, 1]);
}

#[tokio::test]
async fn test_missing_session_id_fails_before_loading() {
    let graph = counter_graph();

    let err = graph.invoke(&RunConfig::new(), None).await.unwrap_err();
    assert!(matches!(
        err,
        GraphError::Checkpoint(CheckpointError::MissingSessionId)
    ));
    assert_eq!(graph.node().calls.load(Ordering::SeqCst), 0);

    let err = graph.update_state(&RunConfig::new(), 1).await.unwrap_err();
    assert!(matches!(err, CheckpointError::MissingSessionId));
}

#[tokio::test]
async fn test_node_failure_commits_nothing() {
    let saver = Arc::new(InMemorySaver::new());
    let setup = CheckpointedGraph::new(Increment::default(), saver.clone());
    let root = setup
        .update_state(&RunConfig::for_session("s1"), 0)
        .await
        .unwrap();

    let failing = CheckpointedGraph::new(
        node_fn(|_: Counter| async { Err::<i64, _>(io::Error::other("model unavailable")) }),
        saver.clone(),
    );
    let err = failing
        .invoke(&RunConfig::for_session("s1"), Some(5))
        .await
        .unwrap_err();

    match err {
        GraphError::Node {
            session_id,
            checkpoint_id,
            source,
        } => {
            assert_eq!(session_id, "s1");
            assert_eq!(checkpoint_id, root.checkpoint_id());
            assert_eq!(source.to_string(), "model unavailable");
        }
        other => panic!("expected node error, got {other:?}"),
    }

    let latest = failing.get_state("s1").await.unwrap().unwrap();
    assert_eq!(latest.config, root.config);
    assert_eq!(history(&failing, "s1").await.len(), 1);
}

#[tokio::test]
async fn test_storage_failure_keeps_previous_head() {
    let saver = Arc::new(FlakySaver::default());
    let graph = CheckpointedGraph::new(Increment::default(), saver.clone());
    let config = RunConfig::for_session("s1");

    graph.update_state(&config, 0).await.unwrap();
    let before = graph.invoke(&config, None).await.unwrap();

    saver.fail_puts.store(true, Ordering::SeqCst);
    let err = graph.invoke(&config, None).await.unwrap_err();
    assert!(matches!(
        err,
        GraphError::Checkpoint(CheckpointError::Storage { .. })
    ));
    assert!(err.as_checkpoint().unwrap().is_retryable());

    let latest = graph.get_state("s1").await.unwrap().unwrap();
    assert_eq!(latest.config, before.config);
    assert_eq!(latest.values.count, 1);

    saver.fail_puts.store(false, Ordering::SeqCst);
    let after = graph.invoke(&config, None).await.unwrap();
    assert_eq!(after.values.count, 2);
    assert_eq!(after.parent_config, Some(before.config));
}

#[tokio::test]
async fn test_concurrent_invocations_wait_in_line() {
    let graph = CheckpointedGraph::new(
        node_fn(|_: Counter| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, io::Error>(1)
        }),
        Arc::new(InMemorySaver::new()),
    );
    let config = RunConfig::for_session("s1");
    graph.update_state(&config, 0).await.unwrap();

    let (first, second) = tokio::join!(graph.invoke(&config, None), graph.invoke(&config, None));
    let (first, second) = (first.unwrap(), second.unwrap());

    let mut counts = vec![first.values.count, second.values.count];
    counts.sort();
    assert_eq!(counts, vec![1, 2]);

    // Linear chain: each checkpoint's parent is the next older one.
    let states = history(&graph, "s1").await;
    assert_eq!(states.len(), 3);
    for pair in states.windows(2) {
        assert_eq!(pair[0].parent_config, Some(pair[1].config.clone()));
    }
}

#[tokio::test]
async fn test_reject_policy_fails_fast() {
    let graph = CheckpointedGraph::new(
        node_fn(|_: Counter| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, io::Error>(1)
        }),
        Arc::new(InMemorySaver::new()),
    )
    .with_config(CoordinatorConfig::new().with_concurrency(ConcurrencyPolicy::Reject));
    let config = RunConfig::for_session("s1");
    graph.update_state(&config, 0).await.unwrap();

    let (first, second) = tokio::join!(graph.invoke(&config, None), graph.invoke(&config, None));
    assert_eq!(first.unwrap().values.count, 1);
    let err = second.unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(
        err,
        GraphError::Checkpoint(CheckpointError::SessionBusy { .. })
    ));

    assert_eq!(history(&graph, "s1").await.len(), 2);
}

#[tokio::test]
async fn test_writers_in_separate_coordinators_conflict() {
    let saver: Arc<InMemorySaver> = Arc::new(InMemorySaver::new());
    let barrier = Arc::new(Barrier::new(2));

    let make = || {
        let barrier = barrier.clone();
        CheckpointedGraph::new(
            node_fn(move |_: Counter| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok::<_, io::Error>(1)
                }
            }),
            saver.clone(),
        )
    };
    let (a, b) = (make(), make());
    let config = RunConfig::for_session("s1");
    a.update_state(&config, 0).await.unwrap();

    let (ra, rb) = tokio::join!(a.invoke(&config, None), b.invoke(&config, None));
    let results = [ra, rb];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(GraphError::Checkpoint(CheckpointError::Conflict { .. }))
    )));

    assert_eq!(history(&a, "s1").await.len(), 2);
}

#[tokio::test]
async fn test_invoke_from_past_checkpoint_appends_after_latest() {
    let graph = counter_graph();
    let config = RunConfig::for_session("s1");
    graph.update_state(&config, 0).await.unwrap();
    let c1 = graph.invoke(&config, None).await.unwrap();
    graph.invoke(&config, None).await.unwrap();

    let replay = graph.invoke(&c1.config, Some(10)).await.unwrap();
    assert_eq!(replay.values.count, 12);
    assert_eq!(replay.parent_config, Some(c1.config.clone()));

    let latest = graph.get_state("s1").await.unwrap().unwrap();
    assert_eq!(latest.config, replay.config);
    assert_eq!(history(&graph, "s1").await.len(), 4);
}

#[tokio::test]
async fn test_unknown_checkpoint_is_not_found() {
    let graph = counter_graph();
    let config = RunConfig::for_session("s1");
    graph.update_state(&config, 0).await.unwrap();

    let missing = config.clone().with_checkpoint_id(CheckpointId::new());
    assert!(matches!(
        graph.get_state_at(&missing).await,
        Err(CheckpointError::NotFound { .. })
    ));

    let err = graph.invoke(&missing, None).await.unwrap_err();
    assert!(matches!(
        err,
        GraphError::Checkpoint(CheckpointError::NotFound { .. })
    ));
    assert_eq!(graph.node().calls.load(Ordering::SeqCst), 0);
    assert_eq!(history(&graph, "s1").await.len(), 1);
}

#[tokio::test]
async fn test_get_state_at_past_checkpoint() {
    let graph = counter_graph();
    let config = RunConfig::for_session("s1");
    let root = graph.update_state(&config, 5).await.unwrap();
    graph.invoke(&config, None).await.unwrap();

    let past = graph.get_state_at(&root.config).await.unwrap().unwrap();
    assert_eq!(past.values.count, 5);
    assert!(graph.get_state("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let graph = counter_graph();
    graph
        .update_state(&RunConfig::for_session("a"), 100)
        .await
        .unwrap();
    let b_root = graph
        .update_state(&RunConfig::for_session("b"), 0)
        .await
        .unwrap();
    graph.invoke(&RunConfig::for_session("a"), None).await.unwrap();

    assert_eq!(history(&graph, "b").await.len(), 1);
    assert_eq!(
        graph.get_state("b").await.unwrap().unwrap().config,
        b_root.config
    );

    let crossed = RunConfig::for_session("a").with_checkpoint_id(b_root.checkpoint_id().unwrap());
    assert!(matches!(
        graph.get_state_at(&crossed).await,
        Err(CheckpointError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_fork_leaves_source_untouched() {
    let graph = counter_graph();
    let config = RunConfig::for_session("s1");
    graph.update_state(&config, 0).await.unwrap();
    let k = graph.invoke(&config, None).await.unwrap();
    graph.invoke(&config, None).await.unwrap();
    let before = history(&graph, "s1").await;

    let forked = graph.fork(&k.config, "s1-retry").await.unwrap();
    assert_eq!(forked.session_id.as_deref(), Some("s1-retry"));
    let continued = graph.invoke(&forked, Some(5)).await.unwrap();
    assert_eq!(continued.values.count, 1 + 5 + 1);

    assert_eq!(history(&graph, "s1").await, before);

    let branch = history(&graph, "s1-retry").await;
    assert_eq!(branch.len(), 2);
    let fork_root = &branch[1];
    assert_eq!(fork_root.values, k.values);
    assert_eq!(fork_root.parent_config, Some(k.config.clone()));
    assert_eq!(fork_root.metadata.source, CheckpointSource::Fork);
    assert_eq!(
        fork_root.metadata.forked_from,
        Some(CheckpointConfig::at("s1", k.checkpoint_id().unwrap()))
    );
}

#[tokio::test]
async fn test_fork_errors() {
    let graph = counter_graph();
    graph
        .update_state(&RunConfig::for_session("s1"), 0)
        .await
        .unwrap();
    graph
        .update_state(&RunConfig::for_session("taken"), 0)
        .await
        .unwrap();

    assert!(matches!(
        graph.fork(&RunConfig::for_session("s1"), "taken").await,
        Err(CheckpointError::Conflict { .. })
    ));
    assert!(matches!(
        graph.fork(&RunConfig::for_session("empty"), "new").await,
        Err(CheckpointError::EmptySession { .. })
    ));
    assert!(matches!(
        graph.fork(&RunConfig::for_session("s1"), "").await,
        Err(CheckpointError::MissingSessionId)
    ));
}

#[tokio::test]
async fn test_tags_are_recorded() {
    let graph = counter_graph().with_config(CoordinatorConfig::new().with_default_tag("batch"));
    let config = RunConfig::for_session("s1");

    let root = graph.update_state(&config, 0).await.unwrap();
    let tagged = graph
        .invoke(&config.clone().with_tag("manual"), None)
        .await
        .unwrap();

    assert_eq!(root.metadata.tag.as_deref(), Some("batch"));
    assert_eq!(tagged.metadata.tag.as_deref(), Some("manual"));

    let stored = graph.get_state("s1").await.unwrap().unwrap();
    assert_eq!(stored.metadata.tag.as_deref(), Some("manual"));
}

#[tokio::test]
async fn test_history_paging() {
    let graph = counter_graph();
    let config = RunConfig::for_session("s1");
    graph.update_state(&config, 0).await.unwrap();
    for _ in 0..4 {
        graph.invoke(&config, None).await.unwrap();
    }
    let all = ids(&history(&graph, "s1").await);

    let page: Vec<StateSnapshot<Counter>> = graph
        .get_state_history("s1", ListOptions::new().with_before(all[1]).with_limit(2))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(ids(&page), vec![all[2], all[3]]);

    let results: Vec<_> = futures::StreamExt::collect::<Vec<_>>(
        graph.get_state_history("", ListOptions::default()),
    )
    .await;
    assert!(matches!(
        results.as_slice(),
        [Err(CheckpointError::MissingSessionId)]
    ));
}
