//! Conformance suite for [`BaseCheckpointSaver`] implementations.
//!
//! Every backend must behave identically with respect to chain ordering,
//! session isolation, optimistic concurrency and payload fidelity. Backend
//! crates call [`run_conformance`] from their integration tests:
//!
//! ```ignore
//! #[tokio::test]
//! async fn test_conformance() {
//!     agent_graph_checkpoint_conformance::run_conformance(|| async {
//!         MySaver::connect("...").await.unwrap()
//!     })
//!     .await;
//! }
//! ```
//!
//! The checks panic on the first violation, like ordinary test assertions.

use std::future::Future;

use agent_graph_checkpoint::{
    BaseCheckpointSaver, CheckpointConfig, CheckpointError, CheckpointId, CheckpointMetadata,
    CheckpointSource, CheckpointTuple, EncodedValue, ListOptions, ParentRef, PendingCheckpoint,
    SerdeFormat, SnapshotSerde,
};
use futures::{StreamExt, TryStreamExt, future};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    count: u32,
    trail: Vec<String>,
}

/// Run every check against fresh savers produced by `factory`.
pub async fn run_conformance<S, F, Fut>(factory: F)
where
    S: BaseCheckpointSaver,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    macro_rules! check {
        ($name:ident) => {{
            info!(check = stringify!($name), "running checkpoint conformance check");
            let saver = factory().await;
            $name(&saver).await;
        }};
    }

    check!(check_empty_session);
    check!(check_missing_session_id);
    check!(check_put_and_get);
    check!(check_list_order);
    check!(check_list_paging);
    check!(check_session_isolation);
    check!(check_missing_checkpoint);
    check!(check_stale_head);
    check!(check_missing_parent);
    check!(check_cross_session_parent);
    check!(check_parent_linkage);
    check!(check_payload_fidelity);
    check!(check_racing_writers);
    check!(check_delete_session);
}

/// Commit a `Loop` checkpoint on top of `parent`, which must be the head.
pub async fn commit<S>(
    saver: &S,
    session_id: &str,
    parent: Option<CheckpointId>,
    count: u32,
) -> CheckpointId
where
    S: BaseCheckpointSaver + ?Sized,
{
    saver
        .put(
            session_id,
            pending(session_id, parent, count),
            writes(count),
            CheckpointMetadata::new(CheckpointSource::Loop, i64::from(count)),
        )
        .await
        .unwrap_or_else(|err| panic!("put into '{session_id}' failed: {err}"))
}

/// Commit `len` checkpoints as a linear chain and return their ids oldest first.
pub async fn commit_chain<S>(saver: &S, session_id: &str, len: u32) -> Vec<CheckpointId>
where
    S: BaseCheckpointSaver + ?Sized,
{
    let mut ids = Vec::with_capacity(len as usize);
    for count in 0..len {
        let id = commit(saver, session_id, ids.last().copied(), count).await;
        ids.push(id);
    }
    ids
}

fn pending(session_id: &str, parent: Option<CheckpointId>, count: u32) -> PendingCheckpoint {
    let state = Counter {
        count,
        trail: vec![format!("{session_id}:{count}")],
    };
    PendingCheckpoint {
        parent: parent.map(|id| ParentRef::new(session_id, id)),
        expected_head: parent,
        state: SnapshotSerde::default()
            .encode(&state)
            .expect("counter state encodes"),
    }
}

fn writes(count: u32) -> EncodedValue {
    SnapshotSerde::default()
        .encode(&vec![("count", count)])
        .expect("write-set encodes")
}

async fn list_ids<S>(
    saver: &S,
    config: &CheckpointConfig,
    options: ListOptions,
) -> Vec<CheckpointId>
where
    S: BaseCheckpointSaver + ?Sized,
{
    saver
        .list(config, options)
        .map_ok(|tuple| tuple.id())
        .try_collect()
        .await
        .expect("list succeeds")
}

async fn latest<S>(saver: &S, session_id: &str) -> Option<CheckpointTuple>
where
    S: BaseCheckpointSaver + ?Sized,
{
    saver
        .get_tuple(&CheckpointConfig::new(session_id))
        .await
        .expect("get_tuple succeeds")
}

/// An unknown session has no latest checkpoint and lists nothing.
pub async fn check_empty_session<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    assert!(latest(saver, "empty").await.is_none());
    assert!(
        saver
            .get(&CheckpointConfig::new("empty"))
            .await
            .expect("get succeeds")
            .is_none()
    );
    let ids = list_ids(saver, &CheckpointConfig::new("empty"), ListOptions::default()).await;
    assert!(ids.is_empty());
}

/// Every entry point refuses a missing or blank session id.
pub async fn check_missing_session_id<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let blank = CheckpointConfig::default();
    assert!(matches!(
        saver.get_tuple(&blank).await,
        Err(CheckpointError::MissingSessionId)
    ));

    let results: Vec<_> = saver.list(&blank, ListOptions::default()).collect().await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(CheckpointError::MissingSessionId)));

    let result = saver
        .put(
            "  ",
            pending("  ", None, 0),
            writes(0),
            CheckpointMetadata::new(CheckpointSource::Input, -1),
        )
        .await;
    assert!(matches!(result, Err(CheckpointError::MissingSessionId)));
}

/// `get_tuple` returns the head by default and any committed id on request.
pub async fn check_put_and_get<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let ids = commit_chain(saver, "s1", 3).await;

    let head = latest(saver, "s1").await.expect("session has a head");
    assert_eq!(head.id(), ids[2]);
    assert_eq!(head.config, CheckpointConfig::at("s1", ids[2]));
    assert_eq!(head.parent_config, Some(CheckpointConfig::at("s1", ids[1])));

    let root = saver
        .get_tuple(&CheckpointConfig::at("s1", ids[0]))
        .await
        .expect("get_tuple succeeds")
        .expect("root exists");
    assert!(root.checkpoint.is_root());
    assert!(root.parent_config.is_none());

    let state: Counter = SnapshotSerde::default()
        .decode(&root.checkpoint.state)
        .expect("state decodes");
    assert_eq!(state.count, 0);
}

/// Ids are strictly increasing and `list` yields them newest first.
pub async fn check_list_order<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let ids = commit_chain(saver, "s1", 5).await;
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(
        ids.windows(2)
            .all(|pair| pair[0].to_string() < pair[1].to_string())
    );

    let listed = list_ids(saver, &CheckpointConfig::new("s1"), ListOptions::default()).await;
    let mut expected = ids.clone();
    expected.reverse();
    assert_eq!(listed, expected);

    // Restartable: a second listing sees the same sequence.
    let again = list_ids(saver, &CheckpointConfig::new("s1"), ListOptions::default()).await;
    assert_eq!(again, listed);
}

/// `before` is exclusive and `limit` caps the page.
pub async fn check_list_paging<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let ids = commit_chain(saver, "s1", 5).await;
    let config = CheckpointConfig::new("s1");

    let first = list_ids(saver, &config, ListOptions::new().with_limit(2)).await;
    assert_eq!(first, vec![ids[4], ids[3]]);

    let second = list_ids(
        saver,
        &config,
        ListOptions::new().with_before(ids[3]).with_limit(2),
    )
    .await;
    assert_eq!(second, vec![ids[2], ids[1]]);

    let rest = list_ids(saver, &config, ListOptions::new().with_before(ids[1])).await;
    assert_eq!(rest, vec![ids[0]]);

    let none = list_ids(saver, &config, ListOptions::new().with_before(ids[0])).await;
    assert!(none.is_empty());

    let zero = list_ids(saver, &config, ListOptions::new().with_limit(0)).await;
    assert!(zero.is_empty());
}

/// Sessions never observe each other's checkpoints.
pub async fn check_session_isolation<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let a = commit_chain(saver, "a", 2).await;
    let b = commit_chain(saver, "b", 3).await;

    assert_eq!(latest(saver, "a").await.map(|t| t.id()), Some(a[1]));
    assert_eq!(latest(saver, "b").await.map(|t| t.id()), Some(b[2]));

    let listed = list_ids(saver, &CheckpointConfig::new("a"), ListOptions::default()).await;
    assert_eq!(listed, vec![a[1], a[0]]);

    let result = saver.get_tuple(&CheckpointConfig::at("a", b[0])).await;
    assert!(matches!(
        result,
        Err(CheckpointError::NotFound { ref session_id, checkpoint_id })
            if session_id == "a" && checkpoint_id == b[0]
    ));
}

/// An explicit id that was never committed is `NotFound`, not `None`.
pub async fn check_missing_checkpoint<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    commit_chain(saver, "s1", 1).await;
    let missing = CheckpointId::new();
    let result = saver.get_tuple(&CheckpointConfig::at("s1", missing)).await;
    assert!(matches!(result, Err(CheckpointError::NotFound { .. })));

    let result = saver.get(&CheckpointConfig::at("never", missing)).await;
    assert!(matches!(result, Err(CheckpointError::NotFound { .. })));
}

/// A writer that observed an old head cannot append.
pub async fn check_stale_head<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let ids = commit_chain(saver, "s1", 2).await;

    let result = saver
        .put(
            "s1",
            pending("s1", Some(ids[0]), 9),
            writes(9),
            CheckpointMetadata::new(CheckpointSource::Loop, 9),
        )
        .await;
    assert!(matches!(
        result,
        Err(CheckpointError::Conflict { expected, found, .. })
            if expected == Some(ids[0]) && found == Some(ids[1])
    ));

    // A second root for a non-empty session is a conflict too.
    let result = saver
        .put(
            "s1",
            pending("s1", None, 0),
            writes(0),
            CheckpointMetadata::new(CheckpointSource::Input, -1),
        )
        .await;
    assert!(matches!(result, Err(CheckpointError::Conflict { .. })));

    assert_eq!(latest(saver, "s1").await.map(|t| t.id()), Some(ids[1]));
}

/// A put naming a parent that does not exist commits nothing.
pub async fn check_missing_parent<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let ids = commit_chain(saver, "s1", 1).await;
    let result = saver
        .put(
            "s1",
            PendingCheckpoint {
                parent: Some(ParentRef::new("s1", CheckpointId::new())),
                expected_head: Some(ids[0]),
                state: pending("s1", None, 1).state,
            },
            writes(1),
            CheckpointMetadata::new(CheckpointSource::Loop, 1),
        )
        .await;
    assert!(matches!(result, Err(CheckpointError::NotFound { .. })));

    let listed = list_ids(saver, &CheckpointConfig::new("s1"), ListOptions::default()).await;
    assert_eq!(listed, ids);
}

/// A root may point at a checkpoint in another session, as a fork does.
pub async fn check_cross_session_parent<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let source = commit_chain(saver, "source", 3).await;
    let before = list_ids(saver, &CheckpointConfig::new("source"), ListOptions::default()).await;

    let origin = CheckpointConfig::at("source", source[1]);
    let fork = saver
        .put(
            "fork",
            PendingCheckpoint {
                parent: Some(ParentRef::new("source", source[1])),
                expected_head: None,
                state: pending("fork", None, 1).state,
            },
            writes(1),
            CheckpointMetadata::new(CheckpointSource::Fork, 1).with_forked_from(origin.clone()),
        )
        .await
        .expect("fork root commits");

    let tuple = latest(saver, "fork").await.expect("fork has a head");
    assert_eq!(tuple.id(), fork);
    assert!(tuple.checkpoint.is_root());
    assert_eq!(tuple.parent_config, Some(origin.clone()));
    assert_eq!(tuple.metadata().source, CheckpointSource::Fork);
    assert_eq!(tuple.metadata().forked_from, Some(origin));

    let after = list_ids(saver, &CheckpointConfig::new("source"), ListOptions::default()).await;
    assert_eq!(after, before);
}

/// A continuation must descend from its own session; only a root may point
/// elsewhere. Rejected puts leave the chain untouched.
pub async fn check_parent_linkage<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let ids = commit_chain(saver, "s1", 2).await;
    let other = commit_chain(saver, "other", 1).await;
    let head = ids[1];

    let orphan = PendingCheckpoint {
        parent: None,
        expected_head: Some(head),
        state: pending("s1", None, 2).state,
    };
    let foreign = PendingCheckpoint {
        parent: Some(ParentRef::new("other", other[0])),
        expected_head: Some(head),
        state: pending("s1", None, 2).state,
    };
    for checkpoint in [orphan, foreign] {
        let result = saver
            .put(
                "s1",
                checkpoint,
                writes(2),
                CheckpointMetadata::new(CheckpointSource::Loop, 2),
            )
            .await;
        assert!(matches!(
            result,
            Err(CheckpointError::InvalidParent { ref session_id, .. }) if session_id == "s1"
        ));
    }

    // A root cannot name a checkpoint of its own session.
    let result = saver
        .put(
            "fresh",
            PendingCheckpoint {
                parent: Some(ParentRef::new("fresh", CheckpointId::new())),
                expected_head: None,
                state: pending("fresh", None, 0).state,
            },
            writes(0),
            CheckpointMetadata::new(CheckpointSource::Input, -1),
        )
        .await;
    assert!(matches!(result, Err(CheckpointError::InvalidParent { .. })));
    assert!(latest(saver, "fresh").await.is_none());

    assert_eq!(latest(saver, "s1").await.map(|t| t.id()), Some(head));
    let listed = list_ids(saver, &CheckpointConfig::new("s1"), ListOptions::default()).await;
    assert_eq!(listed, vec![ids[1], ids[0]]);
    let listed = list_ids(saver, &CheckpointConfig::new("other"), ListOptions::default()).await;
    assert_eq!(listed, other);

    // The same head still accepts a well-formed continuation.
    commit(saver, "s1", Some(head), 2).await;
}

/// Payload bytes, format tags and metadata come back exactly as written.
pub async fn check_payload_fidelity<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let json = SnapshotSerde::json();
    let state = json
        .encode(&serde_json::json!({"nested": {"values": [1, 2, 3]}, "text": "héllo"}))
        .expect("json encodes");
    let write_set = EncodedValue::new(SerdeFormat::MsgPack, vec![0x00, 0xff, 0x10]);
    let metadata = CheckpointMetadata::new(CheckpointSource::Update, 4).with_tag("v1");

    let id = saver
        .put(
            "s1",
            PendingCheckpoint {
                parent: None,
                expected_head: None,
                state: state.clone(),
            },
            write_set.clone(),
            metadata.clone(),
        )
        .await
        .expect("put succeeds");

    let checkpoint = saver
        .get(&CheckpointConfig::at("s1", id))
        .await
        .expect("get succeeds")
        .expect("checkpoint exists");
    assert_eq!(checkpoint.session_id, "s1");
    assert_eq!(checkpoint.state, state);
    assert_eq!(checkpoint.writes, write_set);
    assert_eq!(checkpoint.metadata.source, metadata.source);
    assert_eq!(checkpoint.metadata.step, metadata.step);
    assert_eq!(checkpoint.metadata.tag, metadata.tag);
    assert_eq!(
        checkpoint.metadata.created_at.timestamp_millis(),
        metadata.created_at.timestamp_millis()
    );
}

/// Of several writers racing from the same head exactly one wins.
pub async fn check_racing_writers<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    let ids = commit_chain(saver, "s1", 1).await;

    let attempts = (1..=4).map(|count| {
        saver.put(
            "s1",
            pending("s1", Some(ids[0]), count),
            writes(count),
            CheckpointMetadata::new(CheckpointSource::Loop, i64::from(count)),
        )
    });
    let results = future::join_all(attempts).await;

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(CheckpointError::Conflict { .. })))
    );

    let listed = list_ids(saver, &CheckpointConfig::new("s1"), ListOptions::default()).await;
    assert_eq!(listed, vec![*winners[0], ids[0]]);
}

/// Deleting one session leaves the others intact.
pub async fn check_delete_session<S: BaseCheckpointSaver + ?Sized>(saver: &S) {
    commit_chain(saver, "a", 2).await;
    let b = commit_chain(saver, "b", 2).await;

    saver.delete_session("a").await.expect("delete succeeds");
    assert!(latest(saver, "a").await.is_none());
    assert!(
        list_ids(saver, &CheckpointConfig::new("a"), ListOptions::default())
            .await
            .is_empty()
    );
    assert_eq!(latest(saver, "b").await.map(|t| t.id()), Some(b[1]));

    // The session can start over from a new root.
    let root = commit(saver, "a", None, 0).await;
    assert_eq!(latest(saver, "a").await.map(|t| t.id()), Some(root));

    saver
        .delete_session("never-existed")
        .await
        .expect("deleting an unknown session is a no-op");
}
