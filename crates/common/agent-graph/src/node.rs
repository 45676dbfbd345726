//! Executor capabilities the coordinator depends on.
//!
//! The coordinator never sees a concrete executor. It hands the decoded
//! state to a [`Node`] and folds the returned update back in through
//! [`GraphState::apply`].

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// State carried from checkpoint to checkpoint.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Default, Serialize, Deserialize)]
/// struct Counter {
///     count: i64,
/// }
///
/// impl GraphState for Counter {
///     type Update = i64;
///
///     fn apply(&mut self, delta: i64) {
///         self.count += delta;
///     }
/// }
/// ```
pub trait GraphState:
    Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Incremental change produced by a node or supplied as input.
    type Update: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Reducer folding an update into the state.
    fn apply(&mut self, update: Self::Update);
}

/// A unit of work: reads the state and returns an update.
#[async_trait]
pub trait Node<S: GraphState>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn run(&self, state: &S) -> Result<S::Update, Self::Error>;
}

/// [`Node`] backed by an async closure. Built with [`node_fn`].
pub struct FnNode<F, E> {
    func: F,
    _error: PhantomData<fn() -> E>,
}

/// Wrap an async closure as a [`Node`].
///
/// The closure receives its own copy of the state.
///
/// ```ignore
/// let increment = node_fn(|state: Counter| async move {
///     Ok::<_, std::io::Error>(state.count + 1)
/// });
/// ```
pub fn node_fn<S, F, Fut, E>(func: F) -> FnNode<F, E>
where
    S: GraphState,
    F: Fn(S) -> Fut + Send + Sync,
    Fut: Future<Output = Result<S::Update, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    FnNode {
        func,
        _error: PhantomData,
    }
}

#[async_trait]
impl<S, F, Fut, E> Node<S> for FnNode<F, E>
where
    S: GraphState,
    F: Fn(S) -> Fut + Send + Sync,
    Fut: Future<Output = Result<S::Update, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn run(&self, state: &S) -> Result<S::Update, E> {
        (self.func)(state.clone()).await
    }
}

impl<F, E> std::fmt::Debug for FnNode<F, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnNode").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Log {
        lines: Vec<String>,
    }

    impl GraphState for Log {
        type Update = String;

        fn apply(&mut self, line: String) {
            self.lines.push(line);
        }
    }

    #[tokio::test]
    async fn test_node_fn_sees_state() {
        let node = node_fn(|state: Log| async move {
            Ok::<_, std::io::Error>(format!("line {}", state.lines.len()))
        });

        let mut state = Log::default();
        state.apply("first".into());
        let update = node.run(&state).await.unwrap();
        assert_eq!(update, "line 1");
    }

    #[tokio::test]
    async fn test_node_fn_propagates_error() {
        let node = node_fn(|_: Log| async move {
            Err::<String, _>(std::io::Error::other("boom"))
        });
        let err = node.run(&Log::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
