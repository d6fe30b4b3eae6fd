use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{info_span, Instrument};

/// A thin wrapper around [`tokio::task::JoinHandle`] which:
///
/// - adds the `#[must_use]` lint to ensure that all spawned tasks are joined
///   or explicitly annotated that no joining is required;
/// - carries a human-readable label which is attached to the task's tracing
///   span and printed when the task panics or is joined at shutdown.
#[must_use]
pub struct PtTask<T> {
    handle: JoinHandle<T>,
    name: &'static str,
}

impl<T: Send + 'static> PtTask<T> {
    /// Spawn an unnamed task. Prefer [`PtTask::spawn_named`]; the label makes
    /// shutdown logs and panics attributable.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self::spawn_named("(unnamed)", future)
    }

    /// Spawn a task whose tracing events are grouped under `name`.
    pub fn spawn_named<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let span = info_span!("task", %name);
        Self {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// The label this task was spawned with.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Abort the underlying tokio task.
    pub fn abort(&self) {
        self.handle.abort()
    }

    /// Whether the underlying tokio task has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for PtTask<T> {
    type Output = Result<T, JoinError>;
    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> fmt::Debug for PtTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtTask").field("name", &self.name).finish()
    }
}

/// Await all of the given tasks, logging the outcome of each. Used at
/// shutdown to drain worker pools before the process exits.
pub async fn join_all_and_log(tasks: Vec<PtTask<()>>) {
    for task in tasks {
        let name = task.name();
        match task.await {
            Ok(()) => tracing::info!("Task '{name}' finished"),
            Err(join_err) if join_err.is_panic() => {
                tracing::error!("Task '{name}' panicked: {join_err:#}")
            }
            Err(join_err) => {
                tracing::warn!("Task '{name}' was cancelled: {join_err:#}")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_returns_output() {
        let task = PtTask::spawn_named("adder", async { 1 + 1 });
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn join_all_tolerates_panics() {
        let ok = PtTask::spawn_named("ok", async {});
        let bad = PtTask::spawn_named("bad", async { panic!("boom") });
        join_all_and_log(vec![ok, bad]).await;
    }
}
