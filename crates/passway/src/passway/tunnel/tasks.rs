use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::task::JoinSet;

#[derive(Default)]
struct State {
    set: JoinSet<()>,
    closed: bool,
}

/// Supervised set of background tasks belonging to one client run.
///
/// Every spawned task is tracked until it finishes, so shutdown can wait for
/// the whole group with a deadline instead of leaking detached work.
#[derive(Clone, Default)]
pub struct TaskGroup {
    inner: Arc<Mutex<State>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `fut`. After [`TaskGroup::drain`] has started, new work is
    /// dropped without running. Returns whether the task was spawned.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if st.closed {
            return false;
        }
        // Reap whatever already finished so long runs don't accumulate results.
        while st.set.try_join_next().is_some() {}
        st.set.spawn(fut);
        true
    }

    /// Number of tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the group and wait up to `grace` for every task to finish.
    /// Whatever is still running afterwards is aborted; returns that count.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut set = {
            let mut st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            st.closed = true;
            std::mem::take(&mut st.set)
        };

        let wait = async {
            while let Some(res) = set.join_next().await {
                if let Err(err) = res
                    && err.is_panic()
                {
                    tracing::error!(err = %err, "tasks: background task panicked");
                }
            }
        };
        if tokio::time::timeout(grace, wait).await.is_ok() {
            return 0;
        }

        let aborted = set.len();
        set.abort_all();
        while set.join_next().await.is_some() {}
        tracing::warn!(
            aborted,
            grace = %humantime::format_duration(grace),
            "tasks: grace period elapsed; aborted remaining tasks"
        );
        aborted
    }
}
