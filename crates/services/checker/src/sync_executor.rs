//! Fan-out/fan-in helper over a bounded task pool.
//!
//! A [`SyncExecutor`] submits tasks to an injected [`TaskPool`], awaits
//! them all, and collects results in submission order. A user-supplied
//! cancel predicate flips a shared stop token when a result demands it;
//! tasks that observe the token before running return without executing
//! and contribute no result.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Semaphore, task::JoinHandle};

/// How long [`SyncExecutor::when_all`] waits between progress warnings.
const WAIT_WARN_INTERVAL: Duration = Duration::from_secs(300);

/// A semaphore-bounded spawner shared by the check workers.
pub struct TaskPool {
    permits: Arc<Semaphore>,
}

impl TaskPool {
    pub fn new(concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    /// Spawn `fut`, running it once a pool permit is available.
    pub fn spawn<T>(&self, fut: impl Future<Output = T> + Send + 'static) -> JoinHandle<T>
    where
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("task pool semaphore is never closed");
            fut.await
        })
    }
}

/// Fan-out executor parameterized by task result type.
pub struct SyncExecutor<T> {
    pool: Arc<TaskPool>,
    name_tag: String,
    cancel: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    stop_token: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<Option<T>>>,
}

impl<T: Send + 'static> SyncExecutor<T> {
    pub fn new(pool: Arc<TaskPool>, name_tag: impl Into<String>) -> Self {
        Self::with_cancel(pool, name_tag, |_| false)
    }

    /// An executor whose `cancel` predicate, when satisfied by a task's
    /// result, prevents not-yet-started tasks from executing.
    pub fn with_cancel(
        pool: Arc<TaskPool>,
        name_tag: impl Into<String>,
        cancel: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            pool,
            name_tag: name_tag.into(),
            cancel: Arc::new(cancel),
            stop_token: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    /// Submit a task to the pool.
    pub fn add(&mut self, task: impl Future<Output = T> + Send + 'static) -> &mut Self {
        let stop_token = self.stop_token.clone();
        let cancel = self.cancel.clone();
        let handle = self.pool.spawn(async move {
            if stop_token.load(Ordering::Acquire) {
                return None;
            }
            let result = task.await;
            // The result is returned to the caller even when it triggers
            // cancellation; only tasks that have not started are skipped.
            if cancel(&result) {
                stop_token.store(true, Ordering::Release);
            }
            Some(result)
        });
        self.tasks.push(handle);
        self
    }

    /// Await every submitted task and collect results in submission order.
    ///
    /// This is a barrier: every task is joined before anything is
    /// collected, so no task keeps running once `when_all` returns — a
    /// task that slipped past the stop token and is mid-flight when a
    /// result triggers cancellation is still waited for. Collection then
    /// stops at the first task that was skipped by the stop token;
    /// `finished` is true iff every submitted task produced a result.
    /// Logs a warning for every five minutes spent waiting.
    pub async fn when_all(&mut self) -> (Vec<T>, bool) {
        let tasks = std::mem::take(&mut self.tasks);
        let submitted = tasks.len();
        let mut waited = Duration::ZERO;

        let mut joined = Vec::with_capacity(submitted);
        for mut handle in tasks {
            let result = loop {
                match tokio::time::timeout(WAIT_WARN_INTERVAL, &mut handle).await {
                    Ok(result) => break result,
                    Err(_) => {
                        waited += WAIT_WARN_INTERVAL;
                        tracing::warn!(
                            name_tag = %self.name_tag,
                            waited_s = waited.as_secs(),
                            "sync executor still waiting for tasks"
                        );
                    }
                }
            };
            joined.push(result);
        }

        let mut results = Vec::with_capacity(submitted);
        for result in joined {
            match result {
                Ok(Some(result)) => results.push(result),
                // A skipped task ends collection, like the tasks after it.
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(name_tag = %self.name_tag, error = %err, "sync executor task died");
                    break;
                }
            }
        }

        let finished = results.len() == submitted;
        (results, finished)
    }

    /// Drain outstanding tasks and clear the stop token.
    pub async fn reset(&mut self) {
        if !self.tasks.is_empty() {
            let _ = self.when_all().await;
        }
        self.stop_token.store(false, Ordering::Release);
    }
}

impl<T> Drop for SyncExecutor<T> {
    fn drop(&mut self) {
        // Dropping without `when_all` abandons outstanding tasks.
        for handle in &self.tasks {
            handle.abort();
        }
    }
}
