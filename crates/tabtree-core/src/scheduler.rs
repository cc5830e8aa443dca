//! Delay-coalescing task executor.
//!
//! Bursts of "state changed" notifications collapse into a bounded number of
//! executions. When the timer fires with several tasks queued, the
//! second-to-last one runs and only the newest is kept for the next cycle, so
//! the latest state is always processed eventually and the oldest tasks are
//! dropped.
//!
//! ```text
//! schedule(T1) schedule(T2) schedule(T3)   ──delay──►  run T2, keep [T3]  ──delay──►  run T3
//! ```
//!
//! Tasks scheduled with the same key replace each other while queued.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type TaskFuture = Pin<Box<dyn Future<Output = crate::Result<()>> + Send>>;
type Task = Box<dyn FnOnce() -> TaskFuture + Send>;

struct Queued {
    key: Option<String>,
    task: Task,
}

#[derive(Default)]
struct ExecutorState {
    queue: VecDeque<Queued>,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    name: &'static str,
    delay: Duration,
    state: Mutex<ExecutorState>,
}

/// Delay-coalescing executor. Cheap to clone; clones share one queue.
///
/// `schedule` must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct CoalescingExecutor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CoalescingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingExecutor")
            .field("name", &self.shared.name)
            .field("delay", &self.shared.delay)
            .field("pending", &self.pending())
            .finish()
    }
}

impl CoalescingExecutor {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                delay,
                state: Mutex::new(ExecutorState::default()),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.shared.delay
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Queue `task`, replacing any queued task with the same `key`, and arm
    /// the timer if it is idle.
    pub fn schedule<F, Fut>(&self, key: Option<&str>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let task: Task = Box::new(move || Box::pin(task()));
        let mut state = self.shared.state.lock();
        if let Some(key) = key {
            state.queue.retain(|queued| queued.key.as_deref() != Some(key));
        }
        state.queue.push_back(Queued {
            key: key.map(str::to_string),
            task,
        });
        if state.timer.is_none() {
            state.timer = Some(self.arm());
        }
    }

    /// Run every queued task now, in order, and cancel the timer.
    pub async fn flush(&self) {
        let drained: Vec<Queued> = {
            let mut state = self.shared.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.queue.drain(..).collect()
        };
        for queued in drained {
            run_contained(self.shared.name, queued).await;
        }
    }

    /// Drop every queued task without running it.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let dropped = state.queue.len();
        state.queue.clear();
        if dropped > 0 {
            debug!(executor = self.shared.name, dropped, "executor queue cleared");
        }
    }

    fn arm(&self) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(executor.shared.delay).await;
            executor.fire().await;
        })
    }

    async fn fire(&self) {
        let next = {
            let mut state = self.shared.state.lock();
            state.timer = None;
            let next = match state.queue.len() {
                0 => None,
                1 => state.queue.pop_front(),
                _ => {
                    let newest = state.queue.pop_back();
                    let runnable = state.queue.pop_back();
                    state.queue.clear();
                    state.queue.extend(newest);
                    runnable
                }
            };
            if !state.queue.is_empty() {
                state.timer = Some(self.arm());
            }
            next
        };
        if let Some(queued) = next {
            run_contained(self.shared.name, queued).await;
        }
    }
}

/// Run a task on its own Tokio task so errors and panics stay contained.
async fn run_contained(executor: &'static str, queued: Queued) {
    let key = queued.key;
    let task = queued.task;
    match tokio::spawn(async move { task().await }).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(executor, key = ?key, error = %err, "scheduled task failed"),
        Err(join_err) => warn!(executor, key = ?key, error = %join_err, "scheduled task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn record(log: &Log, name: &'static str) -> impl FnOnce() -> std::future::Ready<crate::Result<()>> + Send + 'static {
        let log = Arc::clone(log);
        move || {
            log.lock().push(name);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_runs_second_to_last_and_keeps_newest() {
        let log: Log = Arc::default();
        let executor = CoalescingExecutor::new("test", Duration::from_millis(200));
        executor.schedule(None, record(&log, "t1"));
        executor.schedule(None, record(&log, "t2"));
        executor.schedule(None, record(&log, "t3"));

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(*log.lock(), vec!["t2"]);
        assert_eq!(executor.pending(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock(), vec!["t2", "t3"]);
        assert_eq!(executor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_task_runs_once_after_delay() {
        let log: Log = Arc::default();
        let executor = CoalescingExecutor::new("test", Duration::from_millis(500));
        executor.schedule(None, record(&log, "only"));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(log.lock().is_empty());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*log.lock(), vec!["only"]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_replaces_queued_task() {
        let log: Log = Arc::default();
        let executor = CoalescingExecutor::new("test", Duration::from_millis(100));
        executor.schedule(Some("snapshot"), record(&log, "old"));
        executor.schedule(Some("snapshot"), record(&log, "new"));
        assert_eq!(executor.pending(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*log.lock(), vec!["new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_runs_everything_in_order() {
        let log: Log = Arc::default();
        let executor = CoalescingExecutor::new("test", Duration::from_secs(60));
        executor.schedule(None, record(&log, "a"));
        executor.schedule(None, record(&log, "b"));
        executor.schedule(None, record(&log, "c"));
        executor.flush().await;
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(log.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_without_running() {
        let log: Log = Arc::default();
        let executor = CoalescingExecutor::new("test", Duration::from_millis(100));
        executor.schedule(None, record(&log, "dropped"));
        executor.clear();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(log.lock().is_empty());
        assert_eq!(executor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_and_panicking_tasks_do_not_stop_others() {
        let log: Log = Arc::default();
        let executor = CoalescingExecutor::new("test", Duration::from_millis(100));
        executor.schedule(None, || async { Err(Error::Runtime("boom".to_string())) });
        executor.schedule(None, || async { panic!("task panic") });
        executor.schedule(None, record(&log, "after"));
        executor.flush().await;
        assert_eq!(*log.lock(), vec!["after"]);
    }
}
