//! C3 — Hydration queue: a single-worker FIFO queue around the backfill
//! executor, so concurrent `/api/symbol/hydrate` requests don't pile up
//! concurrent exchange fetches for the same symbol.
//!
//! Grounded in the original's `SymbolHydrateQueue`: one worker thread
//! draining a FIFO, a `RunningGuard` RAII type that keeps the running
//! counter and the idle notification in sync, and a swappable executor
//! so tests can replace the real backfill call with an instant stub.

use crate::error::AppError;
use crate::symbol::canonical_minutes;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: u64,
    pub symbol: String,
    pub tf_minutes: i64,
    pub months: i64,
    pub state: TaskState,
    pub enqueued_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueMetrics {
    pub enqueued_total: u64,
    pub running: u64,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub queue_length: u64,
}

/// The work a queued task performs, swappable so tests don't hit the
/// network or the real filesystem-backed backfill executor.
#[async_trait]
pub trait HydrationExecutor: Send + Sync {
    async fn run(&self, symbol: &str, tf_minutes: i64, months: i64) -> Result<serde_json::Value, AppError>;
}

struct Inner {
    pending: VecDeque<u64>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
}

/// Production executor: runs the real backfill against the real
/// exchange client. The only `HydrationExecutor` wired up outside of
/// tests.
pub struct BackfillExecutor {
    pub config: Arc<crate::config::Config>,
    pub exchange: Arc<dyn crate::exchange::ExchangeClient>,
}

#[async_trait]
impl HydrationExecutor for BackfillExecutor {
    async fn run(&self, symbol: &str, tf_minutes: i64, months: i64) -> Result<serde_json::Value, AppError> {
        let stats = crate::backfill::backfill(&self.config, &*self.exchange, symbol, tf_minutes, months).await?;
        Ok(serde_json::to_value(&stats).expect("BackfillStats always serializes"))
    }
}

pub struct HydrationQueue {
    inner: Arc<Mutex<Inner>>,
    executor: Arc<RwLock<Arc<dyn HydrationExecutor>>>,
    work_available: Arc<Notify>,
    idle_notify: Arc<Notify>,
    running: Arc<AtomicU64>,
    enqueued_total: Arc<AtomicU64>,
    succeeded_total: Arc<AtomicU64>,
    failed_total: Arc<AtomicU64>,
}

/// Decrements the running counter and wakes idle waiters when dropped,
/// regardless of which path out of the worker loop body we take.
struct RunningGuard {
    running: Arc<AtomicU64>,
    idle_notify: Arc<Notify>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.idle_notify.notify_waiters();
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl HydrationQueue {
    pub fn new(executor: Arc<dyn HydrationExecutor>) -> Arc<Self> {
        let queue = Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: VecDeque::new(),
                tasks: HashMap::new(),
                next_id: 1,
            })),
            executor: Arc::new(RwLock::new(executor)),
            work_available: Arc::new(Notify::new()),
            idle_notify: Arc::new(Notify::new()),
            running: Arc::new(AtomicU64::new(0)),
            enqueued_total: Arc::new(AtomicU64::new(0)),
            succeeded_total: Arc::new(AtomicU64::new(0)),
            failed_total: Arc::new(AtomicU64::new(0)),
        });
        queue.clone().spawn_worker();
        queue
    }

    fn spawn_worker(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let next_id = {
                    let mut inner = self.inner.lock().await;
                    inner.pending.pop_front()
                };
                let Some(id) = next_id else {
                    self.work_available.notified().await;
                    continue;
                };
                self.run_one(id).await;
            }
        });
    }

    async fn run_one(&self, id: u64) {
        self.running.fetch_add(1, Ordering::SeqCst);
        let _guard = RunningGuard {
            running: self.running.clone(),
            idle_notify: self.idle_notify.clone(),
        };

        let (symbol, tf_minutes, months) = {
            let mut inner = self.inner.lock().await;
            let task = inner.tasks.get_mut(&id).expect("task must exist once dequeued");
            task.state = TaskState::Running;
            task.started_at_ms = Some(now_ms());
            (task.symbol.clone(), task.tf_minutes, task.months)
        };

        let executor = self.executor.read().await.clone();
        let outcome = executor.run(&symbol, tf_minutes, months).await;

        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(&id).expect("task must exist once dequeued");
        task.finished_at_ms = Some(now_ms());
        match outcome {
            Ok(result) => {
                task.state = TaskState::Done;
                task.result = Some(result);
                self.succeeded_total.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                task.state = TaskState::Failed;
                task.error = Some(e.to_string());
                self.failed_total.fetch_add(1, Ordering::SeqCst);
            }
        }
        if inner.pending.is_empty() {
            drop(inner);
            self.idle_notify.notify_waiters();
        }
    }

    /// Enqueue a hydration task. An unrecognized interval fails fast: a
    /// task row is still created, already in the `Failed` state, rather
    /// than rejecting the call outright — callers always get a task id
    /// back to poll.
    pub async fn enqueue(&self, symbol: &str, interval: &str, months: i64) -> Task {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;

        let tf_minutes = canonical_minutes(interval);
        let task = match tf_minutes {
            Some(tf) => Task {
                id,
                symbol: symbol.to_string(),
                tf_minutes: tf,
                months,
                state: TaskState::Queued,
                enqueued_at_ms: now_ms(),
                started_at_ms: None,
                finished_at_ms: None,
                error: None,
                result: None,
            },
            None => Task {
                id,
                symbol: symbol.to_string(),
                tf_minutes: 0,
                months,
                state: TaskState::Failed,
                enqueued_at_ms: now_ms(),
                started_at_ms: None,
                finished_at_ms: Some(now_ms()),
                error: Some("invalid_interval".to_string()),
                result: None,
            },
        };

        let queued = task.state == TaskState::Queued;
        inner.tasks.insert(id, task.clone());
        if queued {
            inner.pending.push_back(id);
        }
        drop(inner);

        self.enqueued_total.fetch_add(1, Ordering::SeqCst);
        if queued {
            self.work_available.notify_one();
        }
        task
    }

    pub async fn task(&self, id: u64) -> Option<Task> {
        self.inner.lock().await.tasks.get(&id).cloned()
    }

    /// Most recently enqueued task for a given symbol/timeframe, if any.
    pub async fn status(&self, symbol: &str, tf_minutes: i64) -> Option<Task> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .values()
            .filter(|t| t.symbol == symbol && t.tf_minutes == tf_minutes)
            .max_by_key(|t| t.id)
            .cloned()
    }

    /// All tasks matching an optional symbol and/or timeframe filter,
    /// most recently enqueued first. Either filter absent matches every
    /// task on that dimension.
    pub async fn tasks_matching(&self, symbol: Option<&str>, tf_minutes: Option<i64>) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| symbol.map_or(true, |s| t.symbol == s))
            .filter(|t| tf_minutes.map_or(true, |tf| t.tf_minutes == tf))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.id));
        tasks
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let inner = self.inner.lock().await;
        QueueMetrics {
            enqueued_total: self.enqueued_total.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            succeeded_total: self.succeeded_total.load(Ordering::SeqCst),
            failed_total: self.failed_total.load(Ordering::SeqCst),
            queue_length: inner.pending.len() as u64,
        }
    }

    /// Block until the queue has drained: no pending tasks and no
    /// worker currently running one. Used by tests; production callers
    /// poll `task`/`status` instead.
    pub async fn wait_for_idle(&self) {
        loop {
            let idle = {
                let inner = self.inner.lock().await;
                inner.pending.is_empty() && self.running.load(Ordering::SeqCst) == 0
            };
            if idle {
                return;
            }
            self.idle_notify.notified().await;
        }
    }

    pub async fn set_executor(&self, executor: Arc<dyn HydrationExecutor>) {
        *self.executor.write().await = executor;
    }

    #[cfg(test)]
    pub async fn clear_for_tests(&self) {
        let mut inner = self.inner.lock().await;
        inner.pending.clear();
        inner.tasks.clear();
        inner.next_id = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    struct InstantExecutor {
        calls: TokioMutex<Vec<String>>,
    }

    #[async_trait]
    impl HydrationExecutor for InstantExecutor {
        async fn run(&self, symbol: &str, tf_minutes: i64, _months: i64) -> Result<serde_json::Value, AppError> {
            self.calls.lock().await.push(format!("{symbol}:{tf_minutes}"));
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl HydrationExecutor for FailingExecutor {
        async fn run(&self, _symbol: &str, _tf_minutes: i64, _months: i64) -> Result<serde_json::Value, AppError> {
            Err(AppError::UpstreamTransient("nope".into()))
        }
    }

    #[tokio::test]
    async fn invalid_interval_fails_fast_without_running_worker() {
        let exec = Arc::new(InstantExecutor { calls: TokioMutex::new(vec![]) });
        let queue = HydrationQueue::new(exec);
        let task = queue.enqueue("BTCUSDT", "bogus", 1).await;
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_deref(), Some("invalid_interval"));
    }

    #[tokio::test]
    async fn processes_tasks_fifo_and_reaches_idle() {
        let exec = Arc::new(InstantExecutor { calls: TokioMutex::new(vec![]) });
        let queue = HydrationQueue::new(exec.clone());

        let t1 = queue.enqueue("BTCUSDT", "15", 1).await;
        let t2 = queue.enqueue("ETHUSDT", "60", 1).await;
        queue.wait_for_idle().await;

        let t1_final = queue.task(t1.id).await.unwrap();
        let t2_final = queue.task(t2.id).await.unwrap();
        assert_eq!(t1_final.state, TaskState::Done);
        assert_eq!(t2_final.state, TaskState::Done);

        let calls = exec.calls.lock().await;
        assert_eq!(calls.as_slice(), ["BTCUSDT:15", "ETHUSDT:60"]);
    }

    #[tokio::test]
    async fn failed_executor_marks_task_failed_and_updates_metrics() {
        let queue = HydrationQueue::new(Arc::new(FailingExecutor));
        queue.enqueue("BTCUSDT", "15", 1).await;
        queue.wait_for_idle().await;

        let metrics = queue.metrics().await;
        assert_eq!(metrics.failed_total, 1);
        assert_eq!(metrics.succeeded_total, 0);
        assert_eq!(metrics.queue_length, 0);
        assert_eq!(metrics.running, 0);
    }

    #[tokio::test]
    async fn set_executor_swaps_behavior_for_subsequent_tasks() {
        let exec = Arc::new(InstantExecutor { calls: TokioMutex::new(vec![]) });
        let queue = HydrationQueue::new(exec);
        queue.set_executor(Arc::new(FailingExecutor)).await;

        let task = queue.enqueue("BTCUSDT", "15", 1).await;
        queue.wait_for_idle().await;
        let finished = queue.task(task.id).await.unwrap();
        assert_eq!(finished.state, TaskState::Failed);
    }
}
