//! Priority task queue with a bounded worker pool.
//!
//! Tasks wait in three FIFO lanes (`high`, `normal`, `low`) guarded by a single
//! lock, which is the queue's only dispatch point. Whenever a slot frees up or
//! new work arrives, the oldest task of the highest non-empty priority is moved
//! to `running` and its body is spawned on the Tokio runtime. Running tasks are
//! never preempted.
//!
//! The queue must be driven from inside a Tokio runtime.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use orchestra_core::error::OrchestraResult;
//! use orchestra_core::queue::{NewTask, Priority, QueueOptions, QueuedTask, TaskExecutor, TaskQueue};
//!
//! struct Shout;
//!
//! #[async_trait]
//! impl TaskExecutor for Shout {
//!     type Payload = String;
//!     type Output = String;
//!
//!     async fn execute(&self, task: &QueuedTask<String>, _cancel: CancellationToken) -> OrchestraResult<String> {
//!         Ok(task.payload.to_uppercase())
//!     }
//! }
//!
//! # async fn demo() -> OrchestraResult<()> {
//! let queue = TaskQueue::new(Arc::new(Shout), QueueOptions::default());
//! let id = queue.enqueue(NewTask::new("shout", "hello".to_string()).with_priority(Priority::High))?;
//! let outcome = queue.wait(&id).await?;
//! # Ok(())
//! # }
//! ```

mod lanes;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{meta, ErrorCode, OrchestraResult, PipelineError};

use lanes::Lanes;

// ─── Task Types ─────────────────────────────────────────────────────────────

/// Dispatch priority; `High` always starts before `Normal`, before `Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Task lifecycle. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Allowed forward moves: `queued → running | cancelled`,
    /// `running → completed | failed | cancelled`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Queued, TaskState::Running)
                | (TaskState::Queued, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::Cancelled)
        )
    }
}

/// Work submitted to [`TaskQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct NewTask<P> {
    pub task_type: String,
    pub priority: Priority,
    pub display_name: Option<String>,
    /// Overrides [`QueueOptions::default_timeout`] for this task.
    pub timeout: Option<Duration>,
    pub payload: P,
}

impl<P> NewTask<P> {
    pub fn new(task_type: impl Into<String>, payload: P) -> Self {
        Self {
            task_type: task_type.into(),
            priority: Priority::Normal,
            display_name: None,
            timeout: None,
            payload,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A task as held by the queue.
#[derive(Debug, Clone)]
pub struct QueuedTask<P> {
    pub id: String,
    pub task_type: String,
    pub priority: Priority,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Enqueue order; breaks ties between equal priorities.
    pub sequence: u64,
    pub timeout: Option<Duration>,
    pub payload: P,
}

/// Terminal result of one task.
#[derive(Debug, Clone)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(PipelineError),
    Cancelled,
}

impl<T> TaskOutcome<T> {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            TaskOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_result(self) -> OrchestraResult<T> {
        match self {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::Failed(err) => Err(err),
            TaskOutcome::Cancelled => Err(PipelineError::cancelled("Task was cancelled")),
        }
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone)]
pub struct TaskSnapshot<T> {
    pub id: String,
    pub task_type: String,
    pub priority: Priority,
    pub display_name: Option<String>,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskOutcome<T>>,
}

/// Per-state task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    TaskQueued { id: String, priority: Priority },
    TaskStarted { id: String },
    TaskCompleted { id: String },
    TaskFailed { id: String, code: ErrorCode },
    TaskCancelled { id: String },
    Paused,
    Resumed,
    ShutDown,
}

/// Runs a task body. One executor serves every task of a queue.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Execute `task`. `cancel` fires when the task is withdrawn while running
    /// or its deadline passes.
    async fn execute(
        &self,
        task: &QueuedTask<Self::Payload>,
        cancel: CancellationToken,
    ) -> OrchestraResult<Self::Output>;
}

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_concurrency: usize,
    /// Applied to tasks that carry no timeout of their own.
    pub default_timeout: Option<Duration>,
    /// Start in the paused state.
    pub start_paused: bool,
}

impl QueueOptions {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            ..Self::default()
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn paused(mut self) -> Self {
        self.start_paused = true;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_timeout: None,
            start_paused: false,
        }
    }
}

// ─── Internal State ─────────────────────────────────────────────────────────

struct Record<T> {
    task_type: String,
    priority: Priority,
    display_name: Option<String>,
    state: TaskState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    outcome: Option<TaskOutcome<T>>,
    cancel: Option<CancellationToken>,
}

impl<T: Clone> Record<T> {
    fn snapshot(&self, id: &str) -> TaskSnapshot<T> {
        TaskSnapshot {
            id: id.to_string(),
            task_type: self.task_type.clone(),
            priority: self.priority,
            display_name: self.display_name.clone(),
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: self.outcome.clone(),
        }
    }

    fn settle(&mut self, outcome: TaskOutcome<T>) -> bool {
        let next = outcome.state();
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.finished_at = Some(Utc::now());
        self.outcome = Some(outcome);
        self.cancel = None;
        true
    }
}

struct State<P, T> {
    lanes: Lanes<P>,
    records: HashMap<String, Record<T>>,
    running: usize,
    paused: bool,
    accepting: bool,
    next_sequence: u64,
}

struct Inner<E: TaskExecutor> {
    executor: Arc<E>,
    options: QueueOptions,
    state: Mutex<State<E::Payload, E::Output>>,
    changed: Notify,
    events: Option<mpsc::UnboundedSender<QueueEvent>>,
}

impl<E: TaskExecutor> Inner<E> {
    fn lock(&self) -> MutexGuard<'_, State<E::Payload, E::Output>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Start as many queued tasks as free slots allow.
    fn pump(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = self.lock();
            while !state.paused && state.running < self.options.max_concurrency {
                let Some(task) = state.lanes.pop_next() else {
                    break;
                };
                let token = CancellationToken::new();
                let Some(record) = state.records.get_mut(&task.id) else {
                    continue;
                };
                if !record.state.can_transition_to(TaskState::Running) {
                    continue;
                }
                record.state = TaskState::Running;
                record.started_at = Some(Utc::now());
                record.cancel = Some(token.clone());
                state.running += 1;
                started.push((task, token));
            }
        }

        for (task, token) in started {
            tracing::debug!(
                task_id = %task.id,
                task_type = %task.task_type,
                priority = %task.priority,
                "task started"
            );
            self.emit(QueueEvent::TaskStarted {
                id: task.id.clone(),
            });
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run(task, token).await });
        }
    }

    async fn run(self: Arc<Self>, task: QueuedTask<E::Payload>, token: CancellationToken) {
        let id = task.id.clone();
        let task_type = task.task_type.clone();
        let deadline = task.timeout.or(self.options.default_timeout);

        let executor = Arc::clone(&self.executor);
        let body_token = token.clone();
        let mut body = tokio::spawn(async move { executor.execute(&task, body_token).await });

        let joined = match deadline {
            Some(limit) => match tokio::time::timeout(limit, &mut body).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    token.cancel();
                    body.abort();
                    None
                }
            },
            None => Some((&mut body).await),
        };

        let outcome = match joined {
            None => {
                let limit_ms = deadline.map(|d| d.as_millis() as u64).unwrap_or_default();
                tracing::warn!(task_id = %id, limit_ms, "task timed out");
                TaskOutcome::Failed(
                    PipelineError::new(
                        ErrorCode::QueueTaskTimeout,
                        format!("Task {id} exceeded its {limit_ms}ms deadline"),
                    )
                    .with_meta("taskId", id.clone())
                    .with_meta("taskType", task_type.clone())
                    .with_meta("timeoutMs", limit_ms),
                )
            }
            Some(Ok(Ok(value))) => TaskOutcome::Completed(value),
            Some(Ok(Err(err))) if err.is_cancelled() && token.is_cancelled() => {
                TaskOutcome::Cancelled
            }
            Some(Ok(Err(err))) => {
                tracing::warn!(task_id = %id, code = %err.code(), "task failed: {}", err.message());
                let message = format!("Task {id} failed: {}", err.message());
                let extra = meta([
                    ("taskId", id.clone()),
                    ("taskType", task_type.clone()),
                    ("originalCode", err.code().as_str().to_string()),
                ]);
                TaskOutcome::Failed(err.wrap_as(ErrorCode::QueueTaskFailed, message, extra))
            }
            Some(Err(join_err)) => {
                tracing::warn!(task_id = %id, "task body aborted: {join_err}");
                TaskOutcome::Failed(
                    PipelineError::new(
                        ErrorCode::QueueTaskFailed,
                        format!("Task {id} did not finish: {join_err}"),
                    )
                    .with_meta("taskId", id.clone())
                    .with_meta("taskType", task_type.clone()),
                )
            }
        };

        self.finish(&id, outcome);
    }

    fn finish(self: &Arc<Self>, id: &str, outcome: TaskOutcome<E::Output>) {
        let event = match &outcome {
            TaskOutcome::Completed(_) => QueueEvent::TaskCompleted { id: id.to_string() },
            TaskOutcome::Failed(err) => QueueEvent::TaskFailed {
                id: id.to_string(),
                code: err.code(),
            },
            TaskOutcome::Cancelled => QueueEvent::TaskCancelled { id: id.to_string() },
        };
        {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            if let Some(record) = state.records.get_mut(id) {
                if !record.settle(outcome) {
                    tracing::warn!(task_id = %id, state = ?record.state, "ignored regressing transition");
                }
            }
        }
        self.emit(event);
        self.changed.notify_waiters();
        self.pump();
    }
}

/// Empty the lanes and settle every withdrawn task as cancelled.
fn withdraw_queued<P, T: Clone>(state: &mut State<P, T>) -> Vec<QueuedTask<P>> {
    let drained = state.lanes.drain();
    for task in &drained {
        if let Some(record) = state.records.get_mut(&task.id) {
            record.settle(TaskOutcome::Cancelled);
        }
    }
    drained
}

// ─── TaskQueue ──────────────────────────────────────────────────────────────

/// Handle to a priority queue; cheap to clone.
pub struct TaskQueue<E: TaskExecutor> {
    inner: Arc<Inner<E>>,
}

impl<E: TaskExecutor> Clone for TaskQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: TaskExecutor> TaskQueue<E> {
    pub fn new(executor: Arc<E>, options: QueueOptions) -> Self {
        Self::build(executor, options, None)
    }

    /// Like [`TaskQueue::new`], sending lifecycle events to `events`.
    pub fn with_events(
        executor: Arc<E>,
        options: QueueOptions,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> Self {
        Self::build(executor, options, Some(events))
    }

    fn build(
        executor: Arc<E>,
        mut options: QueueOptions,
        events: Option<mpsc::UnboundedSender<QueueEvent>>,
    ) -> Self {
        options.max_concurrency = options.max_concurrency.max(1);
        let paused = options.start_paused;
        Self {
            inner: Arc::new(Inner {
                executor,
                options,
                state: Mutex::new(State {
                    lanes: Lanes::new(),
                    records: HashMap::new(),
                    running: 0,
                    paused,
                    accepting: true,
                    next_sequence: 0,
                }),
                changed: Notify::new(),
                events,
            }),
        }
    }

    /// Add a task. Fails with `QUEUE_NOT_RUNNING` after [`TaskQueue::shutdown`].
    pub fn enqueue(&self, task: NewTask<E::Payload>) -> OrchestraResult<String> {
        let id = Uuid::new_v4().to_string();
        let priority = task.priority;
        {
            let mut state = self.inner.lock();
            if !state.accepting {
                return Err(PipelineError::new(
                    ErrorCode::QueueNotRunning,
                    "Task queue has been shut down",
                )
                .with_meta("taskType", task.task_type));
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let created_at = Utc::now();

            state.records.insert(
                id.clone(),
                Record {
                    task_type: task.task_type.clone(),
                    priority,
                    display_name: task.display_name.clone(),
                    state: TaskState::Queued,
                    created_at,
                    started_at: None,
                    finished_at: None,
                    outcome: None,
                    cancel: None,
                },
            );
            state.lanes.push(QueuedTask {
                id: id.clone(),
                task_type: task.task_type,
                priority,
                display_name: task.display_name,
                created_at,
                sequence,
                timeout: task.timeout,
                payload: task.payload,
            });
        }

        tracing::debug!(task_id = %id, %priority, "task queued");
        self.inner.emit(QueueEvent::TaskQueued {
            id: id.clone(),
            priority,
        });
        self.inner.pump();
        Ok(id)
    }

    /// Withdraw a task.
    ///
    /// A queued task becomes `cancelled` without ever taking a slot. A running
    /// task has its token cancelled and settles as `cancelled` if its body
    /// returns `CANCELLED`. Returns `false` for unknown or finished tasks.
    pub fn cancel(&self, id: &str) -> bool {
        let withdrawn = {
            let mut state = self.inner.lock();
            let Some(current) = state.records.get(id).map(|r| r.state) else {
                return false;
            };
            match current {
                TaskState::Queued => {
                    state.lanes.remove(id);
                    if let Some(record) = state.records.get_mut(id) {
                        record.settle(TaskOutcome::Cancelled);
                    }
                    true
                }
                TaskState::Running => {
                    if let Some(token) = state.records.get(id).and_then(|r| r.cancel.as_ref()) {
                        token.cancel();
                    }
                    return true;
                }
                _ => return false,
            }
        };

        if withdrawn {
            tracing::debug!(task_id = %id, "queued task cancelled");
            self.inner.emit(QueueEvent::TaskCancelled { id: id.to_string() });
            self.inner.changed.notify_waiters();
        }
        withdrawn
    }

    /// Stop starting new tasks; running tasks finish.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
        tracing::debug!("queue paused");
        self.inner.emit(QueueEvent::Paused);
    }

    pub fn resume(&self) {
        self.inner.lock().paused = false;
        tracing::debug!("queue resumed");
        self.inner.emit(QueueEvent::Resumed);
        self.inner.pump();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Withdraw every queued task. Returns how many were cancelled.
    pub fn clear_queued(&self) -> usize {
        let drained = {
            let mut state = self.inner.lock();
            withdraw_queued(&mut state)
        };
        self.announce_withdrawn(&drained);
        drained.len()
    }

    /// Reject new work and withdraw queued tasks. Running tasks finish.
    ///
    /// Both happen under one lock, so a task finishing concurrently cannot
    /// start anything that was still queued.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.inner.lock();
            state.accepting = false;
            withdraw_queued(&mut state)
        };
        self.announce_withdrawn(&drained);
        tracing::info!(cleared = drained.len(), "queue shut down");
        self.inner.emit(QueueEvent::ShutDown);
    }

    fn announce_withdrawn(&self, drained: &[QueuedTask<E::Payload>]) {
        for task in drained {
            self.inner.emit(QueueEvent::TaskCancelled {
                id: task.id.clone(),
            });
        }
        if !drained.is_empty() {
            self.inner.changed.notify_waiters();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().accepting
    }

    /// Wait for `id` to reach a terminal state.
    pub async fn wait(&self, id: &str) -> OrchestraResult<TaskOutcome<E::Output>> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.lock();
                match state.records.get(id) {
                    None => {
                        return Err(PipelineError::new(
                            ErrorCode::Unknown,
                            format!("Unknown task id: {id}"),
                        ))
                    }
                    Some(record) => {
                        if let Some(outcome) = &record.outcome {
                            return Ok(outcome.clone());
                        }
                    }
                }
            }
            notified.await;
        }
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.lock();
                if state.lanes.is_empty() && state.running == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Remove a finished task's record and return its outcome.
    ///
    /// `None` for unknown ids and for tasks still queued or running. After
    /// this, [`TaskQueue::wait`] on the id fails as unknown.
    pub fn take_outcome(&self, id: &str) -> Option<TaskOutcome<E::Output>> {
        let mut state = self.inner.lock();
        if !state.records.get(id)?.state.is_terminal() {
            return None;
        }
        state.records.remove(id).and_then(|record| record.outcome)
    }

    /// Drop the records of every finished task. Returns how many were removed.
    pub fn forget_finished(&self) -> usize {
        let mut state = self.inner.lock();
        let before = state.records.len();
        state.records.retain(|_, record| !record.state.is_terminal());
        let removed = before - state.records.len();
        tracing::debug!(removed, "finished task records dropped");
        removed
    }

    /// Number of task records held, finished ones included.
    pub fn record_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn get(&self, id: &str) -> Option<TaskSnapshot<E::Output>> {
        self.inner.lock().records.get(id).map(|r| r.snapshot(id))
    }

    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.inner.lock().records.get(id).map(|r| r.state)
    }

    /// Ids of queued tasks, in the order they would start.
    pub fn queued_ids(&self) -> Vec<String> {
        self.inner.lock().lanes.ids()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        let mut stats = QueueStats::default();
        for record in state.records.values() {
            match record.state {
                TaskState::Queued => stats.queued += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.options.max_concurrency
    }
}
