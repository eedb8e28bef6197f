//! Pipeline driver.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, OrchestraResult, PipelineError};
use crate::queue::{NewTask, QueueOptions, QueuedTask, TaskExecutor, TaskOutcome, TaskQueue};
use crate::usage::{record_shared, Phase, SharedUsageTracker};

use super::builtins::CollectReducer;
use super::retry::RetryPolicy;
use super::{
    validate_items, Item, ItemFailure, ItemFilter, MapContext, MapFailurePolicy, MapOutput,
    MapSuccess, Mapper, PipelineEvent, PipelineOptions, PipelinePhase, PipelineResult,
    PipelineStats, Reducer,
};

// ─── Event Sink ─────────────────────────────────────────────────────────────

/// Sends events until the pipeline's token fires, then goes silent.
#[derive(Clone)]
struct EventSink {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
    cancel: CancellationToken,
}

impl EventSink {
    fn emit(&self, event: PipelineEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

// ─── Map Task Executor ──────────────────────────────────────────────────────

/// Queue payload for one map item.
struct MapJob {
    index: usize,
    item: Item,
}

struct MapCounters {
    completed: AtomicUsize,
    failed: AtomicUsize,
    total: usize,
}

/// Runs one item's attempts inside a single queue slot.
struct MapTaskExecutor {
    pipeline: String,
    mapper: Arc<dyn Mapper>,
    retry: RetryPolicy,
    attempt_timeout: Option<std::time::Duration>,
    policy: MapFailurePolicy,
    /// Child of the pipeline token; also fired on abort-on-first.
    stop: CancellationToken,
    abort_cause: Mutex<Option<PipelineError>>,
    events: EventSink,
    usage: Option<(SharedUsageTracker, Phase)>,
    counters: MapCounters,
}

impl MapTaskExecutor {
    async fn attempt(&self, job: &MapJob, attempt: u32) -> OrchestraResult<MapOutput> {
        let ctx = MapContext {
            index: job.index,
            attempt,
            cancel: self.stop.clone(),
        };
        let call = self.mapper.map(&job.item, &ctx);
        let result = match self.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    let limit_ms = limit.as_millis() as u64;
                    Err(PipelineError::timeout(format!(
                        "Map attempt {attempt} for item {} exceeded {limit_ms}ms",
                        job.index
                    ))
                    .with_meta("timeoutMs", limit_ms))
                }
            },
            None => call.await,
        };

        if let Some((tracker, phase)) = &self.usage {
            match &result {
                Ok(output) => record_shared(tracker, *phase, output.usage.as_ref()),
                Err(err) if !err.is_cancelled() => record_shared(tracker, *phase, None),
                Err(_) => {}
            }
        }
        result
    }

    fn progress(&self) {
        self.events.emit(PipelineEvent::Progress {
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            total: self.counters.total,
        });
    }
}

#[async_trait]
impl TaskExecutor for MapTaskExecutor {
    type Payload = MapJob;
    type Output = (MapOutput, u32);

    async fn execute(
        &self,
        task: &QueuedTask<MapJob>,
        cancel: CancellationToken,
    ) -> OrchestraResult<(MapOutput, u32)> {
        let job = &task.payload;
        let label = format!("{} item {}", self.pipeline, job.index);
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;

        let run = self.retry.run(&label, &self.stop, move |attempt| {
            counter.store(attempt as usize, Ordering::SeqCst);
            self.attempt(job, attempt)
        });
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::cancelled(format!("{label} withdrawn"))),
            result = run => result,
        };
        let attempts = attempts.load(Ordering::SeqCst) as u32;

        match result {
            Ok(output) => {
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
                self.events.emit(PipelineEvent::ItemCompleted {
                    index: job.index,
                    attempts,
                });
                self.progress();
                Ok((output, attempts))
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                let message = format!("Map failed for item {}: {}", job.index, err.message());
                let failure = err
                    .wrap_as(ErrorCode::MapReduceMapFailed, message, BTreeMap::new())
                    .with_meta("phase", PipelinePhase::Map.to_string())
                    .with_meta("itemIndex", job.index)
                    .with_meta("attempt", attempts);
                tracing::warn!(
                    pipeline = %self.pipeline,
                    item = job.index,
                    attempts,
                    "map item failed: {}",
                    failure.cause_chain_message()
                );

                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                self.events.emit(PipelineEvent::ItemFailed {
                    index: job.index,
                    code: failure.code(),
                });
                self.progress();

                if self.policy == MapFailurePolicy::AbortOnFirst {
                    let mut cause = self
                        .abort_cause
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if cause.is_none() {
                        *cause = Some(failure.clone());
                        self.stop.cancel();
                    }
                }
                Err(failure)
            }
        }
    }
}

/// Peel the queue's `QUEUE_TASK_FAILED` wrapper off an item error.
fn item_error(err: PipelineError) -> PipelineError {
    match err.code() {
        ErrorCode::QueueTaskFailed => err.inner().cloned().unwrap_or(err),
        ErrorCode::QueueTaskTimeout => {
            let message = err.message().to_string();
            err.wrap_as(ErrorCode::MapReduceMapFailed, message, BTreeMap::new())
        }
        _ => err,
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// A configured map-reduce pipeline. Reusable across runs.
pub struct Pipeline {
    options: PipelineOptions,
    filter: Option<Arc<dyn ItemFilter>>,
    mapper: Arc<dyn Mapper>,
    reducer: Arc<dyn Reducer>,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
    usage: Option<SharedUsageTracker>,
}

impl Pipeline {
    /// A pipeline with no filter and a [`CollectReducer`].
    pub fn new(mapper: Arc<dyn Mapper>) -> Self {
        Self {
            options: PipelineOptions::default(),
            filter: None,
            mapper,
            reducer: Arc::new(CollectReducer),
            events: None,
            usage: None,
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn ItemFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_reducer(mut self, reducer: Arc<dyn Reducer>) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Record every map attempt under `options.usage_phase`.
    pub fn with_usage(mut self, tracker: SharedUsageTracker) -> Self {
        self.usage = Some(tracker);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run all four phases over `items`.
    ///
    /// Returns `CANCELLED` if `cancel` fires at any point; no further events
    /// are emitted once it has.
    pub async fn run(
        &self,
        items: Vec<Value>,
        cancel: CancellationToken,
    ) -> OrchestraResult<PipelineResult> {
        let started = Instant::now();
        let name = self.options.name.clone();
        let sink = EventSink {
            tx: self.events.clone(),
            cancel: cancel.clone(),
        };

        // Input
        self.checkpoint(&cancel, PipelinePhase::Input)?;
        sink.emit(PipelineEvent::PhaseStarted {
            phase: PipelinePhase::Input,
        });
        self.options.validate()?;
        let items = validate_items(items)?;
        let total_items = items.len();
        tracing::info!(pipeline = %name, items = total_items, "pipeline started");
        sink.emit(PipelineEvent::PhaseCompleted {
            phase: PipelinePhase::Input,
        });

        // Filter
        let mut kept = Vec::with_capacity(items.len());
        let mut filtered_out = 0;
        if let Some(filter) = &self.filter {
            sink.emit(PipelineEvent::PhaseStarted {
                phase: PipelinePhase::Filter,
            });
            for (index, item) in items.into_iter().enumerate() {
                self.checkpoint(&cancel, PipelinePhase::Filter)?;
                match filter.keep(&item).await {
                    Ok(true) => kept.push((index, item)),
                    Ok(false) => filtered_out += 1,
                    Err(err) => {
                        let message = format!(
                            "Filter '{}' failed on item {index}: {}",
                            filter.name(),
                            err.message()
                        );
                        let err = if err.has_code(ErrorCode::PipelineFilterFailed) {
                            err.wrap(message, BTreeMap::new())
                        } else {
                            err.wrap_as(ErrorCode::PipelineFilterFailed, message, BTreeMap::new())
                        };
                        return Err(err
                            .with_meta("phase", PipelinePhase::Filter.to_string())
                            .with_meta("itemIndex", index));
                    }
                }
            }
            tracing::debug!(pipeline = %name, kept = kept.len(), filtered_out, "filter phase done");
            sink.emit(PipelineEvent::PhaseCompleted {
                phase: PipelinePhase::Filter,
            });
        } else {
            kept.extend(items.into_iter().enumerate());
        }

        // Map
        self.checkpoint(&cancel, PipelinePhase::Map)?;
        sink.emit(PipelineEvent::PhaseStarted {
            phase: PipelinePhase::Map,
        });
        let (successes, failures) = self.map_phase(kept, &cancel, &sink).await?;
        sink.emit(PipelineEvent::PhaseCompleted {
            phase: PipelinePhase::Map,
        });

        // Reduce
        self.checkpoint(&cancel, PipelinePhase::Reduce)?;
        sink.emit(PipelineEvent::PhaseStarted {
            phase: PipelinePhase::Reduce,
        });
        let output = self.reducer.reduce(&successes).await.map_err(|err| {
            let message = format!("Reducer '{}' failed: {}", self.reducer.name(), err.message());
            err.wrap_as(ErrorCode::MapReduceReduceFailed, message, BTreeMap::new())
                .with_meta("phase", PipelinePhase::Reduce.to_string())
                .with_meta("pipeline", name.clone())
        })?;
        self.checkpoint(&cancel, PipelinePhase::Reduce)?;
        sink.emit(PipelineEvent::PhaseCompleted {
            phase: PipelinePhase::Reduce,
        });

        let stats = PipelineStats {
            total_items,
            filtered_out,
            succeeded: successes.len(),
            failed: failures.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            pipeline = %name,
            succeeded = stats.succeeded,
            failed = stats.failed,
            elapsed_ms = stats.elapsed_ms,
            "pipeline finished"
        );
        Ok(PipelineResult {
            output,
            successes,
            failures,
            stats,
        })
    }

    fn checkpoint(&self, cancel: &CancellationToken, phase: PipelinePhase) -> OrchestraResult<()> {
        if cancel.is_cancelled() {
            tracing::debug!(pipeline = %self.options.name, %phase, "pipeline cancelled");
            return Err(PipelineError::cancelled(format!(
                "Pipeline '{}' cancelled during {phase} phase",
                self.options.name
            ))
            .with_meta("phase", phase.to_string()));
        }
        Ok(())
    }

    async fn map_phase(
        &self,
        kept: Vec<(usize, Item)>,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> OrchestraResult<(Vec<MapSuccess>, Vec<ItemFailure>)> {
        let stop = cancel.child_token();
        let executor = Arc::new(MapTaskExecutor {
            pipeline: self.options.name.clone(),
            mapper: Arc::clone(&self.mapper),
            retry: self.options.retry.clone(),
            attempt_timeout: self.options.attempt_timeout,
            policy: self.options.failure_policy,
            stop: stop.clone(),
            abort_cause: Mutex::new(None),
            events: sink.clone(),
            usage: self
                .usage
                .as_ref()
                .map(|tracker| (Arc::clone(tracker), self.options.usage_phase)),
            counters: MapCounters {
                completed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                total: kept.len(),
            },
        });
        let queue = TaskQueue::new(
            Arc::clone(&executor),
            QueueOptions::new(self.options.max_concurrency),
        );

        let mut pending = Vec::with_capacity(kept.len());
        for (index, item) in kept {
            let id = queue.enqueue(
                NewTask::new(
                    "map",
                    MapJob {
                        index,
                        item: item.clone(),
                    },
                )
                .with_priority(self.options.priority)
                .with_display_name(format!("{}#{index}", self.options.name)),
            )?;
            pending.push((index, item, id));
        }

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                let withdrawn = pending.iter().filter(|(_, _, id)| queue.cancel(id)).count();
                tracing::debug!(pipeline = %self.options.name, withdrawn, "map phase stopping");
            }
            _ = queue.wait_idle() => {}
        }
        queue.wait_idle().await;
        queue.shutdown();

        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled(format!(
                "Pipeline '{}' cancelled during map phase",
                self.options.name
            ))
            .with_meta("phase", PipelinePhase::Map.to_string()));
        }
        let aborted = executor
            .abort_cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(cause) = aborted {
            return Err(cause.with_meta("pipeline", self.options.name.clone()));
        }

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        // The queue is idle, so every record is terminal.
        for (index, item, id) in pending {
            match queue.take_outcome(&id) {
                Some(TaskOutcome::Completed((output, _attempts))) => successes.push(MapSuccess {
                    index,
                    item,
                    output: output.value,
                }),
                Some(TaskOutcome::Failed(err)) => {
                    let error = item_error(err);
                    if !error.is_cancelled() {
                        failures.push(ItemFailure { index, item, error });
                    }
                }
                Some(TaskOutcome::Cancelled) | None => {}
            }
        }
        Ok((successes, failures))
    }
}
