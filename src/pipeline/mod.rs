//! Four-phase map-reduce pipeline: input → filter → map → reduce.
//!
//! Input, filter, and reduce failures are fatal. Map failures are per item:
//! under [`MapFailurePolicy::CollectPartial`] the reduce still runs over the
//! surviving results and failed items are reported alongside them.
//!
//! The map phase runs on a [`crate::queue::TaskQueue`], so at most
//! `max_concurrency` items are in flight. Each item's retries happen inside
//! its own queue slot.

pub mod builtins;
pub mod executor;
pub mod retry;
pub mod template;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::ai::json::json_kind;
use crate::error::{ErrorCode, OrchestraResult, PipelineError};
use crate::queue::Priority;
use crate::usage::{Phase, TokenUsage};

pub use builtins::{CollectReducer, FieldFilter, FilterMode, FilterRule, JsonArrayReducer, PromptMapper};
pub use executor::Pipeline;
pub use retry::RetryPolicy;
pub use template::Template;

/// A work item: one JSON object.
pub type Item = Map<String, Value>;

// ─── Phases & Policy ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    Input,
    Filter,
    Map,
    Reduce,
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelinePhase::Input => "input",
            PipelinePhase::Filter => "filter",
            PipelinePhase::Map => "map",
            PipelinePhase::Reduce => "reduce",
        };
        f.write_str(s)
    }
}

/// What an exhausted map item does to the rest of the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MapFailurePolicy {
    /// Keep going; reduce over the survivors and report failed items.
    #[default]
    CollectPartial,
    /// Stop the map phase and fail the pipeline with the first item error.
    AbortOnFirst,
}

// ─── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub name: String,
    pub max_concurrency: usize,
    /// Deadline for one map attempt. Exceeding it is a retryable `TIMEOUT`.
    pub attempt_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub failure_policy: MapFailurePolicy,
    pub priority: Priority,
    /// Usage phase that map calls are recorded under.
    pub usage_phase: Phase,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            name: "pipeline".into(),
            max_concurrency: 4,
            attempt_timeout: None,
            retry: RetryPolicy::default(),
            failure_policy: MapFailurePolicy::CollectPartial,
            priority: Priority::Normal,
            usage_phase: Phase::Analysis,
        }
    }
}

impl PipelineOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, policy: MapFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_usage_phase(mut self, phase: Phase) -> Self {
        self.usage_phase = phase;
        self
    }

    /// `PIPELINE_CONFIG_INVALID` on bad options.
    pub fn validate(&self) -> OrchestraResult<()> {
        let invalid = |message: String| {
            PipelineError::new(ErrorCode::PipelineConfigInvalid, message)
                .with_meta("pipeline", self.name.clone())
                .with_meta("phase", PipelinePhase::Input.to_string())
        };
        if self.name.trim().is_empty() {
            return Err(invalid("Pipeline name must not be empty".into()));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("maxConcurrency must be at least 1".into()));
        }
        if self.attempt_timeout == Some(Duration::ZERO) {
            return Err(invalid("attemptTimeout must be positive".into()));
        }
        self.retry
            .validate()
            .map_err(|e| e.with_meta("pipeline", self.name.clone()))
    }
}

/// Check the batch shape: non-empty, every element an object.
pub fn validate_items(items: Vec<Value>) -> OrchestraResult<Vec<Item>> {
    if items.is_empty() {
        return Err(PipelineError::new(
            ErrorCode::PipelineInputInvalid,
            "Pipeline input contains no items",
        )
        .with_meta("phase", "input"));
    }
    items
        .into_iter()
        .enumerate()
        .map(|(index, value)| match value {
            Value::Object(map) => Ok(map),
            other => Err(PipelineError::new(
                ErrorCode::PipelineInputInvalid,
                format!("Item {index} must be an object, found {}", json_kind(&other)),
            )
            .with_meta("phase", "input")
            .with_meta("itemIndex", index)),
        })
        .collect()
}

// ─── Stage Traits ───────────────────────────────────────────────────────────

/// Per-attempt context handed to a [`Mapper`].
#[derive(Debug, Clone)]
pub struct MapContext {
    /// Position of the item in the input batch.
    pub index: usize,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// One successful map attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct MapOutput {
    pub value: Value,
    pub usage: Option<TokenUsage>,
}

impl MapOutput {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }
}

#[async_trait]
pub trait ItemFilter: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(false)` drops the item. An error fails the pipeline.
    async fn keep(&self, item: &Item) -> OrchestraResult<bool>;
}

#[async_trait]
pub trait Mapper: Send + Sync {
    fn name(&self) -> &str;

    /// Process one item. Retryable error codes are retried by the executor.
    async fn map(&self, item: &Item, ctx: &MapContext) -> OrchestraResult<MapOutput>;
}

#[async_trait]
pub trait Reducer: Send + Sync {
    fn name(&self) -> &str;

    /// Fold the surviving map results, ordered by item index.
    async fn reduce(&self, results: &[MapSuccess]) -> OrchestraResult<Value>;
}

// ─── Results & Events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MapSuccess {
    pub index: usize,
    pub item: Item,
    pub output: Value,
}

/// An item that exhausted its attempts. `error` is `MAP_REDUCE_MAP_FAILED`.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub index: usize,
    pub item: Item,
    pub error: PipelineError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub total_items: usize,
    pub filtered_out: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub output: Value,
    pub successes: Vec<MapSuccess>,
    pub failures: Vec<ItemFailure>,
    pub stats: PipelineStats,
}

impl PipelineResult {
    /// True when at least one item failed but the pipeline still produced output.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

/// Progress notifications. None are sent once cancellation is observed.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    PhaseStarted {
        phase: PipelinePhase,
    },
    ItemCompleted {
        index: usize,
        attempts: u32,
    },
    ItemFailed {
        index: usize,
        code: ErrorCode,
    },
    Progress {
        completed: usize,
        failed: usize,
        total: usize,
    },
    PhaseCompleted {
        phase: PipelinePhase,
    },
}
