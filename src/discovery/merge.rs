//! Iterative merge loop.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ai::{self, AiBackend, PermissionPolicy, SendMessageRequest};
use crate::error::{ErrorCode, OrchestraResult, PipelineError};
use crate::pipeline::RetryPolicy;
use crate::usage::{record_shared, Phase, SharedUsageTracker};

use super::graph::{merge_themes, DiscoveryGraph, MergeResult, Theme};
use super::parse::parse_merge_response;

// ─── Scan Sources ───────────────────────────────────────────────────────────

/// Supplies partial discovery scans, one per iteration.
#[async_trait]
pub trait ScanSource: Send {
    /// The next scan text, or `None` once there is nothing left to merge.
    async fn next_scan(
        &mut self,
        graph: &DiscoveryGraph,
        themes: &[Theme],
    ) -> OrchestraResult<Option<String>>;
}

/// Serves a fixed list of scans in order.
#[derive(Debug, Clone, Default)]
pub struct StaticScans {
    scans: VecDeque<String>,
}

impl StaticScans {
    pub fn new<I, S>(scans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scans: scans.into_iter().map(Into::into).collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.scans.len()
    }
}

#[async_trait]
impl ScanSource for StaticScans {
    async fn next_scan(
        &mut self,
        _graph: &DiscoveryGraph,
        _themes: &[Theme],
    ) -> OrchestraResult<Option<String>> {
        Ok(self.scans.pop_front())
    }
}

// ─── Options & Outcome ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub max_iterations: usize,
    pub retry: RetryPolicy,
    pub model: Option<String>,
    pub working_directory: PathBuf,
    pub timeout: Duration,
    pub permission_policy: PermissionPolicy,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            retry: RetryPolicy::default(),
            model: None,
            working_directory: PathBuf::from("."),
            timeout: ai::DEFAULT_TIMEOUT,
            permission_policy: PermissionPolicy::default(),
        }
    }
}

impl MergeOptions {
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_permission_policy(mut self, policy: PermissionPolicy) -> Self {
        self.permission_policy = policy;
        self
    }

    pub fn validate(&self) -> OrchestraResult<()> {
        if self.max_iterations == 0 {
            return Err(PipelineError::new(
                ErrorCode::PipelineConfigInvalid,
                "maxIterations must be at least 1",
            )
            .with_meta("section", "discovery"));
        }
        self.retry.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    Converged,
    MaxIterations,
    ScansExhausted,
}

/// Summary of one merge iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: usize,
    pub converged: bool,
    pub coverage: f64,
    pub reason: String,
    pub components: usize,
    pub new_themes: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Result of the last iteration. Its graph is the final graph.
    pub result: MergeResult,
    pub iterations: usize,
    pub history: Vec<IterationRecord>,
    /// Every theme reported so far, deduplicated.
    pub themes: Vec<Theme>,
    pub stop_reason: StopReason,
}

impl MergeOutcome {
    pub fn graph(&self) -> &DiscoveryGraph {
        &self.result.graph
    }

    pub fn converged(&self) -> bool {
        self.stop_reason == StopReason::Converged
    }
}

// ─── Engine ─────────────────────────────────────────────────────────────────

/// Drives AI merge calls until the backend reports convergence.
///
/// The engine never recomputes `converged` or `coverage`; it trusts the
/// merge step and only decides when to stop asking.
pub struct MergeEngine {
    backend: Arc<dyn AiBackend>,
    options: MergeOptions,
    usage: Option<SharedUsageTracker>,
}

impl MergeEngine {
    pub fn new(backend: Arc<dyn AiBackend>, options: MergeOptions) -> Self {
        Self {
            backend,
            options,
            usage: None,
        }
    }

    /// Record each merge call under [`Phase::Discovery`].
    pub fn with_usage(mut self, tracker: SharedUsageTracker) -> Self {
        self.usage = Some(tracker);
        self
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Merge prompt for one iteration.
    pub fn build_prompt(
        current: &DiscoveryGraph,
        scan: &str,
        themes: &[Theme],
    ) -> OrchestraResult<String> {
        let graph_json = serde_json::to_string_pretty(current).map_err(|e| {
            PipelineError::new(ErrorCode::Unknown, format!("Failed to encode graph: {e}"))
        })?;
        let themes_json = serde_json::to_string_pretty(themes).map_err(|e| {
            PipelineError::new(ErrorCode::Unknown, format!("Failed to encode themes: {e}"))
        })?;

        Ok(format!(
            "You are merging partial discovery scans of a code repository into one graph.\n\
             \n\
             ## Current graph\n```json\n{graph_json}\n```\n\
             \n\
             ## Open themes\n```json\n{themes_json}\n```\n\
             \n\
             ## New scan\n{scan}\n\
             \n\
             Merge the new scan into the current graph. Keep component ids stable, \
             union dependencies, and drop nothing that is still accurate.\n\
             Respond with a single JSON object:\n\
             {{\"graph\": {{\"project\": {{...}}, \"components\": [...], \"categories\": [...], \
             \"architectureNotes\": \"...\"}}, \
             \"newThemes\": [{{\"theme\": \"...\", \"description\": \"...\", \"hints\": [...]}}], \
             \"converged\": true|false, \"coverage\": 0.0-1.0, \"reason\": \"...\"}}\n"
        ))
    }

    /// One merge call with retry, parse, and usage recording.
    pub async fn merge_once(
        &self,
        current: &DiscoveryGraph,
        scan: &str,
        themes: &[Theme],
        iteration: usize,
        cancel: &CancellationToken,
    ) -> OrchestraResult<MergeResult> {
        let prompt = Self::build_prompt(current, scan, themes)?;
        let label = format!("discovery merge {iteration}");

        self.options
            .retry
            .run(&label, cancel, move |attempt| {
                let request = SendMessageRequest::new(prompt.clone())
                    .with_model(self.options.model.as_deref())
                    .with_working_directory(self.options.working_directory.clone())
                    .with_timeout(self.options.timeout)
                    .with_permission_policy(self.options.permission_policy);
                async move {
                    let outcome = ai::invoke(self.backend.as_ref(), request, cancel).await;
                    if let Some(tracker) = &self.usage {
                        match &outcome {
                            Ok(resp) => record_shared(tracker, Phase::Discovery, resp.token_usage.as_ref()),
                            Err(err) if !err.is_cancelled() => {
                                record_shared(tracker, Phase::Discovery, None)
                            }
                            Err(_) => {}
                        }
                    }
                    let response = outcome
                        .map_err(|e| e.with_meta("iteration", iteration).with_meta("attempt", attempt))?;
                    parse_merge_response(&response.response)
                        .map_err(|e| e.with_meta("iteration", iteration))
                }
            })
            .await
    }

    /// Run until convergence, the iteration cap, or the source runs dry.
    ///
    /// With `seed`, the first iteration merges into it; a seed that no
    /// iteration touches marks the discovery phase as served from cache.
    pub async fn run(
        &self,
        seed: Option<DiscoveryGraph>,
        source: &mut dyn ScanSource,
        cancel: &CancellationToken,
    ) -> OrchestraResult<MergeOutcome> {
        self.options.validate()?;
        let reused_seed = seed.is_some();
        let mut graph = seed.unwrap_or_default();
        graph.normalize();

        let mut themes: Vec<Theme> = Vec::new();
        let mut history: Vec<IterationRecord> = Vec::new();
        let mut last: Option<MergeResult> = None;
        let mut stop_reason = StopReason::MaxIterations;

        for iteration in 1..=self.options.max_iterations {
            if cancel.is_cancelled() {
                return Err(PipelineError::cancelled(format!(
                    "Discovery merge cancelled before iteration {iteration}"
                ))
                .with_meta("iteration", iteration));
            }

            let Some(scan) = source.next_scan(&graph, &themes).await? else {
                stop_reason = StopReason::ScansExhausted;
                break;
            };

            let result = self
                .merge_once(&graph, &scan, &themes, iteration, cancel)
                .await?;
            merge_themes(&mut themes, result.new_themes.iter().cloned());
            graph = result.graph.clone();

            history.push(IterationRecord {
                iteration,
                converged: result.converged,
                coverage: result.coverage,
                reason: result.reason.clone(),
                components: result.graph.components.len(),
                new_themes: result.new_themes.len(),
            });
            tracing::info!(
                iteration,
                converged = result.converged,
                coverage = result.coverage,
                components = result.graph.components.len(),
                open_themes = themes.len(),
                "discovery merge iteration"
            );

            let converged = result.converged;
            last = Some(result);
            if converged {
                stop_reason = StopReason::Converged;
                break;
            }
        }

        if history.is_empty() && reused_seed {
            if let Some(tracker) = &self.usage {
                tracker
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .mark_cached(Phase::Discovery);
            }
        }

        let result = last.unwrap_or_else(|| MergeResult {
            graph,
            new_themes: Vec::new(),
            converged: false,
            coverage: 0.0,
            reason: "no scans merged".into(),
        });
        tracing::debug!(?stop_reason, iterations = history.len(), "discovery merge finished");

        Ok(MergeOutcome {
            iterations: history.len(),
            result,
            history,
            themes,
            stop_reason,
        })
    }
}
