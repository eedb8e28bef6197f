//! Runtime configuration.
//!
//! Every field has a default, so an empty document is a valid config.
//!
//! ```yaml
//! queue:
//!   maxConcurrency: 8
//!   taskTimeoutMs: 300000
//! retry:
//!   maxAttempts: 4
//!   initialBackoffMs: 250
//! ai:
//!   model: sonnet
//!   permissionPolicy: deny-all
//! discovery:
//!   maxIterations: 6
//! pipeline:
//!   failurePolicy: abort-on-first
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ai::PermissionPolicy;
use crate::discovery::MergeOptions;
use crate::error::{ErrorCode, OrchestraResult, PipelineError};
use crate::pipeline::{MapFailurePolicy, PipelineOptions, RetryPolicy};
use crate::queue::QueueOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub max_concurrency: usize,
    pub task_timeout_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            task_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiConfig {
    pub model: Option<String>,
    pub timeout_ms: u64,
    pub working_directory: PathBuf,
    pub permission_policy: PermissionPolicy,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: None,
            timeout_ms: crate::ai::DEFAULT_TIMEOUT.as_millis() as u64,
            working_directory: PathBuf::from("."),
            permission_policy: PermissionPolicy::AllowAll,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    pub max_iterations: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub failure_policy: MapFailurePolicy,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestraConfig {
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub ai: AiConfig,
    pub discovery: DiscoveryConfig,
    pub pipeline: PipelineConfig,
}

fn invalid(section: &str, message: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorCode::PipelineConfigInvalid, message).with_meta("section", section)
}

impl OrchestraConfig {
    pub fn from_yaml_str(text: &str) -> OrchestraResult<Self> {
        let config: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| {
                PipelineError::new(ErrorCode::PipelineConfigInvalid, format!("Invalid YAML config: {e}"))
                    .with_meta("format", "yaml")
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> OrchestraResult<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| {
            PipelineError::new(ErrorCode::PipelineConfigInvalid, format!("Invalid JSON config: {e}"))
                .with_meta("format", "json")
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from disk. `.json` files are read as JSON, anything else as YAML.
    ///
    /// I/O failures map through the error model (`FILE_NOT_FOUND`,
    /// `PERMISSION_DENIED`, ...).
    pub async fn load(path: impl AsRef<Path>) -> OrchestraResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            PipelineError::from_io(e).with_meta("path", path.display().to_string())
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let parsed = if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        };
        let config = parsed.map_err(|e| e.with_meta("path", path.display().to_string()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn to_yaml(&self) -> OrchestraResult<String> {
        serde_yaml::to_string(self).map_err(|e| {
            PipelineError::new(ErrorCode::Unknown, format!("Failed to encode config: {e}"))
        })
    }

    pub fn validate(&self) -> OrchestraResult<()> {
        if self.queue.max_concurrency == 0 {
            return Err(invalid("queue", "queue.maxConcurrency must be at least 1"));
        }
        if self.queue.task_timeout_ms == Some(0) {
            return Err(invalid("queue", "queue.taskTimeoutMs must be positive"));
        }
        if self.ai.timeout_ms == 0 {
            return Err(invalid("ai", "ai.timeoutMs must be positive"));
        }
        if self.discovery.max_iterations == 0 {
            return Err(invalid("discovery", "discovery.maxIterations must be at least 1"));
        }
        self.retry.validate()
    }

    pub fn queue_options(&self) -> QueueOptions {
        let options = QueueOptions::new(self.queue.max_concurrency);
        match self.queue.task_timeout_ms {
            Some(ms) => options.with_default_timeout(Duration::from_millis(ms)),
            None => options,
        }
    }

    pub fn pipeline_options(&self, name: impl Into<String>) -> PipelineOptions {
        PipelineOptions::new(name)
            .with_concurrency(self.queue.max_concurrency)
            .with_retry(self.retry.clone())
            .with_failure_policy(self.pipeline.failure_policy)
    }

    pub fn merge_options(&self) -> MergeOptions {
        let options = MergeOptions::default()
            .with_max_iterations(self.discovery.max_iterations)
            .with_retry(self.retry.clone())
            .with_working_directory(self.ai.working_directory.clone())
            .with_timeout(Duration::from_millis(self.ai.timeout_ms))
            .with_permission_policy(self.ai.permission_policy);
        match &self.ai.model {
            Some(model) => options.with_model(model.clone()),
            None => options,
        }
    }
}
