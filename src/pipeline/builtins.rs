//! Ready-made pipeline stages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::ai::{self, AiBackend, PermissionPolicy, SendMessageRequest};
use crate::error::{ErrorCode, OrchestraResult, PipelineError};

use super::template::Template;
use super::{Item, ItemFilter, MapContext, MapOutput, MapSuccess, Mapper, Reducer};

// ─── FieldFilter ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Condition {
    Equals(Value),
    Contains(String),
    Matches(Regex),
    NonEmpty,
}

/// One predicate over an item field. Dotted names reach into nested objects.
#[derive(Debug, Clone)]
pub struct FilterRule {
    field: String,
    condition: Condition,
}

impl FilterRule {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            condition: Condition::Equals(value.into()),
        }
    }

    /// Substring match on strings, element match on arrays of strings.
    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            condition: Condition::Contains(needle.into()),
        }
    }

    /// Regex match on a string field. An invalid pattern is a config error.
    pub fn matches(field: impl Into<String>, pattern: &str) -> OrchestraResult<Self> {
        let field = field.into();
        let re = Regex::new(pattern).map_err(|e| {
            PipelineError::new(
                ErrorCode::PipelineConfigInvalid,
                format!("Invalid filter pattern for '{field}': {e}"),
            )
            .with_meta("field", field.clone())
        })?;
        Ok(Self {
            field,
            condition: Condition::Matches(re),
        })
    }

    pub fn non_empty(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            condition: Condition::NonEmpty,
        }
    }

    fn lookup<'a>(&self, item: &'a Item) -> Option<&'a Value> {
        let mut parts = self.field.split('.');
        let mut current = item.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    fn evaluate(&self, item: &Item) -> OrchestraResult<bool> {
        let Some(value) = self.lookup(item) else {
            return Ok(false);
        };
        match &self.condition {
            Condition::Equals(expected) => Ok(value == expected),
            Condition::Contains(needle) => match value {
                Value::String(s) => Ok(s.contains(needle.as_str())),
                Value::Array(items) => Ok(items.iter().any(|v| v.as_str() == Some(needle.as_str()))),
                other => Err(self.type_error("a string or array", other)),
            },
            Condition::Matches(re) => match value {
                Value::String(s) => Ok(re.is_match(s)),
                other => Err(self.type_error("a string", other)),
            },
            Condition::NonEmpty => Ok(match value {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            }),
        }
    }

    fn type_error(&self, expected: &str, found: &Value) -> PipelineError {
        PipelineError::new(
            ErrorCode::PipelineFilterFailed,
            format!(
                "Field '{}' must be {expected}, found {}",
                self.field,
                ai::json::json_kind(found)
            ),
        )
        .with_meta("field", self.field.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    All,
    Any,
}

/// Rule-based filter. With no rules every item is kept.
#[derive(Debug, Clone, Default)]
pub struct FieldFilter {
    rules: Vec<FilterRule>,
    mode: FilterMode,
}

impl FieldFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: FilterRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn mode(mut self, mode: FilterMode) -> Self {
        self.mode = mode;
        self
    }
}

#[async_trait]
impl ItemFilter for FieldFilter {
    fn name(&self) -> &str {
        "field-filter"
    }

    async fn keep(&self, item: &Item) -> OrchestraResult<bool> {
        if self.rules.is_empty() {
            return Ok(true);
        }
        match self.mode {
            FilterMode::All => {
                for rule in &self.rules {
                    if !rule.evaluate(item)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FilterMode::Any => {
                for rule in &self.rules {
                    if rule.evaluate(item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

// ─── PromptMapper ───────────────────────────────────────────────────────────

/// Renders a prompt from each item and sends it to an AI backend.
pub struct PromptMapper {
    backend: Arc<dyn AiBackend>,
    template: Template,
    model: Option<String>,
    working_directory: PathBuf,
    timeout: Duration,
    permission_policy: PermissionPolicy,
    parse_json: bool,
}

impl PromptMapper {
    /// Fails with `TEMPLATE_ERROR` if `template` does not parse.
    pub fn new(backend: Arc<dyn AiBackend>, template: &str) -> OrchestraResult<Self> {
        Ok(Self {
            backend,
            template: Template::parse(template)?,
            model: None,
            working_directory: PathBuf::from("."),
            timeout: ai::DEFAULT_TIMEOUT,
            permission_policy: PermissionPolicy::default(),
            parse_json: false,
        })
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

    /// Parse the response as JSON (bare or fenced) instead of returning text.
    pub fn parse_json(mut self, yes: bool) -> Self {
        self.parse_json = yes;
        self
    }
}

#[async_trait]
impl Mapper for PromptMapper {
    fn name(&self) -> &str {
        "prompt-mapper"
    }

    async fn map(&self, item: &Item, ctx: &MapContext) -> OrchestraResult<MapOutput> {
        let prompt = self.template.render(item)?;
        let request = SendMessageRequest::new(prompt)
            .with_model(self.model.as_deref())
            .with_working_directory(self.working_directory.clone())
            .with_timeout(self.timeout)
            .with_permission_policy(self.permission_policy);

        let response = ai::invoke(self.backend.as_ref(), request, &ctx.cancel)
            .await
            .map_err(|e| e.with_meta("itemIndex", ctx.index).with_meta("attempt", ctx.attempt))?;

        let value = if self.parse_json {
            ai::extract_json(&response.response)?
        } else {
            Value::String(response.response)
        };
        Ok(MapOutput::new(value).with_usage(response.token_usage))
    }
}

// ─── Reducers ───────────────────────────────────────────────────────────────

/// Collects map outputs into an array ordered by item index.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectReducer;

#[async_trait]
impl Reducer for CollectReducer {
    fn name(&self) -> &str {
        "collect"
    }

    async fn reduce(&self, results: &[MapSuccess]) -> OrchestraResult<Value> {
        Ok(Value::Array(results.iter().map(|r| r.output.clone()).collect()))
    }
}

/// Concatenates array outputs into one array.
///
/// String outputs are parsed as JSON (bare or fenced) first. An output that
/// is not an array is a reduce failure. With `dedup_by`, later objects whose
/// key field repeats an earlier one are dropped.
#[derive(Debug, Clone, Default)]
pub struct JsonArrayReducer {
    dedup_by: Option<String>,
}

impl JsonArrayReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dedup_by(mut self, field: impl Into<String>) -> Self {
        self.dedup_by = Some(field.into());
        self
    }
}

#[async_trait]
impl Reducer for JsonArrayReducer {
    fn name(&self) -> &str {
        "json-array"
    }

    async fn reduce(&self, results: &[MapSuccess]) -> OrchestraResult<Value> {
        let mut merged: Vec<Value> = Vec::new();
        let mut seen: Vec<Value> = Vec::new();

        for result in results {
            let parsed = match &result.output {
                Value::String(text) => ai::extract_json(text)
                    .map_err(|e| e.with_meta("itemIndex", result.index))?,
                other => other.clone(),
            };
            let Value::Array(elements) = parsed else {
                return Err(PipelineError::new(
                    ErrorCode::MapReduceReduceFailed,
                    format!(
                        "Output of item {} is {}, expected an array",
                        result.index,
                        ai::json::json_kind(&parsed)
                    ),
                )
                .with_meta("itemIndex", result.index));
            };

            for element in elements {
                if let Some(key) = &self.dedup_by {
                    if let Some(k) = element.get(key.as_str()) {
                        if seen.contains(k) {
                            continue;
                        }
                        seen.push(k.clone());
                    }
                }
                merged.push(element);
            }
        }
        Ok(Value::Array(merged))
    }
}
