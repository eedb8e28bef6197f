use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Maximum number of nested causes walked when flattening a chain.
pub const MAX_CAUSE_DEPTH: usize = 5;

// ─── Error Codes ────────────────────────────────────────────────────────────

/// Closed set of machine-checkable failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Control flow
    Cancelled,
    Timeout,
    RetryExhausted,

    // AI operations
    AiInvocationFailed,
    AiResponseParseFailed,
    AiPoolExhausted,

    // Pipeline
    PipelineExecutionFailed,
    PipelineFilterFailed,
    PipelineInputInvalid,
    PipelineConfigInvalid,

    // Map-reduce
    MapReduceSplitFailed,
    MapReduceMapFailed,
    MapReduceReduceFailed,

    // Queue
    QueueTaskTimeout,
    QueueTaskFailed,
    QueueNotRunning,

    // Data
    CsvParseError,
    TemplateError,
    MissingVariable,
    PromptResolutionFailed,

    // Filesystem
    FileNotFound,
    PermissionDenied,
    FileSystemError,

    Unknown,
}

/// Grouping of error codes by the subsystem that raises them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ControlFlow,
    Ai,
    Pipeline,
    MapReduce,
    Queue,
    Data,
    FileSystem,
    Unknown,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 24] = [
        ErrorCode::Cancelled,
        ErrorCode::Timeout,
        ErrorCode::RetryExhausted,
        ErrorCode::AiInvocationFailed,
        ErrorCode::AiResponseParseFailed,
        ErrorCode::AiPoolExhausted,
        ErrorCode::PipelineExecutionFailed,
        ErrorCode::PipelineFilterFailed,
        ErrorCode::PipelineInputInvalid,
        ErrorCode::PipelineConfigInvalid,
        ErrorCode::MapReduceSplitFailed,
        ErrorCode::MapReduceMapFailed,
        ErrorCode::MapReduceReduceFailed,
        ErrorCode::QueueTaskTimeout,
        ErrorCode::QueueTaskFailed,
        ErrorCode::QueueNotRunning,
        ErrorCode::CsvParseError,
        ErrorCode::TemplateError,
        ErrorCode::MissingVariable,
        ErrorCode::PromptResolutionFailed,
        ErrorCode::FileNotFound,
        ErrorCode::PermissionDenied,
        ErrorCode::FileSystemError,
        ErrorCode::Unknown,
    ];

    /// Wire name of the code, e.g. `"QUEUE_TASK_TIMEOUT"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorCode::AiInvocationFailed => "AI_INVOCATION_FAILED",
            ErrorCode::AiResponseParseFailed => "AI_RESPONSE_PARSE_FAILED",
            ErrorCode::AiPoolExhausted => "AI_POOL_EXHAUSTED",
            ErrorCode::PipelineExecutionFailed => "PIPELINE_EXECUTION_FAILED",
            ErrorCode::PipelineFilterFailed => "PIPELINE_FILTER_FAILED",
            ErrorCode::PipelineInputInvalid => "PIPELINE_INPUT_INVALID",
            ErrorCode::PipelineConfigInvalid => "PIPELINE_CONFIG_INVALID",
            ErrorCode::MapReduceSplitFailed => "MAP_REDUCE_SPLIT_FAILED",
            ErrorCode::MapReduceMapFailed => "MAP_REDUCE_MAP_FAILED",
            ErrorCode::MapReduceReduceFailed => "MAP_REDUCE_REDUCE_FAILED",
            ErrorCode::QueueTaskTimeout => "QUEUE_TASK_TIMEOUT",
            ErrorCode::QueueTaskFailed => "QUEUE_TASK_FAILED",
            ErrorCode::QueueNotRunning => "QUEUE_NOT_RUNNING",
            ErrorCode::CsvParseError => "CSV_PARSE_ERROR",
            ErrorCode::TemplateError => "TEMPLATE_ERROR",
            ErrorCode::MissingVariable => "MISSING_VARIABLE",
            ErrorCode::PromptResolutionFailed => "PROMPT_RESOLUTION_FAILED",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::FileSystemError => "FILE_SYSTEM_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::Cancelled | ErrorCode::Timeout | ErrorCode::RetryExhausted => {
                ErrorCategory::ControlFlow
            }
            ErrorCode::AiInvocationFailed
            | ErrorCode::AiResponseParseFailed
            | ErrorCode::AiPoolExhausted => ErrorCategory::Ai,
            ErrorCode::PipelineExecutionFailed
            | ErrorCode::PipelineFilterFailed
            | ErrorCode::PipelineInputInvalid
            | ErrorCode::PipelineConfigInvalid => ErrorCategory::Pipeline,
            ErrorCode::MapReduceSplitFailed
            | ErrorCode::MapReduceMapFailed
            | ErrorCode::MapReduceReduceFailed => ErrorCategory::MapReduce,
            ErrorCode::QueueTaskTimeout | ErrorCode::QueueTaskFailed | ErrorCode::QueueNotRunning => {
                ErrorCategory::Queue
            }
            ErrorCode::CsvParseError
            | ErrorCode::TemplateError
            | ErrorCode::MissingVariable
            | ErrorCode::PromptResolutionFailed => ErrorCategory::Data,
            ErrorCode::FileNotFound | ErrorCode::PermissionDenied | ErrorCode::FileSystemError => {
                ErrorCategory::FileSystem
            }
            ErrorCode::Unknown => ErrorCategory::Unknown,
        }
    }

    /// Transient failures that a retry policy may attempt again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::AiInvocationFailed | ErrorCode::AiPoolExhausted
        )
    }

    /// Map an I/O error kind to its code.
    pub fn from_io_kind(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;

        match kind {
            ErrorKind::NotFound => ErrorCode::FileNotFound,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ErrorCode::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => ErrorCode::AiInvocationFailed,
            _ => ErrorCode::FileSystemError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| {
                PipelineError::new(ErrorCode::Unknown, format!("Unknown error code: {s}"))
            })
    }
}

// ─── Causes ─────────────────────────────────────────────────────────────────

/// What a [`PipelineError`] was caused by.
///
/// Nested pipeline errors are shared, not copied, so wrapping is cheap and the
/// original stays observable through the chain.
#[derive(Debug, Clone)]
pub enum ErrorCause {
    Pipeline(Arc<PipelineError>),
    External(Arc<dyn std::error::Error + Send + Sync + 'static>),
    /// A non-error value; flattening stops here.
    Value(Value),
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCause::Pipeline(err) => write!(f, "{err}"),
            ErrorCause::External(err) => write!(f, "{err}"),
            ErrorCause::Value(Value::String(s)) => f.write_str(s),
            ErrorCause::Value(value) => write!(f, "{value}"),
        }
    }
}

impl std::error::Error for ErrorCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ErrorCause::Pipeline(err) => err.cause.as_ref().map(|c| c as _),
            ErrorCause::External(err) => err.source(),
            ErrorCause::Value(_) => None,
        }
    }
}

// ─── PipelineError ──────────────────────────────────────────────────────────

/// Typed failure value: code, message, optional nested cause, diagnostic meta.
#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct PipelineError {
    code: ErrorCode,
    message: String,
    #[source]
    cause: Option<ErrorCause>,
    meta: BTreeMap<String, Value>,
}

pub type OrchestraResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Wrap with added context, keeping the original code.
    ///
    /// The new value inherits the original's meta; `extra` keys override.
    pub fn wrap(self, message: impl Into<String>, extra: BTreeMap<String, Value>) -> Self {
        let code = self.code;
        self.wrap_as(code, message, extra)
    }

    /// Wrap and reclassify under `code`.
    pub fn wrap_as(
        self,
        code: ErrorCode,
        message: impl Into<String>,
        extra: BTreeMap<String, Value>,
    ) -> Self {
        let mut meta = self.meta.clone();
        meta.extend(extra);
        Self {
            code,
            message: message.into(),
            cause: Some(ErrorCause::Pipeline(Arc::new(self))),
            meta,
        }
    }

    /// Build from a foreign error, classifying it when no code is given.
    ///
    /// An `anyhow::Error` that already carries a `PipelineError` keeps its code
    /// unless `code` overrides it; an `std::io::Error` goes through the I/O
    /// mapping.
    pub fn from_external(code: Option<ErrorCode>, err: anyhow::Error) -> Self {
        let err = match err.downcast::<PipelineError>() {
            Ok(typed) => {
                return match code {
                    Some(code) if code != typed.code => {
                        let message = typed.message.clone();
                        typed.wrap_as(code, message, BTreeMap::new())
                    }
                    _ => typed,
                };
            }
            Err(err) => err,
        };
        let err = match err.downcast::<std::io::Error>() {
            Ok(io) => {
                let mapped = Self::from_io(io);
                return match code {
                    Some(code) if code != mapped.code => {
                        let message = mapped.message.clone();
                        mapped.wrap_as(code, message, BTreeMap::new())
                    }
                    _ => mapped,
                };
            }
            Err(err) => err,
        };

        let message = err.to_string();
        let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = err.into();
        Self::new(code.unwrap_or(ErrorCode::Unknown), message)
            .with_cause(ErrorCause::External(Arc::from(boxed)))
    }

    /// Deterministic mapping of a system I/O failure.
    pub fn from_io(err: std::io::Error) -> Self {
        let code = ErrorCode::from_io_kind(err.kind());
        Self::new(code, err.to_string())
            .with_meta("ioKind", format!("{:?}", err.kind()))
            .with_cause(ErrorCause::External(Arc::new(err)))
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// The directly nested pipeline error, if the cause is one.
    pub fn inner(&self) -> Option<&PipelineError> {
        match &self.cause {
            Some(ErrorCause::Pipeline(err)) => Some(err),
            _ => None,
        }
    }

    pub fn meta(&self) -> &BTreeMap<String, Value> {
        &self.meta
    }

    pub fn meta_value(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.code, ErrorCode::Timeout | ErrorCode::QueueTaskTimeout)
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Whether `code` appears anywhere in this error or its pipeline causes.
    pub fn has_code(&self, code: ErrorCode) -> bool {
        let mut current = Some(self);
        while let Some(err) = current {
            if err.code == code {
                return true;
            }
            current = err.inner();
        }
        false
    }

    /// Messages of this error followed by at most [`MAX_CAUSE_DEPTH`] causes.
    ///
    /// Pipeline causes and std `source()` chains are both walked; a
    /// [`ErrorCause::Value`] ends the walk without contributing a message.
    pub fn cause_messages(&self) -> Vec<String> {
        let mut messages = vec![self.message.clone()];
        let mut depth = 0;
        let mut next = self.cause.as_ref();

        while let Some(cause) = next {
            if depth >= MAX_CAUSE_DEPTH {
                return messages;
            }
            match cause {
                ErrorCause::Pipeline(err) => {
                    messages.push(err.message.clone());
                    depth += 1;
                    next = err.cause.as_ref();
                }
                ErrorCause::External(err) => {
                    messages.push(err.to_string());
                    depth += 1;
                    let mut source = err.source();
                    while let Some(inner) = source {
                        if depth >= MAX_CAUSE_DEPTH {
                            break;
                        }
                        messages.push(inner.to_string());
                        depth += 1;
                        source = inner.source();
                    }
                    return messages;
                }
                ErrorCause::Value(_) => return messages,
            }
        }
        messages
    }

    /// Flattened cause chain joined with `": "`.
    pub fn cause_chain_message(&self) -> String {
        self.cause_messages().join(": ")
    }

    /// Transport-facing JSON shape.
    pub fn to_json(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "meta": self.meta,
            "causes": self.cause_messages().into_iter().skip(1).collect::<Vec<_>>(),
        })
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::from_io(err)
    }
}

/// Build a meta map from key/value pairs.
pub fn meta<I, K, V>(pairs: I) -> BTreeMap<String, Value>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
