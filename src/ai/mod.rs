//! AI backend capability. Backend calls are the only operations that suspend
//! for real wall-clock time.
//!
//! Any concrete backend (local CLI, hosted API, test double) implements
//! [`AiBackend`]. The core never assumes a transport; it only relies on the
//! deadline and cancellation wrapping done by [`invoke`].

pub mod json;
pub mod stream;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, OrchestraResult, PipelineError};
use crate::usage::TokenUsage;

pub use json::{extract_json, extract_json_object};
pub use stream::{stream_invocation, StreamEvent};

/// Default per-invocation deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Permissions ────────────────────────────────────────────────────────────

/// How a backend answers tool/permission prompts raised during a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionPolicy {
    #[default]
    AllowAll,
    DenyAll,
}

/// A permission prompt raised by the backend mid-call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    pub kind: String,
    pub detail: String,
}

impl PermissionPolicy {
    pub fn decide(&self, request: &PermissionRequest) -> bool {
        let allowed = matches!(self, PermissionPolicy::AllowAll);
        tracing::debug!(kind = %request.kind, allowed, "permission request resolved");
        allowed
    }
}

// ─── Request / Response ─────────────────────────────────────────────────────

/// One `sendMessage` call.
#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub working_directory: PathBuf,
    pub timeout: Duration,
    pub permission_policy: PermissionPolicy,
    /// Receives streamed chunks in generation order, when streaming.
    pub chunk_tx: Option<mpsc::UnboundedSender<String>>,
}

impl SendMessageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            working_directory: PathBuf::from("."),
            timeout: DEFAULT_TIMEOUT,
            permission_policy: PermissionPolicy::default(),
            chunk_tx: None,
        }
    }

    pub fn with_model(mut self, model: Option<impl Into<String>>) -> Self {
        self.model = model.map(Into::into);
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

    pub fn with_chunks(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.chunk_tx = Some(tx);
        self
    }
}

/// Result of a `sendMessage` call as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub success: bool,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl SendMessageResponse {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: response.into(),
            error: None,
            token_usage: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: String::new(),
            error: Some(error.into()),
            token_usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

// ─── Backend Trait ──────────────────────────────────────────────────────────

/// Capability interface over an AI backend.
#[async_trait]
pub trait AiBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Send one prompt. Streamed chunks, if requested, go to
    /// `request.chunk_tx` before this returns.
    async fn send_message(&self, request: SendMessageRequest)
        -> OrchestraResult<SendMessageResponse>;
}

/// Closure type for [`FnBackend`].
pub type SendFn = Arc<
    dyn Fn(SendMessageRequest) -> Pin<Box<dyn Future<Output = OrchestraResult<SendMessageResponse>> + Send>>
        + Send
        + Sync,
>;

/// Backend built from a closure, for embedding hosts and tests.
pub struct FnBackend {
    name: String,
    send_fn: SendFn,
}

impl FnBackend {
    pub fn new(name: impl Into<String>, send_fn: SendFn) -> Self {
        Self {
            name: name.into(),
            send_fn,
        }
    }

    /// Build from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(SendMessageRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OrchestraResult<SendMessageResponse>> + Send + 'static,
    {
        let send_fn: SendFn = Arc::new(
            move |request| -> Pin<Box<dyn Future<Output = OrchestraResult<SendMessageResponse>> + Send>> {
                Box::pin(f(request))
            },
        );
        Self::new(name, send_fn)
    }
}

#[async_trait]
impl AiBackend for FnBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> OrchestraResult<SendMessageResponse> {
        (self.send_fn)(request).await
    }
}

// ─── Invocation ─────────────────────────────────────────────────────────────

/// Call `backend` under the request's deadline, racing `cancel`.
///
/// Maps the outcome onto the error taxonomy: deadline → `TIMEOUT`,
/// cancellation → `CANCELLED`, `success: false` → `AI_INVOCATION_FAILED`.
pub async fn invoke(
    backend: &dyn AiBackend,
    request: SendMessageRequest,
    cancel: &CancellationToken,
) -> OrchestraResult<SendMessageResponse> {
    if cancel.is_cancelled() {
        return Err(PipelineError::cancelled("AI invocation cancelled before start"));
    }

    let deadline = request.timeout;
    let timeout_ms = deadline.as_millis() as u64;
    tracing::debug!(backend = backend.name(), timeout_ms, "invoking AI backend");

    let call = tokio::time::timeout(deadline, backend.send_message(request));
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            Err(PipelineError::cancelled("AI invocation cancelled"))
        }
        outcome = call => match outcome {
            Err(_) => Err(PipelineError::timeout(format!(
                "AI invocation timed out after {timeout_ms}ms"
            ))
            .with_meta("timeoutMs", timeout_ms)
            .with_meta("backend", backend.name())),
            Ok(Err(err)) => Err(err),
            Ok(Ok(response)) if !response.success => Err(PipelineError::new(
                ErrorCode::AiInvocationFailed,
                response
                    .error
                    .clone()
                    .unwrap_or_else(|| "AI backend reported failure".to_string()),
            )
            .with_meta("backend", backend.name())),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invoke_returns_response() {
        let backend = FnBackend::from_fn("test", |req: SendMessageRequest| async move {
            Ok(SendMessageResponse::ok(format!("echo: {}", req.prompt)))
        });
        let resp = invoke(&backend, SendMessageRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.response, "echo: hi");
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_times_out() {
        let backend = FnBackend::from_fn("test", |_req: SendMessageRequest| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(SendMessageResponse::ok("late"))
        });
        let req = SendMessageRequest::new("slow").with_timeout(Duration::from_millis(50));
        let err = invoke(&backend, req, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(err.meta_value("timeoutMs"), Some(&serde_json::Value::from(50)));
    }

    #[tokio::test]
    async fn invoke_maps_unsuccessful_response() {
        let backend = FnBackend::from_fn("test", |_req: SendMessageRequest| async move {
            Ok(SendMessageResponse::failed("rate limited"))
        });
        let err = invoke(&backend, SendMessageRequest::new("x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AiInvocationFailed);
        assert_eq!(err.message(), "rate limited");
    }

    #[tokio::test]
    async fn invoke_observes_prior_cancellation() {
        let backend = FnBackend::from_fn("test", |_req: SendMessageRequest| async move {
            Ok(SendMessageResponse::ok("never"))
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = invoke(&backend, SendMessageRequest::new("x"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_cancelled_mid_flight() {
        let backend = FnBackend::from_fn("test", |_req: SendMessageRequest| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(SendMessageResponse::ok("late"))
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = invoke(&backend, SendMessageRequest::new("x"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn permission_policies() {
        let req = PermissionRequest {
            kind: "shell".into(),
            detail: "rm -rf target".into(),
        };
        assert!(PermissionPolicy::AllowAll.decide(&req));
        assert!(!PermissionPolicy::DenyAll.decide(&req));
        let json = serde_json::to_string(&PermissionPolicy::DenyAll).unwrap();
        assert_eq!(json, r#""deny-all""#);
    }

    #[test]
    fn request_builder() {
        let req = SendMessageRequest::new("p")
            .with_model(Some("haiku"))
            .with_working_directory("/tmp/repo")
            .with_timeout(Duration::from_secs(3))
            .with_permission_policy(PermissionPolicy::DenyAll);
        assert_eq!(req.model.as_deref(), Some("haiku"));
        assert_eq!(req.working_directory, PathBuf::from("/tmp/repo"));
        assert_eq!(req.timeout, Duration::from_secs(3));
        assert!(req.chunk_tx.is_none());
    }

    #[test]
    fn backend_is_object_safe() {
        fn _assert_object_safe(_: &dyn AiBackend) {}
    }
}
