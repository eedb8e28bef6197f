//! Streaming transport frames.
//!
//! An invocation produces ordered frames (`progress`, `chunk`, `error`,
//! `done`) which an outer transport such as SSE renders. `done`
//! is always the last frame. Once cancellation is observed no further `chunk`
//! frame is emitted and `done` reports `success: false`.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, OrchestraResult, PipelineError};
use crate::usage::TokenUsage;

use super::{invoke, AiBackend, SendMessageRequest, SendMessageResponse};

/// One frame of a streamed invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Progress {
        message: String,
    },
    Chunk {
        text: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Done {
        success: bool,
        response: Option<String>,
        token_usage: Option<TokenUsage>,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Progress { .. } => "progress",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            StreamEvent::Progress { message } => json!({ "message": message }),
            StreamEvent::Chunk { text } => json!({ "content": text }),
            StreamEvent::Error { code, message } => json!({ "code": code, "message": message }),
            StreamEvent::Done {
                success,
                response,
                token_usage,
            } => json!({
                "success": success,
                "response": response,
                "tokenUsage": token_usage,
            }),
        }
    }

    /// Server-sent-events framing: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.payload())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }
}

/// Emits frames, going silent for chunks once cancellation is observed.
///
/// A dropped receiver counts as a client disconnect and cancels the
/// stream's own token. The caller's token is left alone.
struct Emitter {
    tx: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    fn send(&self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            self.cancel.cancel();
        }
    }

    fn chunk(&self, text: String) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.send(StreamEvent::Chunk { text });
    }

    fn done(&self, response: Option<&SendMessageResponse>) {
        let event = match response {
            Some(resp) if !self.cancel.is_cancelled() => StreamEvent::Done {
                success: true,
                response: Some(resp.response.clone()),
                token_usage: resp.token_usage.clone(),
            },
            _ => StreamEvent::Done {
                success: false,
                response: None,
                token_usage: None,
            },
        };
        let _ = self.tx.send(event);
    }
}

/// Run one invocation, forwarding chunks as frames on `events`.
///
/// Returns the backend response, or the typed failure. `CANCELLED` is
/// returned when the token fires (or the receiver is dropped) before the
/// result could be delivered. A dropped receiver only stops this stream;
/// other work sharing `cancel` keeps running.
pub async fn stream_invocation(
    backend: Arc<dyn AiBackend>,
    request: SendMessageRequest,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<StreamEvent>,
) -> OrchestraResult<SendMessageResponse> {
    let cancel = cancel.child_token();
    let emitter = Emitter {
        tx: events,
        cancel: cancel.clone(),
    };
    emitter.send(StreamEvent::Progress {
        message: format!("Sending prompt to {}", backend.name()),
    });

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
    let request = request.with_chunks(chunk_tx);

    let call = invoke(backend.as_ref(), request, &cancel);
    tokio::pin!(call);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break Err(PipelineError::cancelled("Streaming invocation cancelled"));
            }
            Some(chunk) = chunk_rx.recv() => emitter.chunk(chunk),
            result = &mut call => break result,
        }
    };

    // Chunks sent in the same poll that completed the call.
    while let Ok(chunk) = chunk_rx.try_recv() {
        if cancel.is_cancelled() {
            break;
        }
        emitter.chunk(chunk);
    }

    match outcome {
        Ok(response) if !cancel.is_cancelled() => {
            emitter.done(Some(&response));
            Ok(response)
        }
        Ok(_) => {
            tracing::debug!("stream cancelled after backend returned; result suppressed");
            emitter.done(None);
            Err(PipelineError::cancelled("Streaming invocation cancelled"))
        }
        Err(err) if err.is_cancelled() => {
            tracing::debug!("stream cancelled");
            emitter.done(None);
            Err(err)
        }
        Err(err) => {
            tracing::warn!(code = %err.code(), "streaming invocation failed: {}", err.message());
            emitter.send(StreamEvent::Error {
                code: err.code(),
                message: err.cause_chain_message(),
            });
            emitter.done(None);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::FnBackend;
    use std::time::Duration;

    fn chunking_backend(chunks: Vec<&'static str>) -> Arc<dyn AiBackend> {
        Arc::new(FnBackend::from_fn("chunker", move |req: SendMessageRequest| {
            let chunks = chunks.clone();
            async move {
                if let Some(tx) = &req.chunk_tx {
                    for c in &chunks {
                        let _ = tx.send(c.to_string());
                    }
                }
                Ok(SendMessageResponse::ok(chunks.concat()))
            }
        }))
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn emits_chunks_then_done() {
        let (tx, rx) = mpsc::unbounded_channel();
        let resp = stream_invocation(
            chunking_backend(vec!["a", "b", "c"]),
            SendMessageRequest::new("p"),
            CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();
        assert_eq!(resp.response, "abc");

        let events = collect(rx).await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["progress", "chunk", "chunk", "chunk", "done"]);
        assert_eq!(events[1], StreamEvent::Chunk { text: "a".into() });
        assert!(matches!(events.last(), Some(StreamEvent::Done { success: true, .. })));
    }

    #[tokio::test]
    async fn failure_emits_error_then_done() {
        let backend: Arc<dyn AiBackend> = Arc::new(FnBackend::from_fn(
            "broken",
            |_req: SendMessageRequest| async move { Ok(SendMessageResponse::failed("backend down")) },
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let err = stream_invocation(backend, SendMessageRequest::new("p"), CancellationToken::new(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AiInvocationFailed);

        let events = collect(rx).await;
        assert_eq!(events[events.len() - 2].name(), "error");
        assert_eq!(events[events.len() - 2].payload()["code"], "AI_INVOCATION_FAILED");
        assert!(matches!(events.last(), Some(StreamEvent::Done { success: false, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reported_as_error_frame() {
        let backend: Arc<dyn AiBackend> = Arc::new(FnBackend::from_fn(
            "sleepy",
            |_req: SendMessageRequest| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(SendMessageResponse::ok("late"))
            },
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let req = SendMessageRequest::new("p").with_timeout(Duration::from_millis(100));
        let err = stream_invocation(backend, req, CancellationToken::new(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);

        let events = collect(rx).await;
        assert_eq!(events[events.len() - 2].payload()["code"], "TIMEOUT");
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn dropped_receiver_stops_only_this_stream() {
        let backend: Arc<dyn AiBackend> =
            Arc::new(FnBackend::from_fn("stalled", |_req: SendMessageRequest| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(SendMessageResponse::ok("late"))
            }));
        let shared = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let err = stream_invocation(backend, SendMessageRequest::new("hi"), shared.clone(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert!(!shared.is_cancelled());
    }

    #[test]
    fn sse_framing() {
        let frame = StreamEvent::Chunk { text: "hi".into() }.to_sse();
        assert_eq!(frame, "event: chunk\ndata: {\"content\":\"hi\"}\n\n");

        let done = StreamEvent::Done {
            success: false,
            response: None,
            token_usage: None,
        };
        assert_eq!(done.payload()["success"], false);
        assert!(done.payload()["tokenUsage"].is_null());
    }
}
