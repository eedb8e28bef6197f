use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use orchestra_core::ai::{
    stream_invocation, AiBackend, FnBackend, SendMessageRequest, SendMessageResponse, StreamEvent,
};
use orchestra_core::discovery::{DiscoveryGraph, MergeEngine, MergeOptions, StaticScans, StopReason};
use orchestra_core::pipeline::{
    CollectReducer, Item, MapContext, MapOutput, Mapper, Pipeline, PipelineOptions, RetryPolicy,
};
use orchestra_core::queue::{NewTask, Priority, QueueOptions, QueuedTask, TaskExecutor, TaskQueue};
use orchestra_core::usage::{Phase, TokenUsage, UsageReport, UsageTracker};
use orchestra_core::{ErrorCode, OrchestraConfig, OrchestraResult, PipelineError};

// ─── Mock Backends ──────────────────────────────────────────────────────────

/// Replies from a script, one entry per call.
fn scripted_backend(replies: Vec<String>) -> Arc<dyn AiBackend> {
    let replies = Arc::new(Mutex::new(VecDeque::from(replies)));
    Arc::new(FnBackend::from_fn("scripted", move |_req: SendMessageRequest| {
        let replies = replies.clone();
        async move {
            let next = replies.lock().unwrap().pop_front();
            match next {
                Some(text) => Ok(SendMessageResponse::ok(text)
                    .with_usage(TokenUsage::new(100, 20).with_cost(0.01))),
                None => Err(PipelineError::new(
                    ErrorCode::AiInvocationFailed,
                    "No more responses",
                )),
            }
        }
    }))
}

/// Sends `count` chunks, pausing between each.
fn slow_chunker(count: usize, gap: Duration) -> Arc<dyn AiBackend> {
    Arc::new(FnBackend::from_fn("chunker", move |req: SendMessageRequest| async move {
        let mut full = String::new();
        for i in 0..count {
            let chunk = format!("chunk-{i} ");
            if let Some(tx) = &req.chunk_tx {
                let _ = tx.send(chunk.clone());
            }
            full.push_str(&chunk);
            tokio::time::sleep(gap).await;
        }
        Ok(SendMessageResponse::ok(full))
    }))
}

fn merge_reply(components: &[&str], converged: bool, coverage: f64) -> String {
    json!({
        "graph": {
            "project": {"name": "demo"},
            "components": components.iter().map(|c| json!({"id": c, "name": c})).collect::<Vec<_>>(),
            "categories": []
        },
        "newThemes": [],
        "converged": converged,
        "coverage": coverage,
        "reason": "ok"
    })
    .to_string()
}

// ─── Test Mappers & Executors ───────────────────────────────────────────────

/// Doubles `n`; the item at `broken` always fails with a retryable error.
struct FlakyDoubler {
    broken: usize,
    calls: Mutex<Vec<usize>>,
}

#[async_trait]
impl Mapper for FlakyDoubler {
    fn name(&self) -> &str {
        "flaky-doubler"
    }

    async fn map(&self, item: &Item, ctx: &MapContext) -> OrchestraResult<MapOutput> {
        self.calls.lock().unwrap().push(ctx.index);
        if ctx.index == self.broken {
            return Err(PipelineError::new(ErrorCode::AiInvocationFailed, "backend unavailable"));
        }
        let n = item.get("n").and_then(Value::as_i64).unwrap_or_default();
        Ok(MapOutput::new(n * 2).with_usage(Some(TokenUsage::new(10, 5))))
    }
}

/// Records the order task bodies start in.
struct OrderRecorder {
    started: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl TaskExecutor for OrderRecorder {
    type Payload = &'static str;
    type Output = ();

    async fn execute(
        &self,
        task: &QueuedTask<&'static str>,
        _cancel: CancellationToken,
    ) -> OrchestraResult<()> {
        self.started.lock().unwrap().push(task.payload);
        Ok(())
    }
}

// ─── Integration Tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn partial_map_failure_reduces_survivors() {
    let mapper = Arc::new(FlakyDoubler {
        broken: 2,
        calls: Mutex::new(Vec::new()),
    });
    let tracker = UsageTracker::shared();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let pipeline = Pipeline::new(mapper.clone())
        .with_options(
            PipelineOptions::new("partial")
                .with_concurrency(2)
                .with_retry(RetryPolicy::new(3).with_backoff(1, 5, 2.0)),
        )
        .with_reducer(Arc::new(CollectReducer))
        .with_events(tx)
        .with_usage(tracker.clone());

    let items = (1..=5).map(|n| json!({ "n": n })).collect();
    let result = pipeline.run(items, CancellationToken::new()).await.unwrap();

    assert!(result.is_partial());
    assert_eq!(result.failed_indices(), vec![2]);
    assert_eq!(result.output, json!([2, 4, 8, 10]));
    assert_eq!(result.stats.succeeded, 4);
    assert_eq!(result.stats.failed, 1);

    let failure = &result.failures[0];
    assert_eq!(failure.error.code(), ErrorCode::MapReduceMapFailed);
    assert!(failure.error.has_code(ErrorCode::RetryExhausted));
    assert!(failure.error.has_code(ErrorCode::AiInvocationFailed));

    let attempts_on_broken = mapper.calls.lock().unwrap().iter().filter(|&&i| i == 2).count();
    assert_eq!(attempts_on_broken, 3);

    // Four successful calls plus three failed attempts.
    let analysis = tracker.lock().unwrap().phase_usage(Phase::Analysis);
    assert_eq!(analysis.calls, 7);
    assert_eq!(analysis.input_tokens, 40);

    let mut saw_failure_event = false;
    while let Ok(event) = rx.try_recv() {
        if let orchestra_core::pipeline::PipelineEvent::ItemFailed { index, code } = event {
            assert_eq!(index, 2);
            assert_eq!(code, ErrorCode::MapReduceMapFailed);
            saw_failure_event = true;
        }
    }
    assert!(saw_failure_event);
}

#[tokio::test]
async fn discovery_converges_on_second_iteration() {
    let backend = scripted_backend(vec![
        merge_reply(&["Task Queue"], false, 0.4),
        merge_reply(&["task-queue", "Error Model"], true, 0.9),
        merge_reply(&["never"], true, 1.0),
    ]);
    let tracker = UsageTracker::shared();
    let engine = MergeEngine::new(backend, MergeOptions::default().with_max_iterations(5))
        .with_usage(tracker.clone());
    let mut scans = StaticScans::new(["scan one", "scan two", "scan three"]);

    let outcome = engine
        .run(None, &mut scans, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.stop_reason, StopReason::Converged);
    assert!(outcome.converged());
    assert_eq!(outcome.graph().components.len(), 2);
    assert!(outcome.graph().component("Error Model").is_some());
    assert_eq!(scans.remaining(), 1);

    let discovery = tracker.lock().unwrap().phase_usage(Phase::Discovery);
    assert_eq!(discovery.calls, 2);
    assert_eq!(discovery.cost, Some(0.02));
}

#[tokio::test]
async fn stream_cancellation_stops_chunks() {
    let backend = slow_chunker(5, Duration::from_millis(50));
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(stream_invocation(
        backend,
        SendMessageRequest::new("stream please"),
        cancel.clone(),
        tx,
    ));

    let mut chunks = 0;
    let mut after_cancel = Vec::new();
    while let Some(event) = rx.recv().await {
        if cancel.is_cancelled() {
            after_cancel.push(event);
            continue;
        }
        if let StreamEvent::Chunk { .. } = event {
            chunks += 1;
            if chunks == 2 {
                cancel.cancel();
            }
        }
    }

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert_eq!(chunks, 2);
    assert!(after_cancel
        .iter()
        .all(|e| !matches!(e, StreamEvent::Chunk { .. })));
    assert_eq!(
        after_cancel.last(),
        Some(&StreamEvent::Done {
            success: false,
            response: None,
            token_usage: None,
        })
    );
}

#[tokio::test]
async fn reused_seed_reports_cached_discovery() {
    let tracker = UsageTracker::shared();
    let engine = MergeEngine::new(scripted_backend(vec![]), MergeOptions::default())
        .with_usage(tracker.clone());
    let mut scans = StaticScans::new(Vec::<String>::new());

    let outcome = engine
        .run(
            Some(DiscoveryGraph::seed("cached-project")),
            &mut scans,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::ScansExhausted);
    assert_eq!(outcome.graph().project.name, "cached-project");

    tracker
        .lock()
        .unwrap()
        .add_usage(Phase::Analysis, Some(&TokenUsage::new(500, 100)));
    let report = tracker.lock().unwrap().to_report(Some("sonnet"));
    let value: Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

    assert_eq!(value["phases"]["discovery"]["cached"], json!(true));
    assert_eq!(value["phases"]["discovery"]["calls"], json!(0));
    assert_eq!(value["phases"]["analysis"]["cached"], json!(false));
    assert_eq!(value["total"]["inputTokens"], json!(500));
    assert_eq!(value["model"], json!("sonnet"));
}

#[tokio::test]
async fn queue_runs_by_priority_then_fifo() {
    let executor = Arc::new(OrderRecorder {
        started: Mutex::new(Vec::new()),
    });
    let queue = TaskQueue::new(executor.clone(), QueueOptions::new(1).paused());

    queue.enqueue(NewTask::new("t", "low").with_priority(Priority::Low)).unwrap();
    queue.enqueue(NewTask::new("t", "normal")).unwrap();
    queue.enqueue(NewTask::new("t", "high-1").with_priority(Priority::High)).unwrap();
    queue.enqueue(NewTask::new("t", "high-2").with_priority(Priority::High)).unwrap();
    assert_eq!(queue.stats().queued, 4);

    queue.resume();
    queue.wait_idle().await;

    assert_eq!(
        *executor.started.lock().unwrap(),
        vec!["high-1", "high-2", "normal", "low"]
    );
    assert_eq!(queue.stats().completed, 4);
}

#[test]
fn usage_report_round_trips_with_null_cost() {
    let mut tracker = UsageTracker::new();
    tracker.add_usage(Phase::Writing, Some(&TokenUsage::new(30, 70)));
    let report = tracker.to_report(None);

    let text = report.to_json().unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["phases"]["writing"]["cost"], Value::Null);
    assert_eq!(value["total"]["cost"], Value::Null);

    let back = UsageReport::from_json(&text).unwrap();
    assert_eq!(back, report);
}

#[tokio::test]
async fn config_drives_pipeline_options() {
    let config = OrchestraConfig::from_yaml_str(
        "queue:\n  maxConcurrency: 3\nretry:\n  maxAttempts: 2\npipeline:\n  failurePolicy: abort-on-first\n",
    )
    .unwrap();
    let options = config.pipeline_options("configured");
    assert_eq!(options.max_concurrency, 3);
    assert_eq!(options.retry.max_attempts, 2);

    let mapper = Arc::new(FlakyDoubler {
        broken: 0,
        calls: Mutex::new(Vec::new()),
    });
    let pipeline = Pipeline::new(mapper).with_options(options.with_retry(RetryPolicy::none()));
    let err = pipeline
        .run(vec![json!({"n": 1}), json!({"n": 2})], CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.has_code(ErrorCode::AiInvocationFailed));
}

#[test]
fn public_handles_are_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<PipelineError>();
    assert_send_sync::<Pipeline>();
    assert_send_sync::<MergeEngine>();
    assert_send_sync::<TaskQueue<OrderRecorder>>();
    assert_send_sync::<UsageTracker>();
    assert_send_sync::<OrchestraConfig>();
}
