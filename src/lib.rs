//! # orchestra-core
//!
//! Async orchestration core for AI-driven analysis pipelines: a bounded
//! priority task queue, a four-phase map-reduce executor, an iterative
//! discovery merge loop, streaming AI invocation, and per-phase usage
//! accounting, all sharing one structured error model.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use orchestra_core::ai::{FnBackend, SendMessageResponse};
//! use orchestra_core::pipeline::{
//!     JsonArrayReducer, Pipeline, PipelineOptions, PromptMapper,
//! };
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> orchestra_core::OrchestraResult<()> {
//! let backend = Arc::new(FnBackend::from_fn("echo", |req| async move {
//!     Ok(SendMessageResponse::ok(format!("[{{\"title\": \"{}\"}}]", req.prompt)))
//! }));
//!
//! let mapper = PromptMapper::new(backend, "Review {{file}}")?.parse_json(true);
//! let pipeline = Pipeline::new(Arc::new(mapper))
//!     .with_options(PipelineOptions::new("review").with_concurrency(4))
//!     .with_reducer(Arc::new(JsonArrayReducer::new().dedup_by("title")));
//!
//! let items = vec![json!({"file": "a.rs"}), json!({"file": "b.rs"})];
//! let result = pipeline.run(items, CancellationToken::new()).await?;
//! println!("{} findings, partial: {}", result.output, result.is_partial());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Structured error model: closed code set, metadata, cause chains |
//! | [`queue`] | Priority task queue with bounded concurrency, pause, cancel, timeouts |
//! | [`pipeline`] | Input → filter → map → reduce executor with retries and partial results |
//! | [`discovery`] | Iterative merge of partial scans into a converged discovery graph |
//! | [`ai`] | Backend trait, streaming invocation, fenced-JSON extraction |
//! | [`usage`] | Per-phase token/cost tracking and JSON usage reports |
//! | [`config`] | YAML/JSON configuration feeding the components above |
//!
//! Every fallible operation returns [`OrchestraResult`]. Cancellation is
//! cooperative and flows through `tokio_util::sync::CancellationToken`;
//! a cancelled operation fails with [`ErrorCode::Cancelled`].

pub mod ai;
pub mod config;
pub mod discovery;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod usage;

pub use config::OrchestraConfig;
pub use error::{ErrorCategory, ErrorCause, ErrorCode, OrchestraResult, PipelineError};
