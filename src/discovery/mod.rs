//! Discovery merge engine.
//!
//! Partial, overlapping repository scans (each an AI response) are folded
//! into one [`DiscoveryGraph`] by repeated AI merge calls. The backend's
//! merge step owns the convergence decision; [`MergeEngine`] only stops the
//! loop once `converged` is reported, the iteration cap is hit, or the
//! [`ScanSource`] has nothing left.
//!
//! Component ids and theme names pass through [`normalize_slug`] so that
//! case and punctuation variants from different calls collapse to one key.

pub mod graph;
pub mod merge;
pub mod parse;

pub use graph::{
    merge_themes, normalize_slug, Category, Complexity, Component, DiscoveryGraph, MergeResult,
    ProjectInfo, Theme,
};
pub use merge::{
    IterationRecord, MergeEngine, MergeOptions, MergeOutcome, ScanSource, StaticScans, StopReason,
};
pub use parse::parse_merge_response;
