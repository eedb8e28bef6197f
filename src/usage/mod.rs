//! Per-phase token and cost accounting.
//!
//! Synchronous and I/O free: the tracker is called from inside the other
//! components' call sites and never suspends. Share it across tasks through
//! [`SharedUsageTracker`].
//!
//! ```rust
//! use orchestra_core::usage::{Phase, TokenUsage, UsageTracker};
//!
//! let mut tracker = UsageTracker::new();
//! tracker.add_usage(Phase::Discovery, Some(&TokenUsage::new(1200, 300).with_cost(0.02)));
//! tracker.add_usage(Phase::Writing, None);
//! tracker.mark_cached(Phase::Analysis);
//!
//! let report = tracker.to_report(Some("sonnet"));
//! assert_eq!(report.total.calls, 2);
//! assert_eq!(report.total.cost, Some(0.02));
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, OrchestraResult, PipelineError};

// ─── Phases ─────────────────────────────────────────────────────────────────

/// Fixed set of stages usage is accumulated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Discovery,
    Consolidation,
    Analysis,
    Writing,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Discovery,
        Phase::Consolidation,
        Phase::Analysis,
        Phase::Writing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Consolidation => "consolidation",
            Phase::Analysis => "analysis",
            Phase::Writing => "writing",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                PipelineError::new(ErrorCode::PipelineConfigInvalid, format!("Unknown phase: {s}"))
            })
    }
}

// ─── Token Usage ────────────────────────────────────────────────────────────

/// Usage reported by a single AI invocation.
///
/// `total_tokens` is supplied by the backend and is not necessarily
/// `input + output`, since cache tokens may overlap either side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
    #[serde(default = "default_turn_count")]
    pub turn_count: u64,
    #[serde(default)]
    pub cost: Option<f64>,
}

fn default_turn_count() -> u64 {
    1
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            total_tokens: input + output,
            turn_count: 1,
            cost: None,
        }
    }

    pub fn with_cache(mut self, read: u64, write: u64) -> Self {
        self.cache_read_tokens = read;
        self.cache_write_tokens = write;
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total_tokens = total;
        self
    }

    pub fn with_turns(mut self, turns: u64) -> Self {
        self.turn_count = turns.max(1);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

impl Default for TokenUsage {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

// ─── Phase Usage ────────────────────────────────────────────────────────────

/// Accumulated usage for one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
    pub turn_count: u64,
    pub cost: Option<f64>,
    pub calls: u64,
    pub cached: bool,
}

impl PhaseUsage {
    fn absorb(&mut self, usage: &TokenUsage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_read_tokens += usage.cache_read_tokens;
        self.cache_write_tokens += usage.cache_write_tokens;
        self.total_tokens += usage.total_tokens;
        self.turn_count += usage.turn_count;
        if let Some(cost) = usage.cost {
            self.cost = Some(self.cost.unwrap_or(0.0) + cost);
        }
    }

    fn add(&mut self, other: &PhaseUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.total_tokens += other.total_tokens;
        self.turn_count += other.turn_count;
        self.calls += other.calls;
        if let Some(cost) = other.cost {
            self.cost = Some(self.cost.unwrap_or(0.0) + cost);
        }
    }
}

/// Every fixed phase, always present in a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseBreakdown {
    pub discovery: PhaseUsage,
    pub consolidation: PhaseUsage,
    pub analysis: PhaseUsage,
    pub writing: PhaseUsage,
}

impl PhaseBreakdown {
    pub fn get(&self, phase: Phase) -> &PhaseUsage {
        match phase {
            Phase::Discovery => &self.discovery,
            Phase::Consolidation => &self.consolidation,
            Phase::Analysis => &self.analysis,
            Phase::Writing => &self.writing,
        }
    }
}

/// Snapshot of all phases plus their sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub model: Option<String>,
    /// ISO-8601, taken when the report was produced.
    pub timestamp: String,
    pub phases: PhaseBreakdown,
    pub total: PhaseUsage,
}

impl UsageReport {
    pub fn to_json(&self) -> OrchestraResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            PipelineError::new(ErrorCode::Unknown, format!("Failed to encode usage report: {e}"))
        })
    }

    pub fn from_json(json: &str) -> OrchestraResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            PipelineError::new(
                ErrorCode::AiResponseParseFailed,
                format!("Failed to decode usage report: {e}"),
            )
        })
    }
}

// ─── Tracker ────────────────────────────────────────────────────────────────

/// Tracker handle shared between concurrently running call sites.
pub type SharedUsageTracker = Arc<Mutex<UsageTracker>>;

/// Accumulates [`TokenUsage`] per [`Phase`].
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    phases: [PhaseUsage; 4],
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedUsageTracker {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Count one call against `phase`, adding its usage when present.
    ///
    /// A real call supersedes an earlier [`UsageTracker::mark_cached`]: the
    /// phase stops being reported as cached.
    pub fn add_usage(&mut self, phase: Phase, usage: Option<&TokenUsage>) {
        let entry = &mut self.phases[phase.index()];
        entry.cached = false;
        entry.calls += 1;
        if let Some(usage) = usage {
            entry.absorb(usage);
        }
        tracing::trace!(phase = %phase, calls = entry.calls, "usage recorded");
    }

    /// Mark `phase` as served from cache. Counters stay at zero.
    pub fn mark_cached(&mut self, phase: Phase) {
        self.phases[phase.index()] = PhaseUsage {
            cached: true,
            ..PhaseUsage::default()
        };
    }

    pub fn phase_usage(&self, phase: Phase) -> PhaseUsage {
        self.phases[phase.index()].clone()
    }

    /// Element-wise sum over every phase.
    pub fn total(&self) -> PhaseUsage {
        let mut total = PhaseUsage::default();
        for usage in &self.phases {
            total.add(usage);
        }
        total
    }

    pub fn to_report(&self, model: Option<&str>) -> UsageReport {
        UsageReport {
            model: model.map(str::to_string),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            phases: PhaseBreakdown {
                discovery: self.phase_usage(Phase::Discovery),
                consolidation: self.phase_usage(Phase::Consolidation),
                analysis: self.phase_usage(Phase::Analysis),
                writing: self.phase_usage(Phase::Writing),
            },
            total: self.total(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Record into a shared tracker, tolerating a poisoned lock.
pub fn record_shared(tracker: &SharedUsageTracker, phase: Phase, usage: Option<&TokenUsage>) {
    let mut guard = tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.add_usage(phase, usage);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_after_cache_mark_clears_cached() {
        let mut tracker = UsageTracker::new();
        tracker.mark_cached(Phase::Discovery);
        tracker.add_usage(Phase::Discovery, Some(&TokenUsage::new(10, 5)));

        let discovery = tracker.phase_usage(Phase::Discovery);
        assert!(!discovery.cached);
        assert_eq!(discovery.calls, 1);
        assert_eq!(discovery.total_tokens, 15);

        let report = tracker.to_report(None);
        assert!(!report.phases.discovery.cached);
        assert_eq!(report.total.calls, 1);
    }

    fn field_sum(tracker: &UsageTracker) -> (u64, u64, u64, u64, u64, u64) {
        Phase::ALL.iter().fold((0, 0, 0, 0, 0, 0), |acc, p| {
            let u = tracker.phase_usage(*p);
            (
                acc.0 + u.input_tokens,
                acc.1 + u.output_tokens,
                acc.2 + u.cache_read_tokens,
                acc.3 + u.cache_write_tokens,
                acc.4 + u.total_tokens,
                acc.5 + u.calls,
            )
        })
    }

    #[test]
    fn untouched_phase_is_zero() {
        let tracker = UsageTracker::new();
        let usage = tracker.phase_usage(Phase::Writing);
        assert_eq!(usage, PhaseUsage::default());
        assert!(!usage.cached);
        assert!(usage.cost.is_none());
    }

    #[test]
    fn add_usage_counts_calls_without_usage() {
        let mut tracker = UsageTracker::new();
        tracker.add_usage(Phase::Analysis, None);
        tracker.add_usage(Phase::Analysis, None);
        let usage = tracker.phase_usage(Phase::Analysis);
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.total_tokens, 0);
        assert!(usage.cost.is_none());
    }

    #[test]
    fn add_usage_accumulates_counters() {
        let mut tracker = UsageTracker::new();
        let usage = TokenUsage::new(100, 40).with_cache(10, 5).with_total(130);
        tracker.add_usage(Phase::Discovery, Some(&usage));
        tracker.add_usage(Phase::Discovery, Some(&usage));

        let d = tracker.phase_usage(Phase::Discovery);
        assert_eq!(d.calls, 2);
        assert_eq!(d.input_tokens, 200);
        assert_eq!(d.output_tokens, 80);
        assert_eq!(d.cache_read_tokens, 20);
        assert_eq!(d.cache_write_tokens, 10);
        assert_eq!(d.total_tokens, 260);
        assert_eq!(d.turn_count, 2);
    }

    #[test]
    fn cost_stays_null_until_supplied() {
        let mut tracker = UsageTracker::new();
        tracker.add_usage(Phase::Writing, Some(&TokenUsage::new(1, 1)));
        assert!(tracker.total().cost.is_none());

        tracker.add_usage(Phase::Writing, Some(&TokenUsage::new(1, 1).with_cost(0.25)));
        tracker.add_usage(Phase::Analysis, Some(&TokenUsage::new(1, 1).with_cost(0.5)));
        assert_eq!(tracker.phase_usage(Phase::Writing).cost, Some(0.25));
        assert_eq!(tracker.total().cost, Some(0.75));
    }

    #[test]
    fn total_is_field_wise_sum() {
        let mut tracker = UsageTracker::new();
        tracker.add_usage(Phase::Discovery, Some(&TokenUsage::new(5, 7)));
        tracker.add_usage(Phase::Consolidation, Some(&TokenUsage::new(11, 13).with_cache(2, 3)));
        tracker.mark_cached(Phase::Analysis);
        tracker.add_usage(Phase::Writing, None);
        tracker.add_usage(Phase::Writing, Some(&TokenUsage::new(1, 2).with_total(99)));

        let total = tracker.total();
        let sum = field_sum(&tracker);
        assert_eq!(
            (
                total.input_tokens,
                total.output_tokens,
                total.cache_read_tokens,
                total.cache_write_tokens,
                total.total_tokens,
                total.calls
            ),
            sum
        );
        assert!(!total.cached);
    }

    #[test]
    fn mark_cached_zeroes_phase() {
        let mut tracker = UsageTracker::new();
        tracker.add_usage(Phase::Discovery, Some(&TokenUsage::new(10, 10)));
        tracker.mark_cached(Phase::Discovery);

        let d = tracker.phase_usage(Phase::Discovery);
        assert!(d.cached);
        assert_eq!(d.calls, 0);
        assert_eq!(d.total_tokens, 0);
    }

    #[test]
    fn cached_phase_report() {
        let mut tracker = UsageTracker::new();
        tracker.mark_cached(Phase::Discovery);
        let report = tracker.to_report(None);

        assert!(report.phases.discovery.cached);
        assert_eq!(report.phases.discovery.calls, 0);
        assert_eq!(report.phases.discovery.total_tokens, 0);
        assert!(report.model.is_none());
    }

    #[test]
    fn report_includes_every_phase() {
        let tracker = UsageTracker::new();
        let json: serde_json::Value =
            serde_json::from_str(&tracker.to_report(Some("m")).to_json().unwrap()).unwrap();
        for phase in Phase::ALL {
            assert!(json["phases"].get(phase.as_str()).is_some(), "{phase}");
        }
        assert!(json["total"]["cost"].is_null());
        assert_eq!(json["model"], "m");
    }

    #[test]
    fn report_timestamp_is_iso8601() {
        let report = UsageTracker::new().to_report(None);
        assert!(chrono::DateTime::parse_from_rfc3339(&report.timestamp).is_ok());
    }

    #[test]
    fn report_round_trip_with_null_and_numeric_cost() {
        let mut tracker = UsageTracker::new();
        tracker.add_usage(Phase::Analysis, Some(&TokenUsage::new(3, 4).with_cost(0.125)));
        tracker.add_usage(Phase::Writing, Some(&TokenUsage::new(3, 4)));
        tracker.mark_cached(Phase::Discovery);

        let report = tracker.to_report(Some("claude-sonnet"));
        let decoded = UsageReport::from_json(&report.to_json().unwrap()).unwrap();
        assert_eq!(decoded, report);
        assert!(decoded.phases.writing.cost.is_none());
    }

    #[test]
    fn phase_parse_and_display() {
        assert_eq!("analysis".parse::<Phase>().unwrap(), Phase::Analysis);
        assert_eq!(Phase::Consolidation.to_string(), "consolidation");
        assert!("bogus".parse::<Phase>().is_err());
    }

    #[test]
    fn token_usage_defaults_on_decode() {
        let usage: TokenUsage =
            serde_json::from_str(r#"{"inputTokens":1,"outputTokens":2,"totalTokens":3}"#).unwrap();
        assert_eq!(usage.turn_count, 1);
        assert_eq!(usage.cache_read_tokens, 0);
        assert!(usage.cost.is_none());
    }

    #[test]
    fn shared_tracker_records() {
        let shared = UsageTracker::shared();
        record_shared(&shared, Phase::Consolidation, Some(&TokenUsage::new(1, 1)));
        assert_eq!(shared.lock().unwrap().phase_usage(Phase::Consolidation).calls, 1);
    }
}
