//! Counters and duration histograms recorded by the engine.
//!
//! The engine only records at well-defined points (pipeline start/end, step
//! attempt/retry/error, LLM call start/end); aggregation and export belong
//! to the sink implementation.

use crate::llm::TokenUsage;
use dashmap::DashMap;
use std::fmt;
use std::time::Duration;

/// Metric names recorded by the engine.
pub mod names {
    /// Pipeline runs started.
    pub const PIPELINE_EXECUTIONS: &str = "pipeline.executions";
    /// Pipeline runs ending with a failed result.
    pub const PIPELINE_ERRORS: &str = "pipeline.errors";
    /// Step attempts made.
    pub const STEP_EXECUTIONS: &str = "step.executions";
    /// Step retries scheduled.
    pub const STEP_RETRIES: &str = "step.retries";
    /// Steps reaching a failed terminal result.
    pub const STEP_ERRORS: &str = "step.errors";
    /// Generation service calls issued.
    pub const LLM_CALLS: &str = "llm.calls";
    /// Generation service calls that failed.
    pub const LLM_ERRORS: &str = "llm.errors";
    /// Generation service retries scheduled.
    pub const LLM_RETRIES: &str = "llm.retries";
    /// Prompt tokens consumed.
    pub const LLM_TOKENS_INPUT: &str = "llm.tokens.input";
    /// Completion tokens produced.
    pub const LLM_TOKENS_OUTPUT: &str = "llm.tokens.output";
    /// Pipeline wall time.
    pub const PIPELINE_DURATION: &str = "pipeline.duration";
    /// Step wall time, all attempts included.
    pub const STEP_DURATION: &str = "step.duration";
    /// Generation call wall time, all attempts included.
    pub const LLM_DURATION: &str = "llm.duration";
}

/// Label pairs attached to a measurement.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Receives counters and durations.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Adds `value` to a counter.
    fn add(&self, counter: &str, value: u64, labels: Labels<'_>);

    /// Records one observation of a duration histogram.
    fn record_duration(&self, histogram: &str, duration: Duration, labels: Labels<'_>);

    /// Adds one to a counter.
    fn increment(&self, counter: &str, labels: Labels<'_>) {
        self.add(counter, 1, labels);
    }

    /// Records token usage reported by a generation call.
    fn record_tokens(&self, usage: &TokenUsage, labels: Labels<'_>) {
        self.add(names::LLM_TOKENS_INPUT, u64::from(usage.input_tokens), labels);
        self.add(names::LLM_TOKENS_OUTPUT, u64::from(usage.output_tokens), labels);
    }
}

/// Discards every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsSink for NoOpMetrics {
    fn add(&self, _counter: &str, _value: u64, _labels: Labels<'_>) {}

    fn record_duration(&self, _histogram: &str, _duration: Duration, _labels: Labels<'_>) {}
}

/// Keeps every measurement in memory, keyed by metric name.
///
/// Labelled series are kept alongside the per-name totals under keys like
/// `step.retries{step=fetch}`.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    histograms: DashMap<String, Vec<Duration>>,
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    format!("{name}{{{}}}", pairs.join(","))
}

impl InMemoryMetrics {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter total across all label sets.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map_or(0, |v| *v)
    }

    /// Counter value for one exact label set.
    #[must_use]
    pub fn counter_with(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .get(&series_key(name, labels))
            .map_or(0, |v| *v)
    }

    /// All observations of a histogram, across label sets.
    #[must_use]
    pub fn durations(&self, name: &str) -> Vec<Duration> {
        self.histograms
            .get(name)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Sorted counter names that have been touched, labelled series excluded.
    #[must_use]
    pub fn counter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .counters
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| !k.contains('{'))
            .collect();
        names.sort();
        names
    }

    /// Clears everything.
    pub fn reset(&self) {
        self.counters.clear();
        self.histograms.clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn add(&self, counter: &str, value: u64, labels: Labels<'_>) {
        *self.counters.entry(counter.to_string()).or_insert(0) += value;
        if !labels.is_empty() {
            *self.counters.entry(series_key(counter, labels)).or_insert(0) += value;
        }
    }

    fn record_duration(&self, histogram: &str, duration: Duration, labels: Labels<'_>) {
        self.histograms
            .entry(histogram.to_string())
            .or_default()
            .push(duration);
        if !labels.is_empty() {
            self.histograms
                .entry(series_key(histogram, labels))
                .or_default()
                .push(duration);
        }
    }
}
