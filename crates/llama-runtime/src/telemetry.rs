//! Telemetry hooks for generation performance measurement.
//!
//! Provides:
//! - [`PerformanceMetrics`]: duration, fragment count, token estimate, memory
//! - [`TelemetryHook`] trait: callback interface for real-time metric reporting
//! - [`GenerationTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`TracingTelemetry`] / [`MetricsCollector`]: built-in hooks

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::memory::resident_memory_mb;

/// Rough characters-per-token ratio used for the input estimate.
const CHARS_PER_TOKEN: usize = 4;

/// Snapshot of the most recently completed generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Approximate prompt size in tokens (characters / 4).
    pub input_token_estimate: usize,
    /// Number of fragments emitted to the stream.
    pub output_token_count: usize,
    /// Wall-clock time from the `generate` call to stream completion.
    pub duration_ms: u64,
    /// Resident memory of the process at completion, in MiB.
    pub memory_usage_mb: u64,
    /// Time from the `generate` call until the prompt was evaluated.
    pub time_to_first_fragment_ms: f64,
    /// Emitted fragments per second over the whole call.
    pub tokens_per_second: f64,
    pub completed_at: DateTime<Utc>,
}

/// Approximate token count of a prompt.
pub fn estimate_input_tokens(prompt: &str) -> usize {
    prompt.chars().count() / CHARS_PER_TOKEN
}

/// Callback trait for real-time generation telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called once the prompt has been evaluated.
    fn on_prefill_complete(&self, _ttft_ms: f64) {}

    /// Called after each emitted fragment.
    fn on_fragment(&self, _fragment_idx: usize, _elapsed_ms: f64) {}

    /// Called when a generation finishes successfully.
    fn on_generation_complete(&self, _metrics: &PerformanceMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Logs a completion summary through `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_prefill_complete(&self, ttft_ms: f64) {
        tracing::debug!(ttft_ms, "prompt evaluated");
    }

    fn on_generation_complete(&self, metrics: &PerformanceMetrics) {
        tracing::info!(
            duration_ms = metrics.duration_ms,
            output_tokens = metrics.output_token_count,
            input_tokens = metrics.input_token_estimate,
            tokens_per_second = metrics.tokens_per_second,
            memory_mb = metrics.memory_usage_mb,
            "generation complete"
        );
    }
}

/// Retains the latest completed generation's metrics.
///
/// Each completion replaces the previous snapshot wholesale.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    last_report: Arc<Mutex<Option<PerformanceMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the last completed generation's metrics.
    pub fn last_metrics(&self) -> Option<PerformanceMetrics> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn record(&self, metrics: PerformanceMetrics) {
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics);
    }
}

impl TelemetryHook for MetricsCollector {
    fn on_generation_complete(&self, metrics: &PerformanceMetrics) {
        self.record(metrics.clone());
    }
}

/// Fans events out to several hooks in order.
pub struct HookSet(Vec<Box<dyn TelemetryHook>>);

impl HookSet {
    pub fn new(hooks: Vec<Box<dyn TelemetryHook>>) -> Self {
        Self(hooks)
    }
}

impl TelemetryHook for HookSet {
    fn on_prefill_complete(&self, ttft_ms: f64) {
        self.0.iter().for_each(|h| h.on_prefill_complete(ttft_ms));
    }

    fn on_fragment(&self, fragment_idx: usize, elapsed_ms: f64) {
        self.0
            .iter()
            .for_each(|h| h.on_fragment(fragment_idx, elapsed_ms));
    }

    fn on_generation_complete(&self, metrics: &PerformanceMetrics) {
        self.0.iter().for_each(|h| h.on_generation_complete(metrics));
    }
}

/// Records timestamps during a generation to compute [`PerformanceMetrics`].
///
/// Usage:
/// 1. Call [`GenerationTimer::start`] when `generate` is invoked
/// 2. Call [`mark_prefill_complete`] after the prompt is evaluated
/// 3. Call [`mark_fragment`] after each emitted fragment
/// 4. Call [`finish`] on successful completion
///
/// A timer dropped without `finish` reports nothing.
///
/// [`mark_prefill_complete`]: GenerationTimer::mark_prefill_complete
/// [`mark_fragment`]: GenerationTimer::mark_fragment
/// [`finish`]: GenerationTimer::finish
pub struct GenerationTimer {
    input_token_estimate: usize,
    start: Instant,
    prefill_end: Option<Instant>,
    fragment_count: usize,
    hook: Box<dyn TelemetryHook>,
}

impl GenerationTimer {
    pub fn start(prompt: &str, hook: Box<dyn TelemetryHook>) -> Self {
        Self {
            input_token_estimate: estimate_input_tokens(prompt),
            start: Instant::now(),
            prefill_end: None,
            fragment_count: 0,
            hook,
        }
    }

    /// Mark prompt evaluation complete. Fires `on_prefill_complete`.
    pub fn mark_prefill_complete(&mut self) {
        let now = Instant::now();
        self.prefill_end = Some(now);
        let ttft_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook.on_prefill_complete(ttft_ms);
    }

    /// Mark a fragment emitted. Fires `on_fragment`.
    pub fn mark_fragment(&mut self) {
        self.fragment_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_fragment(self.fragment_count, elapsed_ms);
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    /// Finalize and return metrics. Fires `on_generation_complete`.
    pub fn finish(self) -> PerformanceMetrics {
        let elapsed = self.start.elapsed();
        let total_secs = elapsed.as_secs_f64();

        let time_to_first_fragment_ms = self
            .prefill_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let tokens_per_second = if total_secs > 0.0 && self.fragment_count > 0 {
            self.fragment_count as f64 / total_secs
        } else {
            0.0
        };

        let metrics = PerformanceMetrics {
            input_token_estimate: self.input_token_estimate,
            output_token_count: self.fragment_count,
            duration_ms: elapsed.as_millis() as u64,
            memory_usage_mb: resident_memory_mb(),
            time_to_first_fragment_ms,
            tokens_per_second,
            completed_at: Utc::now(),
        };

        self.hook.on_generation_complete(&metrics);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metrics(output: usize) -> PerformanceMetrics {
        PerformanceMetrics {
            input_token_estimate: 3,
            output_token_count: output,
            duration_ms: 120,
            memory_usage_mb: 64,
            time_to_first_fragment_ms: 10.0,
            tokens_per_second: 25.0,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn noop_telemetry_compiles_and_runs() {
        let hook = NoopTelemetry;
        hook.on_prefill_complete(10.0);
        hook.on_fragment(1, 15.0);
        hook.on_generation_complete(&sample_metrics(2));
    }

    #[test]
    fn collector_starts_empty() {
        assert!(MetricsCollector::new().last_metrics().is_none());
    }

    #[test]
    fn collector_overwrites_previous_snapshot() {
        let collector = MetricsCollector::new();
        collector.on_generation_complete(&sample_metrics(8));
        collector.on_generation_complete(&sample_metrics(2));

        let captured = collector.last_metrics().unwrap();
        assert_eq!(captured.output_token_count, 2);
    }

    #[test]
    fn collector_clones_share_storage() {
        let collector = MetricsCollector::new();
        let observer = collector.clone();
        collector.record(sample_metrics(5));
        assert_eq!(observer.last_metrics().unwrap().output_token_count, 5);
    }

    #[test]
    fn timer_counts_fragments() {
        let mut timer = GenerationTimer::start("abcdefghijkl", Box::new(NoopTelemetry));
        timer.mark_prefill_complete();
        timer.mark_fragment();
        timer.mark_fragment();
        timer.mark_fragment();

        let metrics = timer.finish();
        assert_eq!(metrics.output_token_count, 3);
        assert_eq!(metrics.input_token_estimate, 3);
        assert!(metrics.time_to_first_fragment_ms >= 0.0);
    }

    #[test]
    fn timer_fires_completion_hook() {
        let collector = MetricsCollector::new();
        let mut timer = GenerationTimer::start("hi", Box::new(collector.clone()));
        timer.mark_fragment();
        let metrics = timer.finish();

        assert_eq!(collector.last_metrics(), Some(metrics));
    }

    #[test]
    fn timer_without_prefill_mark() {
        let timer = GenerationTimer::start("", Box::new(NoopTelemetry));
        let metrics = timer.finish();
        assert_eq!(metrics.time_to_first_fragment_ms, 0.0);
        assert_eq!(metrics.output_token_count, 0);
        assert_eq!(metrics.tokens_per_second, 0.0);
    }

    #[test]
    fn hook_set_reaches_every_hook() {
        let first = MetricsCollector::new();
        let second = MetricsCollector::new();
        let set = HookSet::new(vec![
            Box::new(first.clone()),
            Box::new(TracingTelemetry),
            Box::new(second.clone()),
        ]);
        set.on_generation_complete(&sample_metrics(4));

        assert_eq!(first.last_metrics().unwrap().output_token_count, 4);
        assert_eq!(second.last_metrics().unwrap().output_token_count, 4);
    }

    #[test]
    fn input_estimate_counts_chars() {
        assert_eq!(estimate_input_tokens(""), 0);
        assert_eq!(estimate_input_tokens("abc"), 0);
        assert_eq!(estimate_input_tokens("héllo wörld!"), 3);
    }

    #[test]
    fn metrics_serialize_field_names() {
        let json = serde_json::to_value(sample_metrics(1)).unwrap();
        assert_eq!(json["output_token_count"], 1);
        assert_eq!(json["duration_ms"], 120);
        assert!(json.get("completed_at").is_some());
    }
}
