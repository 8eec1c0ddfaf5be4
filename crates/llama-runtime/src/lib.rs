//! # llama-runtime
//!
//! Runtime telemetry for llama-session: per-generation timing, fragment
//! counts, prompt size estimates, and process memory, plus hooks for
//! reporting them as they happen.

pub mod memory;
pub mod telemetry;

pub use memory::resident_memory_mb;
pub use telemetry::{
    estimate_input_tokens, GenerationTimer, HookSet, MetricsCollector, NoopTelemetry,
    PerformanceMetrics, TelemetryHook, TracingTelemetry,
};
