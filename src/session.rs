//! High-level inference session management.
//!
//! An [`InferenceSession`] owns one execution lane and everything that runs
//! on it: the native engine, the loaded model, and the state machine around
//! them. It is the single entry point for loading, formatting, generating,
//! and tuning. Share it with `Arc` when several tasks need it; every clone of
//! the `Arc` talks to the same engine.

use std::sync::Arc;

use llama_engine::{NativeEngine, Role};
use llama_runtime::{
    GenerationTimer, HookSet, MetricsCollector, PerformanceMetrics, TracingTelemetry,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::chat::Message;
use crate::config::{ConfigStore, GenerationConfig, SessionConfig};
use crate::engine::lane::ExecutionLane;
use crate::engine::state::{LaneState, Lifecycle};
use crate::engine::{run_on_lane, ActiveSlot, FragmentStream, GenerationRequest};
use crate::error::{Result, SessionError};

/// An inference session over one native engine.
pub struct InferenceSession {
    /// Owns the engine; every engine call runs here.
    lane: Arc<ExecutionLane<LaneState>>,

    /// Current generation parameters.
    config: Arc<ConfigStore>,

    /// Preamble used when `format` gets no override.
    system_prompt: String,

    /// Metrics of the last completed generation.
    metrics: MetricsCollector,

    /// The at-most-one running generation.
    active: Arc<ActiveSlot>,
}

impl InferenceSession {
    /// Spawn the execution lane and build the engine on it.
    ///
    /// `factory` runs on the lane thread, followed by backend initialization.
    pub fn new<E, F>(config: SessionConfig, factory: F) -> Result<Self>
    where
        E: NativeEngine + 'static,
        F: FnOnce() -> E + Send + 'static,
    {
        let lane = ExecutionLane::spawn(&config.lane_name, move || {
            LaneState::bootstrap(Box::new(factory()))
        })?;

        info!(lane = %config.lane_name, "inference session created");
        Ok(InferenceSession {
            lane: Arc::new(lane),
            config: Arc::new(ConfigStore::new(config.generation)),
            system_prompt: config.system_prompt,
            metrics: MetricsCollector::new(),
            active: Arc::new(ActiveSlot::default()),
        })
    }

    /// Load a model and transition to `Loaded`.
    ///
    /// Fails with `AlreadyLoaded` if a model is already resident; the current
    /// handles are left untouched. The current generation config is pushed to
    /// the engine once the handles exist.
    pub async fn load(&self, model_path: impl Into<String>) -> Result<()> {
        let path = model_path.into();
        let config = Arc::clone(&self.config);
        run_on_lane(&self.lane, move |state| state.load(&path, config.get())).await
    }

    /// Release the loaded model. A no-op when nothing is loaded.
    pub async fn unload(&self) -> Result<()> {
        run_on_lane(&self.lane, |state| {
            state.unload();
            Ok(())
        })
        .await
    }

    pub async fn lifecycle(&self) -> Result<Lifecycle> {
        run_on_lane(&self.lane, |state| Ok(state.lifecycle())).await
    }

    /// Whether a model is loaded. A closed lane reports `false`.
    pub async fn is_loaded(&self) -> bool {
        matches!(self.lifecycle().await, Ok(Lifecycle::Loaded))
    }

    /// Render one chat turn for the loaded model.
    ///
    /// The first call after each load prefixes the system turn, using
    /// `system_prompt` when given and the session default otherwise.
    pub async fn format(
        &self,
        role: Role,
        content: &str,
        system_prompt: Option<&str>,
    ) -> Result<String> {
        let content = content.to_string();
        let system = system_prompt.unwrap_or(&self.system_prompt).to_string();
        run_on_lane(&self.lane, move |state| {
            state.format_turn(role, &content, &system)
        })
        .await
    }

    pub async fn format_message(&self, message: &Message) -> Result<String> {
        self.format(message.role, &message.content, None).await
    }

    /// Start a generation for `prompt`.
    ///
    /// Fails with `NotLoaded` when no model is resident and with `Busy` while
    /// another generation's stream is alive. The returned stream is lazy: the
    /// prompt is evaluated on its first poll.
    pub async fn generate(&self, prompt: impl Into<String>) -> Result<FragmentStream> {
        let prompt = prompt.into();
        let timer = GenerationTimer::start(
            &prompt,
            Box::new(HookSet::new(vec![
                Box::new(self.metrics.clone()),
                Box::new(TracingTelemetry),
            ])),
        );

        let guard = self.active.claim(Uuid::new_v4())?;
        if self.lifecycle().await? == Lifecycle::Unloaded {
            return Err(SessionError::NotLoaded);
        }

        let max_tokens = self.config.get().max_tokens;
        Ok(FragmentStream::start(
            Arc::clone(&self.lane),
            GenerationRequest {
                prompt,
                max_tokens,
                timer,
                guard,
            },
        ))
    }

    /// Cancel the running generation, if any. Returns whether one was running.
    pub fn cancel_generation(&self) -> bool {
        self.active.cancel()
    }

    pub fn is_generating(&self) -> bool {
        self.active.is_active()
    }

    /// Set the temperature and push it to the engine. Returns the stored,
    /// clamped value.
    ///
    /// The store is written on the lane, so the engine sees setters in the
    /// same order as the store does.
    pub async fn set_temperature(&self, value: f32) -> Result<f32> {
        let store = Arc::clone(&self.config);
        run_on_lane(&self.lane, move |state| {
            let value = store.update(|c| c.temperature = value).temperature;
            state.set_temperature(value);
            Ok(value)
        })
        .await
    }

    pub async fn set_top_p(&self, value: f32) -> Result<f32> {
        let store = Arc::clone(&self.config);
        run_on_lane(&self.lane, move |state| {
            let value = store.update(|c| c.top_p = value).top_p;
            state.set_top_p(value);
            Ok(value)
        })
        .await
    }

    pub async fn set_max_tokens(&self, value: usize) -> Result<usize> {
        let store = Arc::clone(&self.config);
        run_on_lane(&self.lane, move |state| {
            let value = store.update(|c| c.max_tokens = value).max_tokens;
            state.set_max_tokens(value);
            Ok(value)
        })
        .await
    }

    /// Replace the whole generation config and push every field.
    pub async fn update_config(&self, config: GenerationConfig) -> Result<GenerationConfig> {
        let store = Arc::clone(&self.config);
        run_on_lane(&self.lane, move |state| {
            let config = store.update(|c| *c = config);
            state.apply_config(config);
            Ok(config)
        })
        .await
    }

    pub fn config(&self) -> GenerationConfig {
        self.config.get()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Token capacity of the loaded model's context window.
    pub async fn context_size(&self) -> Result<usize> {
        run_on_lane(&self.lane, |state| state.context_size()).await
    }

    /// Metrics of the most recent completed generation.
    pub fn last_metrics(&self) -> Option<PerformanceMetrics> {
        self.metrics.last_metrics()
    }

    /// Cancel any generation, unload, and stop the lane.
    ///
    /// The lane thread is joined once the last outstanding stream is gone.
    pub async fn shutdown(self) {
        self.cancel_generation();
        if let Err(err) = self.unload().await {
            warn!(error = %err, "unload during shutdown failed");
        }
        match Arc::try_unwrap(self.lane) {
            Ok(lane) => lane.shutdown(),
            Err(_) => info!("lane shutdown deferred to outstanding streams"),
        }
    }
}

impl std::fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("config", &self.config.get())
            .field("generating", &self.is_generating())
            .finish_non_exhaustive()
    }
}
