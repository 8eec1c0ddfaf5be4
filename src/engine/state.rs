//! Engine state owned by the execution lane.
//!
//! Every method here runs on the lane thread. [`LaneState`] holds the engine
//! and the `Unloaded`/`Loaded` state machine; the handles inside
//! [`SessionState::Loaded`] exist together or not at all.

use std::mem;
use std::panic::{self, AssertUnwindSafe};

use llama_engine::{
    ContextHandle, GenerationCursor, ModelHandle, NativeEngine, Role, SamplerHandle,
};
use tracing::{debug, info, warn};

use crate::chat;
use crate::config::GenerationConfig;
use crate::error::{InitStage, Result, SessionError};

/// Externally visible lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unloaded,
    Loaded,
}

/// Handles owned by a loaded session.
#[derive(Debug)]
pub(crate) struct LoadedModel {
    pub(crate) model: ModelHandle,
    pub(crate) context: ContextHandle,
    pub(crate) sampler: SamplerHandle,
    /// Distinguishes this load from earlier ones with recycled handles.
    pub(crate) epoch: u64,
    pub(crate) preamble_sent: bool,
}

#[derive(Debug)]
pub(crate) enum SessionState {
    Unloaded,
    Loaded(LoadedModel),
}

/// Result of evaluating a prompt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CompletionStart {
    pub(crate) epoch: u64,
    pub(crate) cursor: GenerationCursor,
    /// Tokens the context window can still take.
    pub(crate) remaining: usize,
}

pub(crate) struct LaneState {
    engine: Box<dyn NativeEngine>,
    session: SessionState,
    next_epoch: u64,
}

impl LaneState {
    /// Initialize the backend and take ownership of the engine.
    pub(crate) fn bootstrap(mut engine: Box<dyn NativeEngine>) -> Self {
        engine.backend_init();
        info!(system_info = %engine.system_info(), "native backend initialized");
        LaneState {
            engine,
            session: SessionState::Unloaded,
            next_epoch: 1,
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        match self.session {
            SessionState::Unloaded => Lifecycle::Unloaded,
            SessionState::Loaded(_) => Lifecycle::Loaded,
        }
    }

    /// Acquire model, context, and sampler, then push `config` to the engine.
    ///
    /// On failure nothing stays acquired and the state remains `Unloaded`.
    /// A panicking acquisition releases the earlier handles before the panic
    /// continues to the lane.
    pub(crate) fn load(&mut self, path: &str, config: GenerationConfig) -> Result<()> {
        if let SessionState::Loaded(_) = self.session {
            return Err(SessionError::AlreadyLoaded);
        }

        let model = self
            .engine
            .load_model(path)
            .ok_or(SessionError::EngineInit(InitStage::Model))?;

        let context = self.acquire_or_rollback(
            |engine| engine.new_context(model),
            |state| state.release_model(model),
        );
        let Some(context) = context else {
            self.release_model(model);
            return Err(SessionError::EngineInit(InitStage::Context));
        };

        let sampler = self.acquire_or_rollback(
            |engine| engine.new_sampler(model),
            |state| {
                state.release_context(context);
                state.release_model(model);
            },
        );
        let Some(sampler) = sampler else {
            self.release_context(context);
            self.release_model(model);
            return Err(SessionError::EngineInit(InitStage::Sampler));
        };

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.session = SessionState::Loaded(LoadedModel {
            model,
            context,
            sampler,
            epoch,
            preamble_sent: false,
        });
        self.apply_config(config);

        info!(path, %model, %context, %sampler, epoch, "model loaded");
        Ok(())
    }

    /// Release every handle. Returns whether anything was loaded.
    ///
    /// Release failures are logged and do not stop the remaining releases.
    pub(crate) fn unload(&mut self) -> bool {
        let SessionState::Loaded(loaded) = mem::replace(&mut self.session, SessionState::Unloaded)
        else {
            debug!("unload requested with no model loaded");
            return false;
        };

        self.release_context(loaded.context);
        self.release_model(loaded.model);
        self.release_sampler(loaded.sampler);
        info!(epoch = loaded.epoch, "model unloaded");
        true
    }

    pub(crate) fn apply_config(&mut self, config: GenerationConfig) {
        self.set_temperature(config.temperature);
        self.set_top_p(config.top_p);
        self.set_max_tokens(config.max_tokens);
    }

    pub(crate) fn set_temperature(&mut self, value: f32) {
        self.engine.set_temperature(value);
        info!(temperature = value, "temperature set");
    }

    pub(crate) fn set_top_p(&mut self, value: f32) {
        self.engine.set_top_p(value);
        info!(top_p = value, "top-p set");
    }

    pub(crate) fn set_max_tokens(&mut self, value: usize) {
        self.engine.set_max_tokens(value);
        info!(max_tokens = value, "max tokens set");
    }

    /// Render one chat turn; the first turn of a load carries the preamble.
    pub(crate) fn format_turn(
        &mut self,
        role: Role,
        content: &str,
        system_prompt: &str,
    ) -> Result<String> {
        let SessionState::Loaded(loaded) = &mut self.session else {
            return Err(SessionError::NotLoaded);
        };
        Ok(chat::render_turn(
            self.engine.as_mut(),
            loaded,
            role,
            content,
            system_prompt,
        ))
    }

    pub(crate) fn context_size(&self) -> Result<usize> {
        let loaded = self.loaded()?;
        Ok(self.engine.context_capacity(loaded.context))
    }

    /// Evaluate `prompt` and size the remaining context window.
    ///
    /// A failed evaluation clears the key/value cache before returning.
    pub(crate) fn begin_completion(
        &mut self,
        prompt: &str,
        max_tokens: usize,
    ) -> Result<CompletionStart> {
        let (epoch, context, sampler) = {
            let loaded = self.loaded()?;
            (loaded.epoch, loaded.context, loaded.sampler)
        };

        match self
            .engine
            .init_completion(context, sampler, prompt, max_tokens)
        {
            Ok(position) => {
                let capacity = self.engine.context_capacity(context);
                Ok(CompletionStart {
                    epoch,
                    cursor: GenerationCursor::new(position),
                    remaining: capacity.saturating_sub(position),
                })
            }
            Err(err) => {
                self.engine.clear_cache(context);
                Err(err.into())
            }
        }
    }

    /// Produce the next fragment of the completion started in `epoch`.
    ///
    /// Fails with `NotLoaded` if the model was unloaded or replaced since.
    /// A failed step clears the key/value cache before returning.
    pub(crate) fn next_fragment(
        &mut self,
        epoch: u64,
        cursor: &mut GenerationCursor,
        max_tokens: usize,
    ) -> Result<Option<String>> {
        let (context, sampler) = match &self.session {
            SessionState::Loaded(loaded) if loaded.epoch == epoch => {
                (loaded.context, loaded.sampler)
            }
            _ => return Err(SessionError::NotLoaded),
        };

        self.engine
            .next_fragment(context, sampler, max_tokens, cursor)
            .map_err(|err| {
                self.engine.clear_cache(context);
                err.into()
            })
    }

    /// Clear the cache if `epoch` is still the loaded session.
    pub(crate) fn clear_cache(&mut self, epoch: u64) {
        if let SessionState::Loaded(loaded) = &self.session {
            if loaded.epoch == epoch {
                self.engine.clear_cache(loaded.context);
            }
        }
    }

    /// Clear the cache of whatever session is loaded.
    pub(crate) fn clear_current_cache(&mut self) {
        if let SessionState::Loaded(loaded) = &self.session {
            self.engine.clear_cache(loaded.context);
        }
    }

    /// Run `acquire`; if it panics, run `rollback` and resume unwinding.
    fn acquire_or_rollback<T>(
        &mut self,
        acquire: impl FnOnce(&mut dyn NativeEngine) -> T,
        rollback: impl FnOnce(&mut Self),
    ) -> T {
        match panic::catch_unwind(AssertUnwindSafe(|| acquire(self.engine.as_mut()))) {
            Ok(value) => value,
            Err(payload) => {
                rollback(self);
                panic::resume_unwind(payload)
            }
        }
    }

    fn loaded(&self) -> Result<&LoadedModel> {
        match &self.session {
            SessionState::Loaded(loaded) => Ok(loaded),
            SessionState::Unloaded => Err(SessionError::NotLoaded),
        }
    }

    fn release_context(&mut self, context: ContextHandle) {
        if let Err(err) = self.engine.release_context(context) {
            warn!(%context, error = %err, "failed to release context");
        }
    }

    fn release_model(&mut self, model: ModelHandle) {
        if let Err(err) = self.engine.release_model(model) {
            warn!(%model, error = %err, "failed to release model");
        }
    }

    fn release_sampler(&mut self, sampler: SamplerHandle) {
        if let Err(err) = self.engine.release_sampler(sampler) {
            warn!(%sampler, error = %err, "failed to release sampler");
        }
    }
}

impl Drop for LaneState {
    fn drop(&mut self) {
        self.unload();
        self.engine.backend_free();
        debug!("native backend freed");
    }
}
