//! # llama-cli
//!
//! Deterministic demo backend for driving llama-session end to end without a
//! native library.
//!
//! [`EchoEngine`] speaks the Llama 3 chat encoding, counts whitespace-split
//! words as tokens, keeps a per-context key/value budget, and answers every
//! completion by replaying the words of the last user turn.

use std::collections::{HashMap, HashSet, VecDeque};

use llama_engine::{
    ContextHandle, EngineError, GenerationCursor, ModelHandle, NativeEngine, Result, Role,
    SamplerHandle,
};

/// Llama 3 chat control tokens.
pub mod special_tokens {
    pub const START_HEADER: &str = "<|start_header_id|>";
    pub const END_HEADER: &str = "<|end_header_id|>";
    pub const EOT: &str = "<|eot_id|>";
}

use special_tokens::{END_HEADER, EOT, START_HEADER};

pub const DEFAULT_CONTEXT_SIZE: usize = 2048;

/// Per-context state: tokens held in the cache and the queued reply.
#[derive(Debug, Default)]
struct ContextState {
    used: usize,
    reply: VecDeque<String>,
}

/// Sampling parameters as last pushed by the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
}

/// Word-level engine that echoes the user.
#[derive(Debug)]
pub struct EchoEngine {
    context_size: usize,
    next_handle: u64,
    models: HashSet<ModelHandle>,
    samplers: HashSet<SamplerHandle>,
    contexts: HashMap<ContextHandle, ContextState>,
    params: EchoParams,
}

impl EchoEngine {
    pub fn new(context_size: usize) -> Self {
        EchoEngine {
            context_size,
            next_handle: 0,
            models: HashSet::new(),
            samplers: HashSet::new(),
            contexts: HashMap::new(),
            params: EchoParams {
                temperature: 0.0,
                top_p: 0.0,
                max_tokens: 0,
            },
        }
    }

    pub fn params(&self) -> EchoParams {
        self.params
    }

    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_SIZE)
    }
}

/// Number of tokens `text` occupies.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Content of the last user turn in a Llama 3 encoded prompt, or the whole
/// prompt when it carries no headers.
pub fn last_user_turn(prompt: &str) -> &str {
    let header = format!("{START_HEADER}{}{END_HEADER}", Role::User);
    match prompt.rfind(&header) {
        Some(start) => {
            let body = &prompt[start + header.len()..];
            let end = body.find(EOT).unwrap_or(body.len());
            body[..end].trim()
        }
        None => prompt.trim(),
    }
}

impl NativeEngine for EchoEngine {
    fn system_info(&self) -> String {
        format!("echo engine | n_ctx = {}", self.context_size)
    }

    fn load_model(&mut self, path: &str) -> Option<ModelHandle> {
        if path.trim().is_empty() {
            return None;
        }
        let model = ModelHandle::new(self.next_raw())?;
        self.models.insert(model);
        tracing::debug!(path, %model, "echo model loaded");
        Some(model)
    }

    fn new_context(&mut self, model: ModelHandle) -> Option<ContextHandle> {
        if !self.models.contains(&model) || self.context_size == 0 {
            return None;
        }
        let context = ContextHandle::new(self.next_raw())?;
        self.contexts.insert(context, ContextState::default());
        Some(context)
    }

    fn new_sampler(&mut self, model: ModelHandle) -> Option<SamplerHandle> {
        if !self.models.contains(&model) {
            return None;
        }
        let sampler = SamplerHandle::new(self.next_raw())?;
        self.samplers.insert(sampler);
        Some(sampler)
    }

    fn format_turn(&mut self, _model: ModelHandle, role: Role, content: &str) -> String {
        format!("{START_HEADER}{role}{END_HEADER}\n\n{content}{EOT}")
    }

    fn context_capacity(&self, _context: ContextHandle) -> usize {
        self.context_size
    }

    fn init_completion(
        &mut self,
        context: ContextHandle,
        _sampler: SamplerHandle,
        text: &str,
        max_tokens: usize,
    ) -> Result<usize> {
        let capacity = self.context_size;
        let state = self
            .contexts
            .get_mut(&context)
            .ok_or_else(|| EngineError::Inference(format!("unknown context {context}")))?;

        let position = state.used + count_tokens(text);
        if position > capacity {
            return Err(EngineError::Tokenization(format!(
                "prompt needs {position} tokens, context holds {capacity}"
            )));
        }

        state.used = position;
        state.reply = last_user_turn(text)
            .split_whitespace()
            .take(max_tokens)
            .enumerate()
            .map(|(i, word)| if i == 0 { word.to_string() } else { format!(" {word}") })
            .collect();
        Ok(position)
    }

    fn next_fragment(
        &mut self,
        context: ContextHandle,
        _sampler: SamplerHandle,
        _max_tokens: usize,
        cursor: &mut GenerationCursor,
    ) -> Result<Option<String>> {
        let state = self
            .contexts
            .get_mut(&context)
            .ok_or_else(|| EngineError::Decode(format!("unknown context {context}")))?;

        match state.reply.pop_front() {
            Some(fragment) => {
                cursor.advance();
                state.used = cursor.position();
                Ok(Some(fragment))
            }
            None => Ok(None),
        }
    }

    fn clear_cache(&mut self, context: ContextHandle) {
        if let Some(state) = self.contexts.get_mut(&context) {
            *state = ContextState::default();
        }
    }

    fn release_context(&mut self, context: ContextHandle) -> Result<()> {
        self.contexts
            .remove(&context)
            .map(|_| ())
            .ok_or_else(|| EngineError::Release(format!("unknown context {context}")))
    }

    fn release_model(&mut self, model: ModelHandle) -> Result<()> {
        if self.models.remove(&model) {
            Ok(())
        } else {
            Err(EngineError::Release(format!("unknown model {model}")))
        }
    }

    fn release_sampler(&mut self, sampler: SamplerHandle) -> Result<()> {
        if self.samplers.remove(&sampler) {
            Ok(())
        } else {
            Err(EngineError::Release(format!("unknown sampler {sampler}")))
        }
    }

    fn set_temperature(&mut self, temperature: f32) {
        self.params.temperature = temperature;
    }

    fn set_top_p(&mut self, top_p: f32) {
        self.params.top_p = top_p;
    }

    fn set_max_tokens(&mut self, max_tokens: usize) {
        self.params.max_tokens = max_tokens;
    }
}
