//! # llama-engine
//!
//! The "narrow waist" of the llama-session stack. Defines the [`NativeEngine`]
//! trait: the fixed low-level call contract every inference backend exposes
//! to the session manager. Implementations can wrap a C library through FFI,
//! a pure-Rust model, or a scripted test double without the session layer
//! changing.
//!
//! ## Design Notes
//!
//! ### Thread confinement
//! `NativeEngine` is intentionally **not** `Send`. The session manager builds
//! the engine on its execution lane through a factory closure and every call
//! happens on that lane, so native state that is unsafe to touch from more
//! than one thread never has to pretend otherwise.
//!
//! ### Handles
//! Model, context, and sampler handles are opaque `Copy` ids. Constructors
//! reject zero, so a null-sentinel handle cannot exist once wrapped; the
//! sentinel itself is expressed as `None` in the acquisition calls.

use std::fmt;
use std::num::NonZeroU64;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by engine calls that can fail mid-flight.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("tokenization failed: {0}")]
    Tokenization(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("release failed: {0}")]
    Release(String),
}

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Wrap a raw engine value. Returns `None` for the null sentinel (0).
            pub fn new(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map(Self)
            }

            /// The raw value handed out by the engine.
            pub fn raw(self) -> u64 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0.get())
            }
        }
    };
}

opaque_handle!(
    /// Loaded weights instance.
    ModelHandle
);
opaque_handle!(
    /// Per-session engine state: token history and key/value cache.
    ContextHandle
);
opaque_handle!(
    /// Next-token selector configured with temperature and top-p.
    SamplerHandle
);

/// Chat role understood by the engine's turn formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of one completion run inside the context window.
///
/// Created from the value returned by [`NativeEngine::init_completion`] and
/// advanced by the engine on every [`NativeEngine::next_fragment`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationCursor {
    position: usize,
}

impl GenerationCursor {
    pub fn new(position: usize) -> Self {
        Self { position }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn advance(&mut self) {
        self.position += 1;
    }
}

/// The native engine call contract.
///
/// Every method runs on the session manager's execution lane, one call at a
/// time. Acquisition calls return `None` where the underlying library would
/// hand back a null pointer.
pub trait NativeEngine {
    /// One-time backend initialization, run before the first unit of work.
    fn backend_init(&mut self) {}

    /// Backend teardown, run when the execution lane shuts down.
    fn backend_free(&mut self) {}

    /// Build and system information, logged once at bootstrap.
    fn system_info(&self) -> String {
        String::new()
    }

    /// Load model weights from a filesystem path.
    fn load_model(&mut self, path: &str) -> Option<ModelHandle>;

    /// Create an execution context for a loaded model.
    fn new_context(&mut self, model: ModelHandle) -> Option<ContextHandle>;

    /// Create a sampler for a loaded model.
    fn new_sampler(&mut self, model: ModelHandle) -> Option<SamplerHandle>;

    /// Render one chat turn in the model's prompt encoding.
    fn format_turn(&mut self, model: ModelHandle, role: Role, content: &str) -> String;

    /// Total token capacity of the context window.
    fn context_capacity(&self, context: ContextHandle) -> usize;

    /// Evaluate the prompt. Returns the initial cursor position: the number
    /// of tokens now occupying the context window.
    fn init_completion(
        &mut self,
        context: ContextHandle,
        sampler: SamplerHandle,
        text: &str,
        max_tokens: usize,
    ) -> Result<usize>;

    /// Sample and decode one token.
    ///
    /// `Ok(None)` marks the natural end of generation. `Ok(Some(""))` is a
    /// step that produced no printable text yet (for example, a partial
    /// UTF-8 sequence held back until it completes).
    fn next_fragment(
        &mut self,
        context: ContextHandle,
        sampler: SamplerHandle,
        max_tokens: usize,
        cursor: &mut GenerationCursor,
    ) -> Result<Option<String>>;

    /// Drop everything held in the key/value cache.
    fn clear_cache(&mut self, context: ContextHandle);

    fn release_context(&mut self, context: ContextHandle) -> Result<()>;

    fn release_model(&mut self, model: ModelHandle) -> Result<()>;

    fn release_sampler(&mut self, sampler: SamplerHandle) -> Result<()>;

    fn set_temperature(&mut self, temperature: f32);

    fn set_top_p(&mut self, top_p: f32);

    fn set_max_tokens(&mut self, max_tokens: usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_rejected() {
        assert!(ModelHandle::new(0).is_none());
        assert!(ContextHandle::new(0).is_none());
        assert!(SamplerHandle::new(0).is_none());
    }

    #[test]
    fn handle_round_trips_raw_value() {
        let handle = ContextHandle::new(0xdead).unwrap();
        assert_eq!(handle.raw(), 0xdead);
        assert_eq!(handle.to_string(), "0xdead");
    }

    #[test]
    fn cursor_advances_by_one() {
        let mut cursor = GenerationCursor::new(7);
        cursor.advance();
        cursor.advance();
        assert_eq!(cursor.position(), 9);
    }

    #[test]
    fn role_names() {
        assert_eq!(Role::System.as_str(), "system");
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }
}
