//! # llama-session
//!
//! Session manager for on-device LLM inference. Wraps a [`NativeEngine`] in
//! a single-owner execution lane and exposes an async API for loading a
//! model, formatting chat turns, streaming generations, tuning sampling
//! parameters, and reading per-generation metrics.
//!
//! ```no_run
//! # async fn demo<E: llama_engine::NativeEngine + Send + 'static>(engine: E) -> llama_session::Result<()> {
//! use futures::StreamExt;
//! use llama_session::{InferenceSession, Role, SessionConfig};
//!
//! let session = InferenceSession::new(SessionConfig::default(), move || engine)?;
//! session.load("/models/llama-3.2-1b.gguf").await?;
//!
//! let prompt = session.format(Role::User, "Hello!", None).await?;
//! let mut stream = session.generate(prompt).await?;
//! while let Some(fragment) = stream.next().await {
//!     print!("{}", fragment?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;

pub use chat::Message;
pub use config::{GenerationConfig, SessionConfig, DEFAULT_SYSTEM_PROMPT};
pub use engine::state::Lifecycle;
pub use engine::{FragmentStream, StreamStatus};
pub use error::{InitStage, LaneError, Result, SessionError};
pub use llama_engine::{NativeEngine, Role};
pub use llama_runtime::PerformanceMetrics;
pub use session::InferenceSession;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
