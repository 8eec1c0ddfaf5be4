//! Generation parameters and session configuration.
//!
//! [`GenerationConfig`] is the only piece of session state that may be read
//! and written from outside the execution lane. Writes that affect the engine
//! are still pushed through the lane by [`crate::InferenceSession`].

use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

pub const TEMPERATURE_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const TOP_P_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const MAX_TOKENS_RANGE: RangeInclusive<usize> = 128..=4096;

/// Default system preamble emitted before the first turn of a session.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Follow these rules:
1. Match user's language (Chinese for Chinese, English for English)
2. Be concise and clear
3. Admit when you don't know something
4. Focus on accuracy and helpfulness";

/// Sampling and length parameters applied to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Softmax temperature, clamped to `[0, 1]`.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling threshold, clamped to `[0, 1]`.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Upper bound on generated tokens, clamped to `[128, 4096]`.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_max_tokens() -> usize {
    2048
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl GenerationConfig {
    /// A copy with every field clamped into its valid range.
    pub fn clamped(&self) -> Self {
        GenerationConfig {
            temperature: clamp_temperature(self.temperature),
            top_p: clamp_top_p(self.top_p),
            max_tokens: clamp_max_tokens(self.max_tokens),
        }
    }
}

pub fn clamp_temperature(value: f32) -> f32 {
    clamp_unit(value, &TEMPERATURE_RANGE)
}

pub fn clamp_top_p(value: f32) -> f32 {
    clamp_unit(value, &TOP_P_RANGE)
}

pub fn clamp_max_tokens(value: usize) -> usize {
    value.clamp(*MAX_TOKENS_RANGE.start(), *MAX_TOKENS_RANGE.end())
}

fn clamp_unit(value: f32, range: &RangeInclusive<f32>) -> f32 {
    // NaN sorts nowhere; treat it as the lower bound.
    if value.is_nan() {
        return *range.start();
    }
    value.clamp(*range.start(), *range.end())
}

/// Thread-safe holder of the current [`GenerationConfig`].
///
/// Values persist across loads and unloads.
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: Mutex<GenerationConfig>,
}

impl ConfigStore {
    pub fn new(initial: GenerationConfig) -> Self {
        ConfigStore {
            current: Mutex::new(initial.clamped()),
        }
    }

    pub fn get(&self) -> GenerationConfig {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `edit` to the stored value and return the clamped result.
    pub fn update(&self, edit: impl FnOnce(&mut GenerationConfig)) -> GenerationConfig {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        edit(&mut current);
        *current = current.clamped();
        *current
    }
}

/// Top-level session configuration, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub generation: GenerationConfig,

    /// System preamble used when a turn does not supply its own.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Name of the execution lane thread.
    #[serde(default = "default_lane_name")]
    pub lane_name: String,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_lane_name() -> String {
    "llm-runloop".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            generation: GenerationConfig::default(),
            system_prompt: default_system_prompt(),
            lane_name: default_lane_name(),
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(data)?;
        if config.lane_name.trim().is_empty() {
            return Err(SessionError::Config("lane_name must not be empty".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_clamps_into_unit_interval() {
        assert_eq!(clamp_temperature(1.3), 1.0);
        assert_eq!(clamp_temperature(-0.2), 0.0);
        assert_eq!(clamp_temperature(0.42), 0.42);
        assert_eq!(clamp_temperature(f32::NAN), 0.0);
    }

    #[test]
    fn top_p_clamps_into_unit_interval() {
        assert_eq!(clamp_top_p(2.0), 1.0);
        assert_eq!(clamp_top_p(0.0), 0.0);
    }

    #[test]
    fn max_tokens_clamps_into_range() {
        assert_eq!(clamp_max_tokens(50), 128);
        assert_eq!(clamp_max_tokens(10_000), 4096);
        assert_eq!(clamp_max_tokens(512), 512);
    }

    #[test]
    fn store_clamps_on_construction_and_update() {
        let store = ConfigStore::new(GenerationConfig {
            temperature: 3.0,
            top_p: 0.5,
            max_tokens: 1,
        });
        assert_eq!(store.get().temperature, 1.0);
        assert_eq!(store.get().max_tokens, 128);

        let updated = store.update(|c| c.max_tokens = 9000);
        assert_eq!(updated.max_tokens, 4096);
        assert_eq!(store.get(), updated);
    }

    #[test]
    fn defaults_match_engine_defaults() {
        let config = GenerationConfig::default();
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.top_p, 0.9);
        assert_eq!(config.max_tokens, 2048);
    }

    #[test]
    fn session_config_fills_missing_fields() {
        let config = SessionConfig::from_json(r#"{"generation": {"temperature": 0.2}}"#).unwrap();
        assert_eq!(config.generation.temperature, 0.2);
        assert_eq!(config.generation.top_p, 0.9);
        assert_eq!(config.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.lane_name, "llm-runloop");
    }

    #[test]
    fn session_config_rejects_blank_lane_name() {
        let err = SessionConfig::from_json(r#"{"lane_name": "  "}"#).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn session_config_reports_malformed_json() {
        let err = SessionConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, SessionError::Json(_)));
    }
}
