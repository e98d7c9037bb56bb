//! Generation settings.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::prompt::CompanionState;
use crate::sampler::{validate_temperature, SamplerError};
use crate::tokenizer::TokenId;

/// Configuration errors. All are fatal at construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error("max_sequence_length must be at least 2, got {0}")]
    CapacityTooSmall(usize),

    #[error("no prompt template for state {0}")]
    MissingTemplate(CompanionState),

    #[error("assistant marker must not be empty")]
    EmptyAssistantMarker,

    #[error("invalid generation config: {0}")]
    Parse(String),
}

/// Settings for one generation controller.
///
/// Missing fields fall back to [`GenerationConfig::default`] when
/// deserializing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Softmax temperature. Must be > 0.
    pub temperature: f32,
    /// Generated-token budget per session.
    pub max_generated_tokens: usize,
    /// Context window size (prompt + generated).
    pub max_sequence_length: usize,
    /// Any of these ids ends the session.
    pub eos_token_ids: Vec<TokenId>,
    /// Id written into unoccupied buffer positions.
    pub pad_token_id: TokenId,
    /// Pins the logits width. Defaults to what the backend reports.
    pub vocab_size: Option<usize>,
    /// Fixed seed for the sampler; OS entropy when absent.
    pub seed: Option<u64>,
    /// Per-step inference deadline in milliseconds.
    pub step_deadline_ms: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            max_generated_tokens: 64,
            max_sequence_length: 128,
            // Phi-3: <|endoftext|>, <|assistant|>, <|end|>
            eos_token_ids: vec![32000, 32001, 32007],
            pad_token_id: 0,
            vocab_size: None,
            seed: None,
            step_deadline_ms: None,
        }
    }
}

impl GenerationConfig {
    /// Parse from JSON and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_temperature(self.temperature)?;
        if self.max_sequence_length < 2 {
            return Err(ConfigError::CapacityTooSmall(self.max_sequence_length));
        }
        Ok(())
    }

    pub fn step_deadline(&self) -> Option<Duration> {
        self.step_deadline_ms.map(Duration::from_millis)
    }
}
