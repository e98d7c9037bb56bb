//! companion-infer: fixed-window text generation for an in-game companion.
//!
//! Turns a companion state into a short model-written reply: the prompt is
//! tokenized with a byte-level BPE tokenizer, laid into a fixed context
//! buffer, and extended one sampled token per inference step until an
//! end-of-sequence id, the token budget, or a full window stops it.

pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod prompt;
pub mod sampler;
pub mod scheduler;
pub mod tokenizer;

pub use backend::{AsyncInferenceBackend, BackendError, Blocking, InferenceBackend, Logits};
pub use config::{ConfigError, GenerationConfig};
pub use context::{ContextBuffer, ContextError};
pub use engine::{
    CancelHandle, GenerationController, GenerationError, Phase, RejectReason, StopReason,
};
pub use prompt::{CompanionState, PromptTemplates};
pub use sampler::{Sampler, SamplerError};
pub use scheduler::Scheduler;
pub use tokenizer::{TokenId, Tokenizer, TokenizerError};
