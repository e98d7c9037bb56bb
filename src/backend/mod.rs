//! Inference backend traits and implementations.
//!
//! The backend trait is the cutpoint between the generation controller and
//! the numeric model. The controller never assumes a concrete backend: it
//! hands over the context buffer each step and gets raw logits back. Any
//! backend that implements [`InferenceBackend`] (blocking) or
//! [`AsyncInferenceBackend`] (completes across several host ticks) can drive
//! a session; a stub is enough for tests.

pub mod llama_cpp;

use crate::context::ContextBuffer;
use thiserror::Error;

/// Errors from inference backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("inference backend is not ready")]
    InferenceUnavailable,

    #[error(
        "logits shape mismatch: expected {expected_rows} x {expected_vocab}, \
         got {rows} x {vocab} ({len} values)"
    )]
    OutputShapeMismatch {
        expected_rows: usize,
        expected_vocab: usize,
        rows: usize,
        vocab: usize,
        len: usize,
    },

    #[error("inference error: {0}")]
    Inference(String),
}

/// Static model configuration (read from model metadata).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Number of logits per position.
    pub vocab_size: usize,
    /// Context window the model was loaded with.
    pub max_seq_len: usize,
    /// Model name/path for display.
    pub name: String,
}

/// Raw, unnormalized model scores.
///
/// Stored flat as `rows x vocab`. A backend may return one row (the last
/// occupied position only) or one row per buffer position.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    data: Vec<f32>,
    rows: usize,
    vocab: usize,
}

impl Logits {
    /// Wrap a flat `rows x vocab` tensor.
    pub fn new(data: Vec<f32>, rows: usize, vocab: usize) -> Result<Self, BackendError> {
        if rows == 0 || vocab == 0 || data.len() != rows * vocab {
            return Err(BackendError::OutputShapeMismatch {
                expected_rows: rows,
                expected_vocab: vocab,
                rows,
                vocab,
                len: data.len(),
            });
        }
        Ok(Self { data, rows, vocab })
    }

    /// A single row of logits for the last occupied position.
    pub fn last_position(data: Vec<f32>) -> Self {
        let vocab = data.len();
        Self {
            data,
            rows: 1,
            vocab,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab
    }

    pub fn row(&self, i: usize) -> Option<&[f32]> {
        if i >= self.rows {
            return None;
        }
        Some(&self.data[i * self.vocab..(i + 1) * self.vocab])
    }

    /// Check the shape against the session's vocab size and window.
    ///
    /// Valid shapes are `1 x vocab_size` and `capacity x vocab_size`.
    pub fn check_shape(&self, vocab_size: usize, capacity: usize) -> Result<(), BackendError> {
        let rows_ok = self.rows == 1 || self.rows == capacity;
        if rows_ok && self.vocab == vocab_size {
            return Ok(());
        }
        Err(BackendError::OutputShapeMismatch {
            expected_rows: if self.rows == 1 { 1 } else { capacity },
            expected_vocab: vocab_size,
            rows: self.rows,
            vocab: self.vocab,
            len: self.data.len(),
        })
    }

    /// Scores for buffer position `pos`.
    ///
    /// Single-row logits already belong to the last occupied position.
    pub fn at_position(&self, pos: usize) -> Option<&[f32]> {
        if self.rows == 1 {
            self.row(0)
        } else {
            self.row(pos)
        }
    }
}

/// The blocking backend contract.
///
/// Implementations must not keep references to the buffer beyond the call.
pub trait InferenceBackend {
    /// Number of logits per position.
    fn vocab_size(&self) -> usize;

    /// Whether the backend can accept a call right now.
    fn is_ready(&self) -> bool {
        true
    }

    /// Run the model over the whole window and return logits.
    fn infer(&mut self, input: &ContextBuffer) -> Result<Logits, BackendError>;
}

/// The asynchronous backend contract, for device-bound calls that complete
/// over several host ticks.
#[allow(async_fn_in_trait)]
pub trait AsyncInferenceBackend {
    fn vocab_size(&self) -> usize;

    fn is_ready(&self) -> bool {
        true
    }

    async fn infer(&mut self, input: &ContextBuffer) -> Result<Logits, BackendError>;
}

/// Drive a blocking backend through the async scheduler.
pub struct Blocking<B>(pub B);

impl<B: InferenceBackend> AsyncInferenceBackend for Blocking<B> {
    fn vocab_size(&self) -> usize {
        self.0.vocab_size()
    }

    fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    async fn infer(&mut self, input: &ContextBuffer) -> Result<Logits, BackendError> {
        self.0.infer(input)
    }
}
