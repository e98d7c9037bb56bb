//! Generation controller: the session state machine.
//!
//! Owns one generation session at a time: prompt encoding, the fixed context
//! buffer, stepwise inference, sampling, termination and incremental decode.
//! You start a session, advance it with `step()` (or the scheduler), and poll
//! the status surface from the host loop.
//!
//! ```ignore
//! let mut controller = GenerationController::new(tokenizer, GenerationConfig::default())?;
//! controller.generate(CompanionState::Follow)?;
//!
//! while controller.is_generating() {
//!     controller.step(&mut backend)?;
//!     // poll controller.last_response() for streaming display
//! }
//!
//! let reply = controller.result();
//! ```
//!
//! A step can also be split around an asynchronously completed backend call
//! with `begin_step()` / `complete_step()`; the ticket returned by
//! `begin_step` ties the call to its session so late results from a
//! cancelled or superseded session are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::backend::{BackendError, InferenceBackend, Logits};
use crate::config::{ConfigError, GenerationConfig};
use crate::context::{ContextBuffer, ContextError};
use crate::prompt::{CompanionState, PromptTemplates};
use crate::sampler::{Sampler, SamplerError};
use crate::tokenizer::{TokenId, Tokenizer, TokenizerError};

/// Errors surfaced by the controller.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("no generation session has been started")]
    NoSession,

    #[error("an inference step is already in flight")]
    StepInFlight,

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why a session stopped. These are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The model sampled an end-of-sequence id.
    EndOfSequence,
    /// The generated-token budget was used up.
    MaxTokensReached,
    /// History filled the whole context window.
    ContextFull,
    Cancelled,
    /// An inference step overran its deadline.
    Timeout,
    /// The backend, sampler or decoder failed mid-session.
    Faulted(String),
}

impl StopReason {
    /// Natural end of generation, as opposed to an interruption.
    pub fn is_success(&self) -> bool {
        matches!(self, StopReason::EndOfSequence | StopReason::MaxTokensReached)
    }
}

/// Why a start request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    EmptyPrompt,
    PromptTooLong { len: usize, capacity: usize },
    Unencodable(String),
}

/// Phase of the controller's current (or last) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// No session has been started.
    Idle,
    /// Prompt is being tokenized.
    Encoding,
    /// Actively generating tokens.
    Stepping,
    /// Terminal. The reason is kept until the next session starts.
    Stopped(StopReason),
    /// Terminal. The request was refused before any step ran.
    Rejected(RejectReason),
}

/// Cooperative cancellation, usable from another thread or task.
///
/// Observed at the next step boundary; an inference call already in flight
/// runs to completion and its result is dropped.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Proof that a step was started for a particular session.
#[derive(Debug)]
#[must_use = "a started step must be completed or the session expired"]
pub struct StepTicket {
    session: u64,
}

/// Internal state for the active session.
struct Session {
    id: u64,
    /// Prompt ids followed by generated ids.
    history: Vec<TokenId>,
    initial_prompt_length: usize,
    /// Rendered prompt followed by decoded output.
    text: String,
    /// Decoded bytes waiting for the rest of a multi-byte character.
    pending: Vec<u8>,
    state: Option<CompanionState>,
}

impl Session {
    fn generated(&self) -> usize {
        self.history.len() - self.initial_prompt_length
    }

    /// Move everything decodable out of `pending` into `text`.
    ///
    /// Invalid sequences become U+FFFD exactly as a one-shot lossy decode
    /// would render them. Only an incomplete trailing character is held back.
    fn flush_valid(&mut self) {
        loop {
            let (cut, done) = match std::str::from_utf8(&self.pending) {
                Ok(s) => (s.len(), true),
                Err(e) => match e.error_len() {
                    Some(bad) => (e.valid_up_to() + bad, false),
                    None => (e.valid_up_to(), true),
                },
            };
            let rest = self.pending.split_off(cut);
            self.text.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending = rest;
            if done {
                return;
            }
        }
    }

    fn flush_all(&mut self) {
        if !self.pending.is_empty() {
            self.text.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }
}

/// The generation controller.
///
/// Holds at most one session. Starting a new one discards the old.
pub struct GenerationController {
    tokenizer: Arc<Tokenizer>,
    templates: PromptTemplates,
    config: GenerationConfig,
    sampler: Sampler,
    buffer: ContextBuffer,
    eos_ids: FxHashSet<TokenId>,
    session: Option<Session>,
    phase: Phase,
    current_state: CompanionState,
    cancel: CancelHandle,
    in_flight: bool,
    next_session: u64,
}

impl GenerationController {
    /// Create a controller with the default prompt templates.
    pub fn new(tokenizer: Arc<Tokenizer>, config: GenerationConfig) -> Result<Self, GenerationError> {
        Self::with_templates(tokenizer, config, PromptTemplates::default())
    }

    pub fn with_templates(
        tokenizer: Arc<Tokenizer>,
        config: GenerationConfig,
        templates: PromptTemplates,
    ) -> Result<Self, GenerationError> {
        config.validate()?;
        let sampler = Sampler::new(config.temperature, config.seed)?;

        Ok(Self {
            buffer: ContextBuffer::new(config.max_sequence_length, config.pad_token_id),
            eos_ids: config.eos_token_ids.iter().copied().collect(),
            tokenizer,
            templates,
            sampler,
            session: None,
            phase: Phase::Idle,
            current_state: CompanionState::Follow,
            cancel: CancelHandle::default(),
            in_flight: false,
            next_session: 0,
            config,
        })
    }

    /// Replace the random source, e.g. with a seeded one for tests.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    // ------------------------------------------------------------------
    // Command surface
    // ------------------------------------------------------------------

    /// Record a new target state.
    ///
    /// A changed state starts generation for it unless a session is
    /// already running. Setting the current state again does nothing.
    pub fn set_state(&mut self, state: CompanionState) -> Result<(), GenerationError> {
        if state == self.current_state {
            return Ok(());
        }
        self.current_state = state;
        if self.is_generating() {
            return Ok(());
        }
        self.start(state)
    }

    /// Generate a response for `state`, abandoning any running session.
    pub fn generate(&mut self, state: CompanionState) -> Result<(), GenerationError> {
        self.current_state = state;
        self.start(state)
    }

    /// Start a session from the template for `state`.
    pub fn start(&mut self, state: CompanionState) -> Result<(), GenerationError> {
        let prompt = self.templates.render(state);
        self.begin_session(prompt, Some(state))
    }

    /// Start a session from fully rendered prompt text.
    pub fn start_prompt(&mut self, prompt: &str) -> Result<(), GenerationError> {
        self.begin_session(prompt.to_string(), None)
    }

    fn begin_session(
        &mut self,
        prompt: String,
        state: Option<CompanionState>,
    ) -> Result<(), GenerationError> {
        if let Some(old) = self.session.take() {
            if self.phase == Phase::Stepping {
                tracing::debug!(session = old.id, "abandoning running session");
            }
        }
        self.cancel.reset();
        self.in_flight = false;
        self.buffer.clear();

        if prompt.is_empty() {
            tracing::warn!("rejecting empty prompt");
            self.phase = Phase::Rejected(RejectReason::EmptyPrompt);
            return Err(GenerationError::EmptyPrompt);
        }

        self.phase = Phase::Encoding;
        let tokens = match self.tokenizer.encode(&prompt) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting prompt that failed to encode");
                self.phase = Phase::Rejected(RejectReason::Unencodable(e.to_string()));
                return Err(e.into());
            }
        };

        let capacity = self.buffer.capacity();
        if tokens.is_empty() {
            self.phase = Phase::Rejected(RejectReason::EmptyPrompt);
            return Err(GenerationError::EmptyPrompt);
        }
        if tokens.len() >= capacity {
            tracing::warn!(len = tokens.len(), capacity, "prompt too long for fixed buffer");
            self.phase = Phase::Rejected(RejectReason::PromptTooLong {
                len: tokens.len(),
                capacity,
            });
            return Err(ContextError::PromptTooLong {
                len: tokens.len(),
                capacity,
            }
            .into());
        }

        let id = self.next_session;
        self.next_session += 1;

        tracing::debug!(
            session = id,
            state = ?state,
            prompt_tokens = tokens.len(),
            "session started"
        );

        self.session = Some(Session {
            id,
            initial_prompt_length: tokens.len(),
            history: tokens,
            text: prompt,
            pending: Vec::new(),
            state,
        });
        self.phase = Phase::Stepping;
        Ok(())
    }

    /// Stop the running session now with [`StopReason::Cancelled`].
    pub fn cancel(&mut self) {
        if matches!(self.phase, Phase::Stepping | Phase::Encoding) {
            self.stop(StopReason::Cancelled);
        }
    }

    /// Handle for cancelling from outside (another task, a UI thread).
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Stop the running session with [`StopReason::Timeout`] and drop any
    /// in-flight step.
    pub fn expire(&mut self) {
        self.in_flight = false;
        if self.phase == Phase::Stepping {
            tracing::warn!("inference step exceeded its deadline");
            self.stop(StopReason::Timeout);
        }
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    /// Run one full step against a blocking backend.
    ///
    /// Returns the phase after the step. Runtime failures stop the session
    /// and are also returned as errors.
    pub fn step<B: InferenceBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<Phase, GenerationError> {
        let Some(ticket) = self.begin_step()? else {
            return Ok(self.phase.clone());
        };
        let result = if backend.is_ready() {
            backend.infer(&self.buffer)
        } else {
            Err(BackendError::InferenceUnavailable)
        };
        self.complete_step(ticket, backend.vocab_size(), result)
    }

    /// First half of a step: boundary checks and buffer refill.
    ///
    /// `None` means there is nothing to run, either because no session is
    /// stepping or because a termination condition fired at this boundary.
    pub fn begin_step(&mut self) -> Result<Option<StepTicket>, GenerationError> {
        if self.in_flight {
            return Err(GenerationError::StepInFlight);
        }
        if self.phase != Phase::Stepping {
            return Ok(None);
        }
        let Some(session) = self.session.as_ref() else {
            return Ok(None);
        };

        if self.cancel.is_cancelled() {
            self.stop(StopReason::Cancelled);
            return Ok(None);
        }
        if session.generated() >= self.config.max_generated_tokens {
            self.stop(StopReason::MaxTokensReached);
            return Ok(None);
        }
        if session.history.len() >= self.buffer.capacity() {
            self.stop(StopReason::ContextFull);
            return Ok(None);
        }

        let id = session.id;
        self.buffer.refill_from(&session.history)?;
        self.in_flight = true;
        Ok(Some(StepTicket { session: id }))
    }

    /// Second half of a step: consume the backend result.
    ///
    /// `backend_vocab` is the vocab size the backend reports. Logits are
    /// checked against it unless the config pins `vocab_size`. Models often
    /// pad their output past the tokenizer's vocabulary.
    ///
    /// Results for a session that is no longer stepping are dropped.
    pub fn complete_step(
        &mut self,
        ticket: StepTicket,
        backend_vocab: usize,
        result: Result<Logits, BackendError>,
    ) -> Result<Phase, GenerationError> {
        let current = self.session.as_ref().map(|s| s.id);
        if current != Some(ticket.session) || self.phase != Phase::Stepping {
            tracing::warn!(session = ticket.session, "dropping stale inference result");
            return Ok(self.phase.clone());
        }
        self.in_flight = false;

        if self.cancel.is_cancelled() {
            self.stop(StopReason::Cancelled);
            return Ok(self.phase.clone());
        }

        let logits = match result {
            Ok(logits) => logits,
            Err(e) => return Err(self.fault(e)),
        };
        let vocab_size = self.config.vocab_size.unwrap_or(backend_vocab);
        if let Err(e) = logits.check_shape(vocab_size, self.buffer.capacity()) {
            return Err(self.fault(e));
        }

        let Some(pos) = self.buffer.last_position() else {
            return Err(self.fault(BackendError::InferenceUnavailable));
        };
        let Some(scores) = logits.at_position(pos) else {
            return Err(self.fault(BackendError::OutputShapeMismatch {
                expected_rows: self.buffer.capacity(),
                expected_vocab: vocab_size,
                rows: logits.rows(),
                vocab: logits.vocab_size(),
                len: logits.rows() * logits.vocab_size(),
            }));
        };

        let next = match self.sampler.sample(scores) {
            Ok(next) => next,
            Err(e) => return Err(self.fault(e)),
        };

        if self.eos_ids.contains(&next) {
            self.stop(StopReason::EndOfSequence);
            return Ok(self.phase.clone());
        }

        let bytes = match self.tokenizer.token_bytes(next) {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fault(e)),
        };

        if let Some(session) = self.session.as_mut() {
            session.history.push(next);
            session.pending.extend_from_slice(bytes);
            session.flush_valid();
            tracing::debug!(session = session.id, token = next, "sampled token");
        }

        Ok(Phase::Stepping)
    }

    fn stop(&mut self, reason: StopReason) {
        self.in_flight = false;
        if let Some(session) = self.session.as_mut() {
            session.flush_all();
            tracing::info!(
                session = session.id,
                state = ?session.state,
                generated = session.generated(),
                reason = ?reason,
                "session stopped"
            );
        }
        self.phase = Phase::Stopped(reason);
    }

    /// Stop the session on a runtime failure and hand the error back.
    fn fault(&mut self, err: impl Into<GenerationError>) -> GenerationError {
        let err = err.into();
        tracing::warn!(error = %err, "generation faulted");
        self.stop(StopReason::Faulted(err.to_string()));
        err
    }

    // ------------------------------------------------------------------
    // Status surface
    // ------------------------------------------------------------------

    /// Check if a session is actively generating.
    pub fn is_generating(&self) -> bool {
        self.phase == Phase::Stepping
    }

    /// Reply text so far, for polling while a session runs.
    pub fn last_response(&self) -> String {
        self.session
            .as_ref()
            .map(|s| self.templates.extract_response(&s.text).to_string())
            .unwrap_or_default()
    }

    /// Final reply. `None` until the session has stopped.
    pub fn result(&self) -> Option<String> {
        match self.phase {
            Phase::Stopped(_) => Some(self.last_response()),
            _ => None,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        match &self.phase {
            Phase::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    /// Stopped by a natural termination (end-of-sequence or budget).
    pub fn is_completed(&self) -> bool {
        self.stop_reason().is_some_and(StopReason::is_success)
    }

    /// Prompt and generated ids of the current (or last) session.
    pub fn history(&self) -> &[TokenId] {
        self.session
            .as_ref()
            .map(|s| s.history.as_slice())
            .unwrap_or_default()
    }

    /// Generated ids only.
    pub fn generated_tokens(&self) -> &[TokenId] {
        self.session
            .as_ref()
            .map(|s| &s.history[s.initial_prompt_length..])
            .unwrap_or_default()
    }

    pub fn initial_prompt_length(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.initial_prompt_length)
    }

    /// Prompt plus everything decoded so far.
    pub fn full_text(&self) -> &str {
        self.session.as_ref().map_or("", |s| s.text.as_str())
    }

    pub fn current_state(&self) -> CompanionState {
        self.current_state
    }

    /// The input window as of the last refill.
    pub fn buffer(&self) -> &ContextBuffer {
        &self.buffer
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }
}
