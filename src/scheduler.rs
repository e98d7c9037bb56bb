//! Step scheduler: drives a session to a terminal phase.
//!
//! The controller only knows how to take one step. The scheduler owns the
//! loop around it: it keeps exactly one inference call in flight, enforces
//! the per-step deadline and, in the async driver, yields to the runtime
//! between steps so the host stays responsive.

use std::time::{Duration, Instant};

use crate::backend::{AsyncInferenceBackend, BackendError, InferenceBackend};
use crate::config::GenerationConfig;
use crate::engine::{GenerationController, GenerationError, StopReason};

/// Drives steps for one controller at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    step_deadline: Option<Duration>,
}

impl Scheduler {
    /// `step_deadline` bounds each inference call, not the whole session.
    pub fn new(step_deadline: Option<Duration>) -> Self {
        Self { step_deadline }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        Self::new(config.step_deadline())
    }

    pub fn step_deadline(&self) -> Option<Duration> {
        self.step_deadline
    }

    /// Step a blocking backend until the session stops.
    ///
    /// A call that returns after the deadline has its result discarded and
    /// the session stops with [`StopReason::Timeout`]; a blocking call
    /// cannot be interrupted early.
    pub fn run_blocking<B: InferenceBackend + ?Sized>(
        &self,
        controller: &mut GenerationController,
        backend: &mut B,
    ) -> Result<StopReason, GenerationError> {
        while let Some(ticket) = controller.begin_step()? {
            let started = Instant::now();
            let result = if backend.is_ready() {
                backend.infer(controller.buffer())
            } else {
                Err(BackendError::InferenceUnavailable)
            };

            if self.expired(started) {
                drop(ticket);
                controller.expire();
                break;
            }
            controller.complete_step(ticket, backend.vocab_size(), result)?;
        }
        Self::outcome(controller)
    }

    /// Step an async backend until the session stops.
    ///
    /// Each call is awaited under `tokio::time::timeout` when a deadline is
    /// set; an overrunning call is dropped and the session stops with
    /// [`StopReason::Timeout`].
    pub async fn run<B: AsyncInferenceBackend>(
        &self,
        controller: &mut GenerationController,
        backend: &mut B,
    ) -> Result<StopReason, GenerationError> {
        while let Some(ticket) = controller.begin_step()? {
            let finished = if !backend.is_ready() {
                Some(Err(BackendError::InferenceUnavailable))
            } else {
                let call = backend.infer(controller.buffer());
                match self.step_deadline {
                    Some(deadline) => tokio::time::timeout(deadline, call).await.ok(),
                    None => Some(call.await),
                }
            };

            let Some(result) = finished else {
                drop(ticket);
                controller.expire();
                break;
            };
            controller.complete_step(ticket, backend.vocab_size(), result)?;
            tokio::task::yield_now().await;
        }
        Self::outcome(controller)
    }

    fn expired(&self, started: Instant) -> bool {
        self.step_deadline
            .is_some_and(|deadline| started.elapsed() > deadline)
    }

    fn outcome(controller: &GenerationController) -> Result<StopReason, GenerationError> {
        controller
            .stop_reason()
            .cloned()
            .ok_or(GenerationError::NoSession)
    }
}
