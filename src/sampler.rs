//! Temperature-scaled multinomial sampling.

use crate::tokenizer::TokenId;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use thiserror::Error;

/// Errors from the sampler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplerError {
    #[error("temperature must be positive and finite, got {0}")]
    InvalidTemperature(f32),

    #[error("cannot sample from empty logits")]
    EmptyLogits,

    #[error("logits have no finite maximum")]
    DegenerateLogits,
}

/// Reject temperatures the sampler cannot divide by.
pub fn validate_temperature(temperature: f32) -> Result<f32, SamplerError> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(temperature)
    } else {
        Err(SamplerError::InvalidTemperature(temperature))
    }
}

/// Draw one token id from `logits` scaled by `temperature`.
///
/// Weights are `exp((l - max) / temperature)`; `r` is drawn uniformly from
/// `[0, total)` and the first index whose running sum exceeds `r` wins.
/// NaN scores get zero weight.
pub fn sample(
    logits: &[f32],
    temperature: f32,
    rng: &mut dyn RngCore,
) -> Result<TokenId, SamplerError> {
    let temperature = validate_temperature(temperature)?;
    if logits.is_empty() {
        return Err(SamplerError::EmptyLogits);
    }

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Err(SamplerError::DegenerateLogits);
    }

    let weights: Vec<f64> = logits
        .iter()
        .map(|&l| {
            let w = (((l - max) / temperature) as f64).exp();
            if w.is_nan() {
                0.0
            } else {
                w
            }
        })
        .collect();
    let total: f64 = weights.iter().sum();

    let r = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if cumulative > r {
            return Ok(i as TokenId);
        }
    }

    // Unreachable: the running sum ends at exactly `total` (same summation
    // order) and `r < total`, since `gen::<f64>()` is below 1.0 and the
    // product never rounds up to `total`.
    Ok((logits.len() - 1) as TokenId)
}

/// A sampler bound to a temperature and its own random source.
pub struct Sampler {
    temperature: f32,
    rng: Box<dyn RngCore + Send>,
}

impl Sampler {
    /// Seeded when `seed` is given, otherwise from OS entropy.
    pub fn new(temperature: f32, seed: Option<u64>) -> Result<Self, SamplerError> {
        let rng: Box<dyn RngCore + Send> = match seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(StdRng::from_entropy()),
        };
        Self::with_rng(temperature, rng)
    }

    /// Use a caller-supplied random source.
    pub fn with_rng(temperature: f32, rng: Box<dyn RngCore + Send>) -> Result<Self, SamplerError> {
        Ok(Self {
            temperature: validate_temperature(temperature)?,
            rng,
        })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId, SamplerError> {
        sample(logits, self.temperature, &mut *self.rng)
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}
