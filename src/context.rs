//! Fixed context buffer: the model's input window.
//!
//! The buffer is two parallel arrays sized once to `capacity`: token ids and
//! an attention mask. It is rewritten in full from the token history before
//! every inference step, never patched incrementally. Positions below the
//! history length carry real ids with mask 1; everything above carries the
//! pad id with mask 0.
//!
//! There is no sliding window. When history reaches capacity the controller
//! stops generating rather than dropping context.

use crate::tokenizer::TokenId;
use thiserror::Error;

/// Id written into unoccupied positions.
pub const PAD_TOKEN_ID: TokenId = 0;

/// Errors from the context buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("prompt too long for fixed buffer ({len} tokens, capacity {capacity})")]
    PromptTooLong { len: usize, capacity: usize },

    #[error("history of {len} tokens overflows buffer capacity {capacity}")]
    Overflow { len: usize, capacity: usize },
}

/// Build a fresh `(ids, mask)` pair for `history`.
///
/// This is the pre-generation form: the window must leave room for at least
/// one generated token, so `history.len() >= capacity` is rejected with
/// [`ContextError::PromptTooLong`].
pub fn refill(
    history: &[TokenId],
    capacity: usize,
) -> Result<(Vec<TokenId>, Vec<u32>), ContextError> {
    if history.len() >= capacity {
        return Err(ContextError::PromptTooLong {
            len: history.len(),
            capacity,
        });
    }
    let mut buffer = ContextBuffer::new(capacity, PAD_TOKEN_ID);
    buffer.refill_from(history)?;
    Ok((buffer.ids, buffer.mask))
}

/// The model input window, owned by the generation controller.
#[derive(Debug, Clone)]
pub struct ContextBuffer {
    ids: Vec<TokenId>,
    mask: Vec<u32>,
    pad_id: TokenId,
    /// Number of occupied (mask = 1) leading positions.
    occupied: usize,
}

impl ContextBuffer {
    /// Allocate an empty window of `capacity` positions.
    pub fn new(capacity: usize, pad_id: TokenId) -> Self {
        Self {
            ids: vec![pad_id; capacity],
            mask: vec![0; capacity],
            pad_id,
            occupied: 0,
        }
    }

    /// Rewrite every position from `history`.
    ///
    /// A completely full window is allowed here; only overflow is an error.
    pub fn refill_from(&mut self, history: &[TokenId]) -> Result<(), ContextError> {
        let capacity = self.capacity();
        if history.len() > capacity {
            return Err(ContextError::Overflow {
                len: history.len(),
                capacity,
            });
        }

        let (live, padding) = self.ids.split_at_mut(history.len());
        live.copy_from_slice(history);
        padding.fill(self.pad_id);

        let (live, padding) = self.mask.split_at_mut(history.len());
        live.fill(1);
        padding.fill(0);

        self.occupied = history.len();
        Ok(())
    }

    /// Clear the window back to all padding.
    pub fn clear(&mut self) {
        self.ids.fill(self.pad_id);
        self.mask.fill(0);
        self.occupied = 0;
    }

    pub fn ids(&self) -> &[TokenId] {
        &self.ids
    }

    pub fn mask(&self) -> &[u32] {
        &self.mask
    }

    /// Ids of the occupied positions only.
    pub fn occupied_ids(&self) -> &[TokenId] {
        &self.ids[..self.occupied]
    }

    /// Number of occupied positions.
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Index of the last occupied position, if any.
    pub fn last_position(&self) -> Option<usize> {
        self.occupied.checked_sub(1)
    }

    /// Total number of positions.
    pub fn capacity(&self) -> usize {
        self.ids.len()
    }

    pub fn pad_id(&self) -> TokenId {
        self.pad_id
    }

    /// Whether every position is occupied.
    pub fn is_full(&self) -> bool {
        self.occupied == self.capacity()
    }
}
