//! Fixed-capacity decode batch
//!
//! One decode step's input set, stored as parallel arrays in the layout the
//! inference engine consumes. The buffer is allocated once per generation
//! session and reused for every step.

use thiserror::Error;

/// Token identifier - matches the llama.cpp `llama_token` type
pub type TokenId = i32;

/// Absolute position of a token in the sequence
pub type Position = i32;

/// Logical sequence a token belongs to
pub type SeqId = i32;

/// Widest single evaluation step the engine accepts by default.
pub const MAX_STEP_WIDTH: usize = 512;

/// Errors raised while building or filling a batch
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Failed to allocate batch arrays for {capacity} tokens")]
    Allocation { capacity: usize },

    #[error("Batch capacity exceeded ({capacity} tokens)")]
    CapacityExceeded { capacity: usize },

    #[error("Batch has been released")]
    Released,
}

/// One populated slot of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSlot {
    pub token: TokenId,
    pub position: Position,
    pub seq_id: SeqId,
    pub wants_logits: bool,
}

/// Backing storage, committed only once every array has been reserved.
#[derive(Debug)]
struct Arrays {
    tokens: Vec<TokenId>,
    positions: Vec<Position>,
    n_seq_id: Vec<i32>,
    /// Flattened `capacity * max_seq` sequence ids, one stride per slot.
    seq_ids: Vec<SeqId>,
    logits: Vec<bool>,
}

fn reserve<T>(capacity: usize) -> Result<Vec<T>, BatchError> {
    let mut array = Vec::new();
    array
        .try_reserve_exact(capacity)
        .map_err(|_| BatchError::Allocation { capacity })?;
    Ok(array)
}

impl Arrays {
    /// Reserves every array or none of them. An early return drops the
    /// arrays already reserved, so a failed build never leaks a sibling.
    fn allocate(capacity: usize, max_seq: usize) -> Result<Self, BatchError> {
        let seq_len = capacity
            .checked_mul(max_seq)
            .ok_or(BatchError::Allocation { capacity })?;

        let tokens = reserve(capacity)?;
        let positions = reserve(capacity)?;
        let n_seq_id = reserve(capacity)?;
        let mut seq_ids: Vec<SeqId> = reserve(seq_len)?;
        let logits = reserve(capacity)?;

        seq_ids.resize(seq_len, 0);

        Ok(Self {
            tokens,
            positions,
            n_seq_id,
            seq_ids,
            logits,
        })
    }
}

/// A reusable, fixed-capacity batch of tokens for a single decode call.
///
/// `len() <= capacity()` always holds; `append` past the end fails with
/// [`BatchError::CapacityExceeded`] and writes nothing.
#[derive(Debug)]
pub struct BatchBuffer {
    arrays: Option<Arrays>,
    capacity: usize,
    max_seq: usize,
}

impl BatchBuffer {
    /// Creates a batch sized `min(capacity_hint, MAX_STEP_WIDTH)`.
    pub fn new(capacity_hint: usize, max_seq_per_token: usize) -> Result<Self, BatchError> {
        Self::with_limit(capacity_hint, max_seq_per_token, MAX_STEP_WIDTH)
    }

    /// Creates a batch sized `min(capacity_hint, engine_limit)`.
    ///
    /// Either every parallel array is allocated or the call fails with
    /// [`BatchError::Allocation`]; a partially built buffer is never returned.
    pub fn with_limit(
        capacity_hint: usize,
        max_seq_per_token: usize,
        engine_limit: usize,
    ) -> Result<Self, BatchError> {
        let capacity = capacity_hint.min(engine_limit);
        let max_seq = max_seq_per_token.max(1);
        let arrays = Arrays::allocate(capacity, max_seq)?;

        tracing::debug!("Allocated batch buffer: capacity={capacity}, max_seq={max_seq}");

        Ok(Self {
            arrays: Some(arrays),
            capacity,
            max_seq,
        })
    }

    /// Maximum number of tokens this batch can hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tokens currently in the batch
    pub fn len(&self) -> usize {
        self.arrays.as_ref().map_or(0, |a| a.tokens.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once [`release`](Self::release) has run
    pub fn is_released(&self) -> bool {
        self.arrays.is_none()
    }

    /// Resets the logical length to zero. Never reallocates.
    pub fn clear(&mut self) {
        if let Some(arrays) = self.arrays.as_mut() {
            arrays.tokens.clear();
            arrays.positions.clear();
            arrays.n_seq_id.clear();
            arrays.logits.clear();
        }
    }

    /// Writes one slot into every parallel array.
    pub fn append(
        &mut self,
        token: TokenId,
        position: Position,
        seq_id: SeqId,
        wants_logits: bool,
    ) -> Result<(), BatchError> {
        let capacity = self.capacity;
        let arrays = self.arrays.as_mut().ok_or(BatchError::Released)?;
        let slot = arrays.tokens.len();
        if slot >= capacity {
            return Err(BatchError::CapacityExceeded { capacity });
        }

        arrays.tokens.push(token);
        arrays.positions.push(position);
        arrays.n_seq_id.push(1);
        arrays.seq_ids[slot * self.max_seq] = seq_id;
        arrays.logits.push(wants_logits);
        Ok(())
    }

    /// Frees every array. Safe to call more than once.
    pub fn release(&mut self) {
        if self.arrays.take().is_some() {
            tracing::debug!("Released batch buffer (capacity={})", self.capacity);
        }
    }

    /// Token ids of the populated slots
    pub fn tokens(&self) -> &[TokenId] {
        self.arrays.as_ref().map(|a| a.tokens.as_slice()).unwrap_or(&[])
    }

    /// Positions of the populated slots
    pub fn positions(&self) -> &[Position] {
        self.arrays.as_ref().map(|a| a.positions.as_slice()).unwrap_or(&[])
    }

    /// Per-slot logits flags
    pub fn wants_logits(&self) -> &[bool] {
        self.arrays.as_ref().map(|a| a.logits.as_slice()).unwrap_or(&[])
    }

    /// Sequence ids of the slot at `index`
    pub fn seq_ids(&self, index: usize) -> &[SeqId] {
        match self.arrays.as_ref() {
            Some(a) if index < a.tokens.len() => {
                let start = index * self.max_seq;
                let count = a.n_seq_id[index] as usize;
                &a.seq_ids[start..start + count]
            }
            _ => &[],
        }
    }

    /// Reads back one slot
    pub fn slot(&self, index: usize) -> Option<BatchSlot> {
        let a = self.arrays.as_ref()?;
        if index >= a.tokens.len() {
            return None;
        }
        Some(BatchSlot {
            token: a.tokens[index],
            position: a.positions[index],
            seq_id: a.seq_ids[index * self.max_seq],
            wants_logits: a.logits[index],
        })
    }

    /// Iterates the populated slots in order
    pub fn slots(&self) -> impl Iterator<Item = BatchSlot> + '_ {
        (0..self.len()).filter_map(move |i| self.slot(i))
    }

    /// Index of the last slot, where the next logits are read from
    pub fn last_index(&self) -> Option<usize> {
        self.len().checked_sub(1)
    }
}

impl Drop for BatchBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_bounded_by_engine_limit() {
        let batch = BatchBuffer::new(4096, 1).unwrap();
        assert_eq!(batch.capacity(), MAX_STEP_WIDTH);

        let batch = BatchBuffer::with_limit(64, 1, 512).unwrap();
        assert_eq!(batch.capacity(), 64);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_append_writes_every_array() {
        let mut batch = BatchBuffer::new(8, 1).unwrap();
        batch.append(11, 0, 0, false).unwrap();
        batch.append(12, 1, 0, true).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.tokens(), &[11, 12]);
        assert_eq!(batch.positions(), &[0, 1]);
        assert_eq!(batch.wants_logits(), &[false, true]);
        assert_eq!(batch.seq_ids(1), &[0]);
        assert_eq!(batch.last_index(), Some(1));
        assert_eq!(
            batch.slot(1),
            Some(BatchSlot {
                token: 12,
                position: 1,
                seq_id: 0,
                wants_logits: true
            })
        );
    }

    #[test]
    fn test_append_on_full_batch_fails() {
        let mut batch = BatchBuffer::new(2, 1).unwrap();
        batch.append(1, 0, 0, false).unwrap();
        batch.append(2, 1, 0, true).unwrap();

        let result = batch.append(3, 2, 0, true);
        assert_eq!(result, Err(BatchError::CapacityExceeded { capacity: 2 }));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.tokens(), &[1, 2]);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut batch = BatchBuffer::new(0, 1).unwrap();
        assert!(matches!(
            batch.append(1, 0, 0, true),
            Err(BatchError::CapacityExceeded { capacity: 0 })
        ));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut batch = BatchBuffer::new(4, 1).unwrap();
        batch.append(5, 0, 0, true).unwrap();

        batch.clear();
        assert!(batch.is_empty());
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.capacity(), 4);

        // Reusable after clearing
        batch.append(6, 3, 0, true).unwrap();
        assert_eq!(batch.tokens(), &[6]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut batch = BatchBuffer::new(4, 1).unwrap();
        batch.append(5, 0, 0, true).unwrap();

        batch.release();
        assert!(batch.is_released());
        assert!(batch.is_empty());

        batch.release();
        batch.clear();
        assert!(batch.is_released());
        assert_eq!(batch.append(1, 0, 0, true), Err(BatchError::Released));
    }

    #[test]
    fn test_failed_allocation_returns_no_buffer() {
        let result = BatchBuffer::with_limit(usize::MAX, 2, usize::MAX);
        assert!(matches!(result, Err(BatchError::Allocation { .. })));

        let result = BatchBuffer::with_limit(usize::MAX / 2, 1, usize::MAX);
        assert!(matches!(result, Err(BatchError::Allocation { .. })));
    }

    #[test]
    fn test_multi_sequence_stride() {
        let mut batch = BatchBuffer::new(3, 4).unwrap();
        batch.append(1, 0, 2, false).unwrap();
        batch.append(2, 1, 3, true).unwrap();

        assert_eq!(batch.seq_ids(0), &[2]);
        assert_eq!(batch.seq_ids(1), &[3]);
        assert!(batch.seq_ids(2).is_empty());
        let slots: Vec<_> = batch.slots().map(|s| s.seq_id).collect();
        assert_eq!(slots, vec![2, 3]);
    }
}
