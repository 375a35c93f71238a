//! Key/value cache for incremental decoding.
//!
//! Slots are preallocated for the whole context. An evaluation writes rows
//! `n_past..n_past + n_tokens` of every layer and only then advances the cursor, so the
//! cache always describes exactly the positions that were fully evaluated.

use crate::error::EvaluationError;
use ndarray::{s, Array2, ArrayView2};

#[derive(Debug, Clone)]
pub struct KvCache {
    /// Per layer, `(capacity, n_embd)`.
    keys: Vec<Array2<f32>>,
    values: Vec<Array2<f32>>,
    capacity: usize,
    len: usize,
    poisoned: bool,
}

impl KvCache {
    pub fn new(n_layer: usize, capacity: usize, n_embd: usize) -> Self {
        let keys = (0..n_layer)
            .map(|_| Array2::<f32>::zeros((capacity, n_embd)))
            .collect();
        let values = (0..n_layer)
            .map(|_| Array2::<f32>::zeros((capacity, n_embd)))
            .collect();

        Self {
            keys,
            values,
            capacity,
            len: 0,
            poisoned: false,
        }
    }

    /// Positions evaluated so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Starts a new session. Old rows are left in place and overwritten on demand.
    pub fn reset(&mut self) {
        self.len = 0;
        self.poisoned = false;
    }

    /// Checks that a batch of `n_tokens` may be appended at `n_past`.
    pub fn check_append(&self, n_past: usize, n_tokens: usize) -> Result<(), EvaluationError> {
        if self.poisoned {
            return Err(EvaluationError::CachePoisoned);
        }
        if n_past != self.len {
            return Err(EvaluationError::CursorMismatch {
                expected: self.len,
                found: n_past,
            });
        }
        if n_past + n_tokens > self.capacity {
            return Err(EvaluationError::CacheOverflow {
                n_past,
                n_tokens,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Writes keys and values for positions `start..start + rows` of `layer`.
    pub fn store(
        &mut self,
        layer: usize,
        start: usize,
        keys: ArrayView2<'_, f32>,
        values: ArrayView2<'_, f32>,
    ) {
        let end = start + keys.nrows();
        self.keys[layer].slice_mut(s![start..end, ..]).assign(&keys);
        self.values[layer].slice_mut(s![start..end, ..]).assign(&values);
    }

    /// Keys and values of `layer` for positions `0..n_total`.
    pub fn history(
        &self,
        layer: usize,
        n_total: usize,
    ) -> (ArrayView2<'_, f32>, ArrayView2<'_, f32>) {
        (
            self.keys[layer].slice(s![..n_total, ..]),
            self.values[layer].slice(s![..n_total, ..]),
        )
    }

    /// Advances the cursor after every layer stored its rows.
    pub fn commit(&mut self, n_tokens: usize) {
        self.len += n_tokens;
    }

    /// Marks the cache unusable until the next `reset`.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn bytes_per_token(&self) -> usize {
        let n_embd = self.keys.first().map_or(0, |k| k.ncols());
        // K and V, every layer, f32
        2 * self.keys.len() * n_embd * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefill_then_decode_extends_history() {
        let mut cache = KvCache::new(2, 16, 8);

        cache.check_append(0, 10).expect("prefill fits");
        let prefill = Array2::<f32>::ones((10, 8));
        for layer in 0..2 {
            cache.store(layer, 0, prefill.view(), prefill.view());
        }
        cache.commit(10);
        assert_eq!(cache.len(), 10);

        cache.check_append(10, 1).expect("decode fits");
        let step = Array2::<f32>::from_elem((1, 8), 2.0);
        cache.store(0, 10, step.view(), step.view());
        cache.store(1, 10, step.view(), step.view());
        cache.commit(1);

        let (k, v) = cache.history(0, 11);
        assert_eq!(k.dim(), (11, 8));
        assert_eq!(v[[10, 3]], 2.0);
        assert_eq!(k[[9, 0]], 1.0);
    }

    #[test]
    fn rejects_wrong_cursor_and_overflow() {
        let mut cache = KvCache::new(1, 4, 2);
        cache.commit(2);
        assert!(matches!(
            cache.check_append(0, 1),
            Err(EvaluationError::CursorMismatch {
                expected: 2,
                found: 0
            })
        ));
        assert!(matches!(
            cache.check_append(2, 3),
            Err(EvaluationError::CacheOverflow { capacity: 4, .. })
        ));
        assert!(cache.check_append(2, 2).is_ok());
    }

    #[test]
    fn poison_blocks_until_reset() {
        let mut cache = KvCache::new(1, 4, 2);
        cache.poison();
        assert!(matches!(
            cache.check_append(0, 1),
            Err(EvaluationError::CachePoisoned)
        ));
        cache.reset();
        assert!(cache.check_append(0, 1).is_ok());
        assert!(cache.is_empty());
    }

    #[test]
    fn bytes_per_token() {
        let cache = KvCache::new(12, 4, 768);
        // 2 * 12 layers * 768 * 4 bytes
        assert_eq!(cache.bytes_per_token(), 73728);
    }
}
