//! Scratch arena for forward-pass intermediates.
//!
//! Every intermediate of one evaluation is carved out of a single preallocated buffer.
//! The layout is computed up front from the batch geometry so an undersized arena is
//! detected before any cache slot is written.

use crate::config::Hyperparameters;
use crate::error::EvaluationError;
use ndarray::ArrayViewMut2;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What to do when a layout does not fit the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScratchPolicy {
    /// Enlarge the arena and log a warning.
    #[default]
    Grow,
    /// Refuse the evaluation with `OutOfScratchMemory`.
    FailFast,
}

/// Buffer geometry for a batch of `n_tokens` starting at `n_past`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchLayout {
    pub n_tokens: usize,
    pub n_total: usize,
    pub n_embd: usize,
    pub ffn_dim: usize,
    pub n_vocab: usize,
}

impl ScratchLayout {
    pub fn new(hparams: &Hyperparameters, n_past: usize, n_tokens: usize) -> Self {
        Self {
            n_tokens,
            n_total: n_past + n_tokens,
            n_embd: hparams.n_embd,
            ffn_dim: hparams.ffn_dim(),
            n_vocab: hparams.n_vocab,
        }
    }

    fn regions(&self) -> [(usize, usize); 7] {
        let t = self.n_tokens;
        [
            (t, self.n_embd),     // hidden
            (t, self.n_embd),     // normed
            (t, 3 * self.n_embd), // qkv
            (t, self.n_total),    // scores
            (t, self.n_embd),     // attn
            (t, self.ffn_dim),    // ffn
            (1, self.n_vocab),    // logits
        ]
    }

    pub fn elements(&self) -> usize {
        self.regions().iter().map(|(rows, cols)| rows * cols).sum()
    }

    pub fn bytes(&self) -> usize {
        self.elements() * std::mem::size_of::<f32>()
    }
}

/// Views carved from the arena for one evaluation.
pub struct Workspace<'a> {
    /// Residual stream, `(n_tokens, n_embd)`.
    pub hidden: ArrayViewMut2<'a, f32>,
    pub normed: ArrayViewMut2<'a, f32>,
    pub qkv: ArrayViewMut2<'a, f32>,
    pub scores: ArrayViewMut2<'a, f32>,
    pub attn: ArrayViewMut2<'a, f32>,
    pub ffn: ArrayViewMut2<'a, f32>,
    /// Logits for the last position only.
    pub logits: ArrayViewMut2<'a, f32>,
}

#[derive(Debug)]
pub struct ScratchArena {
    buf: Vec<f32>,
    policy: ScratchPolicy,
    high_water: usize,
}

impl ScratchArena {
    pub fn with_capacity(bytes: usize, policy: ScratchPolicy) -> Self {
        let elements = bytes.div_ceil(std::mem::size_of::<f32>());
        Self {
            buf: vec![0.0; elements],
            policy,
            high_water: 0,
        }
    }

    /// Starts empty and grows on first use without warning.
    pub fn unbounded() -> Self {
        Self {
            buf: Vec::new(),
            policy: ScratchPolicy::Grow,
            high_water: 0,
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.buf.len() * std::mem::size_of::<f32>()
    }

    /// Largest layout served so far, in bytes.
    pub fn high_water_bytes(&self) -> usize {
        self.high_water
    }

    pub fn policy(&self) -> ScratchPolicy {
        self.policy
    }

    /// Grows the arena to at least `bytes` ahead of a session. Never shrinks.
    pub fn ensure_capacity(&mut self, bytes: usize) {
        let elements = bytes.div_ceil(std::mem::size_of::<f32>());
        if elements > self.buf.len() {
            self.buf.resize(elements, 0.0);
        }
    }

    /// Ensures `layout` fits, growing or failing according to the policy.
    pub fn reserve(&mut self, layout: &ScratchLayout) -> Result<(), EvaluationError> {
        let needed = layout.elements();
        if needed > self.buf.len() {
            let required = layout.bytes();
            let capacity = self.capacity_bytes();
            match self.policy {
                ScratchPolicy::FailFast => {
                    return Err(EvaluationError::OutOfScratchMemory { required, capacity });
                }
                ScratchPolicy::Grow => {
                    if capacity > 0 {
                        warn!(required, capacity, "scratch arena too small, growing");
                    }
                    self.buf.resize(needed, 0.0);
                }
            }
        }
        self.high_water = self.high_water.max(layout.bytes());
        Ok(())
    }

    /// Splits the arena into the views described by `layout`.
    pub fn carve(&mut self, layout: &ScratchLayout) -> Result<Workspace<'_>, EvaluationError> {
        self.reserve(layout)?;

        let [hidden, normed, qkv, scores, attn, ffn, logits] = layout.regions();
        let mut rest: &mut [f32] = &mut self.buf[..layout.elements()];
        Ok(Workspace {
            hidden: take_view(&mut rest, hidden)?,
            normed: take_view(&mut rest, normed)?,
            qkv: take_view(&mut rest, qkv)?,
            scores: take_view(&mut rest, scores)?,
            attn: take_view(&mut rest, attn)?,
            ffn: take_view(&mut rest, ffn)?,
            logits: take_view(&mut rest, logits)?,
        })
    }
}

fn take_view<'a>(
    rest: &mut &'a mut [f32],
    (rows, cols): (usize, usize),
) -> Result<ArrayViewMut2<'a, f32>, EvaluationError> {
    let (head, tail) = std::mem::take(rest).split_at_mut(rows * cols);
    *rest = tail;
    Ok(ArrayViewMut2::from_shape((rows, cols), head)?)
}
