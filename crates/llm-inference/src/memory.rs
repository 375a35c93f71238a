//! Scratch memory estimation.
//!
//! A probe evaluation on a throwaway cache measures how many scratch bytes one position
//! costs; sessions then size their arena from that figure.

use crate::error::EvaluationError;
use crate::model::Model;
use crate::plan::ForwardPlan;
use crate::scratch::{ScratchArena, ScratchLayout, ScratchPolicy};
use crate::tokenizer::TokenId;
use tracing::info;

pub const PROBE_TOKENS: [TokenId; 4] = [0, 1, 2, 3];

/// Scratch bytes per evaluated position, measured with a probe batch.
///
/// The probe runs on a private cache, so no session state is touched.
pub fn estimate_bytes_per_token(model: &Model) -> Result<usize, EvaluationError> {
    let hparams = model.hparams();
    let len = PROBE_TOKENS
        .len()
        .min(hparams.n_ctx)
        .min(hparams.n_vocab);
    let probe = &PROBE_TOKENS[..len];

    let plan = ForwardPlan::build(hparams, 0, probe)?;
    let mut cache = model.new_cache(len);
    let mut scratch = ScratchArena::unbounded();
    let evaluation = model.evaluate_plan(&plan, &mut cache, &mut scratch)?;

    let bytes_per_token = evaluation.scratch_bytes.div_ceil(len);
    info!(
        probe_tokens = len,
        scratch_bytes = evaluation.scratch_bytes,
        bytes_per_token,
        "memory estimate"
    );
    Ok(bytes_per_token)
}

/// How large a session's arena should be for a given batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchBudget {
    pub bytes_per_token: usize,
    pub margin_bytes: usize,
}

impl ScratchBudget {
    pub fn new(bytes_per_token: usize, margin_bytes: usize) -> Self {
        Self {
            bytes_per_token,
            margin_bytes,
        }
    }

    /// Arena bytes for batches of up to `n_tokens` positions.
    pub fn arena_bytes(&self, n_tokens: usize) -> usize {
        self.bytes_per_token * n_tokens.max(1) + self.margin_bytes
    }

    pub fn arena(&self, n_tokens: usize, policy: ScratchPolicy) -> ScratchArena {
        ScratchArena::with_capacity(self.arena_bytes(n_tokens), policy)
    }
}

/// Exact scratch bytes for one evaluation, without running it.
pub fn layout_bytes(model: &Model, n_past: usize, n_tokens: usize) -> usize {
    ScratchLayout::new(model.hparams(), n_past, n_tokens).bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hyperparameters;
    use crate::tokenizer::Vocabulary;
    use crate::weights::ModelWeights;

    fn tiny_model() -> Model {
        let hparams = Hyperparameters::tiny();
        Model::new(
            hparams.clone(),
            ModelWeights::random(&hparams, 9),
            Vocabulary::default(),
        )
    }

    #[test]
    fn estimate_is_probe_layout_divided_by_length() {
        let model = tiny_model();
        let estimate = estimate_bytes_per_token(&model).expect("estimate");
        assert_eq!(estimate, layout_bytes(&model, 0, 4).div_ceil(4));
    }

    #[test]
    fn budget_adds_margin() {
        let budget = ScratchBudget::new(1000, 64);
        assert_eq!(budget.arena_bytes(8), 8064);
        assert_eq!(budget.arena_bytes(0), 1064);
        assert_eq!(
            budget.arena(2, ScratchPolicy::FailFast).capacity_bytes(),
            2064
        );
    }

    #[test]
    fn tiny_context_clips_probe() {
        let mut hparams = Hyperparameters::tiny();
        hparams.n_ctx = 2;
        let model = Model::new(
            hparams.clone(),
            ModelWeights::random(&hparams, 1),
            Vocabulary::default(),
        );
        let estimate = estimate_bytes_per_token(&model).expect("estimate");
        assert_eq!(estimate, layout_bytes(&model, 0, 2).div_ceil(2));
    }
}
