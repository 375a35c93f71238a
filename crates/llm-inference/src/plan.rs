//! Forward-pass planning.
//!
//! A plan is the ordered list of steps one evaluation executes plus the scratch layout
//! they need. Building it checks every precondition, so a plan that exists can run
//! without touching state it should not.

use crate::config::Hyperparameters;
use crate::error::EvaluationError;
use crate::scratch::ScratchLayout;
use crate::tokenizer::TokenId;

/// Operations inside one decoder layer, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOp {
    AttnNorm,
    QkvProjection,
    StoreKv,
    Attention,
    AttnOutput,
    MlpNorm,
    MlpUp,
    MlpDown,
}

impl LayerOp {
    pub const SEQUENCE: [LayerOp; 8] = [
        LayerOp::AttnNorm,
        LayerOp::QkvProjection,
        LayerOp::StoreKv,
        LayerOp::Attention,
        LayerOp::AttnOutput,
        LayerOp::MlpNorm,
        LayerOp::MlpUp,
        LayerOp::MlpDown,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Token plus position embedding into the residual stream.
    Embed,
    Layer(usize, LayerOp),
    /// Final layer norm of the last batch row.
    FinalNorm,
    /// Vocabulary projection of the last batch row.
    Head,
}

#[derive(Debug, Clone)]
pub struct ForwardPlan<'a> {
    pub n_past: usize,
    pub tokens: &'a [TokenId],
    pub steps: Vec<Step>,
    pub layout: ScratchLayout,
}

impl<'a> ForwardPlan<'a> {
    pub fn build(
        hparams: &Hyperparameters,
        n_past: usize,
        tokens: &'a [TokenId],
    ) -> Result<Self, EvaluationError> {
        if tokens.is_empty() {
            return Err(EvaluationError::EmptyBatch);
        }
        if n_past + tokens.len() > hparams.n_ctx {
            return Err(EvaluationError::ContextOverflow {
                n_past,
                n_tokens: tokens.len(),
                n_ctx: hparams.n_ctx,
            });
        }
        if let Some(&token) = tokens.iter().find(|&&t| t as usize >= hparams.n_vocab) {
            return Err(EvaluationError::TokenOutOfRange {
                token,
                n_vocab: hparams.n_vocab,
            });
        }

        let mut steps = Vec::with_capacity(3 + hparams.n_layer * LayerOp::SEQUENCE.len());
        steps.push(Step::Embed);
        for layer in 0..hparams.n_layer {
            steps.extend(LayerOp::SEQUENCE.iter().map(|&op| Step::Layer(layer, op)));
        }
        steps.push(Step::FinalNorm);
        steps.push(Step::Head);

        Ok(Self {
            n_past,
            tokens,
            steps,
            layout: ScratchLayout::new(hparams, n_past, tokens.len()),
        })
    }

    pub fn n_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn scratch_bytes(&self) -> usize {
        self.layout.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_orders_layers_between_embed_and_head() {
        let hparams = Hyperparameters::tiny();
        let tokens = [1, 2, 3];
        let plan = ForwardPlan::build(&hparams, 4, &tokens).expect("valid");

        assert_eq!(plan.steps.len(), 3 + 2 * 8);
        assert_eq!(plan.steps[0], Step::Embed);
        assert_eq!(plan.steps[1], Step::Layer(0, LayerOp::AttnNorm));
        assert_eq!(plan.steps[9], Step::Layer(1, LayerOp::AttnNorm));
        assert_eq!(plan.steps.last(), Some(&Step::Head));
        assert_eq!(plan.layout.n_total, 7);
    }

    #[test]
    fn rejects_invalid_batches() {
        let hparams = Hyperparameters::tiny();
        assert!(matches!(
            ForwardPlan::build(&hparams, 0, &[]),
            Err(EvaluationError::EmptyBatch)
        ));
        assert!(matches!(
            ForwardPlan::build(&hparams, 30, &[1, 2, 3]),
            Err(EvaluationError::ContextOverflow { n_ctx: 32, .. })
        ));
        assert!(matches!(
            ForwardPlan::build(&hparams, 0, &[1, 64]),
            Err(EvaluationError::TokenOutOfRange { token: 64, .. })
        ));
        assert!(ForwardPlan::build(&hparams, 29, &[1, 2, 3]).is_ok());
    }
}
