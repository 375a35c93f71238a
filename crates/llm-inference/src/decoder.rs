//! Decoder block: pre-norm self-attention and GELU MLP, each with a residual add.

use crate::config::LAYER_NORM_EPS;
use crate::error::EvaluationError;
use crate::kv_cache::KvCache;
use crate::plan::LayerOp;
use crate::scratch::Workspace;
use crate::weights::LayerWeights;
use excoder_kernels::{
    add_inplace, causal_attention_into, layer_norm_into, linear_into, ActivationKind,
    AttentionInputs, LinearInputs,
};
use ndarray::s;

pub struct DecoderBlock<'w> {
    layer: usize,
    weights: &'w LayerWeights,
    n_head: usize,
}

impl<'w> DecoderBlock<'w> {
    pub fn new(layer: usize, weights: &'w LayerWeights, n_head: usize) -> Self {
        Self {
            layer,
            weights,
            n_head,
        }
    }

    /// Runs one step of this layer for a batch starting at `n_past`.
    ///
    /// `normed` doubles as the projection output before each residual add, so only
    /// `hidden` carries state between steps.
    pub fn execute(
        &self,
        op: LayerOp,
        ws: &mut Workspace<'_>,
        cache: &mut KvCache,
        n_past: usize,
    ) -> Result<(), EvaluationError> {
        let w = self.weights;
        let n_embd = ws.hidden.ncols();

        match op {
            LayerOp::AttnNorm => {
                layer_norm_into(
                    ws.hidden.view(),
                    w.ln1_gain.view(),
                    w.ln1_bias.view(),
                    LAYER_NORM_EPS,
                    ws.normed.view_mut(),
                )?;
            }
            LayerOp::QkvProjection => {
                let inputs = LinearInputs::new(
                    ws.normed.view(),
                    w.qkv_weight.view(),
                    Some(w.qkv_bias.view()),
                    ActivationKind::None,
                );
                linear_into(&inputs, ws.qkv.view_mut())?;
            }
            LayerOp::StoreKv => {
                cache.store(
                    self.layer,
                    n_past,
                    ws.qkv.slice(s![.., n_embd..2 * n_embd]),
                    ws.qkv.slice(s![.., 2 * n_embd..]),
                );
            }
            LayerOp::Attention => {
                let (keys, values) = cache.history(self.layer, n_past + ws.hidden.nrows());
                let inputs = AttentionInputs {
                    query: ws.qkv.slice(s![.., ..n_embd]),
                    keys,
                    values,
                    n_head: self.n_head,
                    n_past,
                };
                causal_attention_into(&inputs, ws.scores.view_mut(), ws.attn.view_mut())?;
            }
            LayerOp::AttnOutput => {
                let inputs = LinearInputs::new(
                    ws.attn.view(),
                    w.out_proj.view(),
                    Some(w.out_proj_bias.view()),
                    ActivationKind::None,
                );
                linear_into(&inputs, ws.normed.view_mut())?;
                add_inplace(ws.hidden.view_mut(), ws.normed.view())?;
            }
            LayerOp::MlpNorm => {
                layer_norm_into(
                    ws.hidden.view(),
                    w.ln2_gain.view(),
                    w.ln2_bias.view(),
                    LAYER_NORM_EPS,
                    ws.normed.view_mut(),
                )?;
            }
            LayerOp::MlpUp => {
                let inputs = LinearInputs::new(
                    ws.normed.view(),
                    w.mlp_up.view(),
                    Some(w.mlp_up_bias.view()),
                    ActivationKind::Gelu,
                );
                linear_into(&inputs, ws.ffn.view_mut())?;
            }
            LayerOp::MlpDown => {
                let inputs = LinearInputs::new(
                    ws.ffn.view(),
                    w.mlp_down.view(),
                    Some(w.mlp_down_bias.view()),
                    ActivationKind::None,
                );
                linear_into(&inputs, ws.normed.view_mut())?;
                add_inplace(ws.hidden.view_mut(), ws.normed.view())?;
            }
        }
        Ok(())
    }
}
