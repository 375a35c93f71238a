//! Weight tensors, their checkpoint names and the table that assembles them.
//!
//! Checkpoint dimensions are listed innermost first, so a `[in, out]` record becomes an
//! `(out, in)` matrix here, which is the layout `linear_into` expects.

use crate::config::Hyperparameters;
use crate::error::LoadError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::collections::HashMap;

/// Per-layer tensor kinds, in checkpoint order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerSlot {
    AttnNormGain,
    AttnNormBias,
    QkvWeight,
    QkvBias,
    AttnProjWeight,
    AttnProjBias,
    MlpNormGain,
    MlpNormBias,
    MlpUpWeight,
    MlpUpBias,
    MlpDownWeight,
    MlpDownBias,
}

impl LayerSlot {
    pub const ALL: [LayerSlot; 12] = [
        LayerSlot::AttnNormGain,
        LayerSlot::AttnNormBias,
        LayerSlot::QkvWeight,
        LayerSlot::QkvBias,
        LayerSlot::AttnProjWeight,
        LayerSlot::AttnProjBias,
        LayerSlot::MlpNormGain,
        LayerSlot::MlpNormBias,
        LayerSlot::MlpUpWeight,
        LayerSlot::MlpUpBias,
        LayerSlot::MlpDownWeight,
        LayerSlot::MlpDownBias,
    ];

    fn suffix(self) -> &'static str {
        match self {
            LayerSlot::AttnNormGain => "ln_1/g",
            LayerSlot::AttnNormBias => "ln_1/b",
            LayerSlot::QkvWeight => "attn/c_attn/w",
            LayerSlot::QkvBias => "attn/c_attn/b",
            LayerSlot::AttnProjWeight => "attn/c_proj/w",
            LayerSlot::AttnProjBias => "attn/c_proj/b",
            LayerSlot::MlpNormGain => "ln_2/g",
            LayerSlot::MlpNormBias => "ln_2/b",
            LayerSlot::MlpUpWeight => "mlp/c_fc/w",
            LayerSlot::MlpUpBias => "mlp/c_fc/b",
            LayerSlot::MlpDownWeight => "mlp/c_proj/w",
            LayerSlot::MlpDownBias => "mlp/c_proj/b",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.suffix() == suffix)
    }

    fn expected_dims(self, hparams: &Hyperparameters) -> Vec<usize> {
        let e = hparams.n_embd;
        let f = hparams.ffn_dim();
        match self {
            LayerSlot::AttnNormGain
            | LayerSlot::AttnNormBias
            | LayerSlot::AttnProjBias
            | LayerSlot::MlpNormGain
            | LayerSlot::MlpNormBias
            | LayerSlot::MlpDownBias => vec![e],
            LayerSlot::QkvWeight => vec![e, 3 * e],
            LayerSlot::QkvBias => vec![3 * e],
            LayerSlot::AttnProjWeight => vec![e, e],
            LayerSlot::MlpUpWeight => vec![e, f],
            LayerSlot::MlpUpBias => vec![f],
            LayerSlot::MlpDownWeight => vec![f, e],
        }
    }
}

/// Every tensor a checkpoint must provide exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorSlot {
    TokenEmbedding,
    PositionEmbedding,
    FinalNormGain,
    FinalNormBias,
    Head,
    Layer(usize, LayerSlot),
}

impl TensorSlot {
    pub fn all(n_layer: usize) -> impl Iterator<Item = TensorSlot> {
        let globals = [
            TensorSlot::TokenEmbedding,
            TensorSlot::PositionEmbedding,
            TensorSlot::FinalNormGain,
            TensorSlot::FinalNormBias,
            TensorSlot::Head,
        ];
        let layers = (0..n_layer)
            .flat_map(|layer| LayerSlot::ALL.into_iter().map(move |s| TensorSlot::Layer(layer, s)));
        globals.into_iter().chain(layers)
    }

    pub fn parse(name: &str, n_layer: usize) -> Option<Self> {
        match name {
            "model/wte" => return Some(TensorSlot::TokenEmbedding),
            "model/wpe" => return Some(TensorSlot::PositionEmbedding),
            "model/ln_f/g" => return Some(TensorSlot::FinalNormGain),
            "model/ln_f/b" => return Some(TensorSlot::FinalNormBias),
            "model/lm_head" => return Some(TensorSlot::Head),
            _ => {}
        }
        let (layer, suffix) = name.strip_prefix("model/h")?.split_once('/')?;
        // Reject "h01" style aliases so each slot has one spelling.
        if layer.len() > 1 && layer.starts_with('0') {
            return None;
        }
        let layer: usize = layer.parse().ok()?;
        if layer >= n_layer {
            return None;
        }
        LayerSlot::from_suffix(suffix).map(|slot| TensorSlot::Layer(layer, slot))
    }

    pub fn name(&self) -> String {
        match self {
            TensorSlot::TokenEmbedding => "model/wte".to_string(),
            TensorSlot::PositionEmbedding => "model/wpe".to_string(),
            TensorSlot::FinalNormGain => "model/ln_f/g".to_string(),
            TensorSlot::FinalNormBias => "model/ln_f/b".to_string(),
            TensorSlot::Head => "model/lm_head".to_string(),
            TensorSlot::Layer(layer, slot) => format!("model/h{layer}/{}", slot.suffix()),
        }
    }

    /// Checkpoint dimensions, innermost first.
    pub fn expected_dims(&self, hparams: &Hyperparameters) -> Vec<usize> {
        let e = hparams.n_embd;
        match self {
            TensorSlot::TokenEmbedding | TensorSlot::Head => vec![e, hparams.n_vocab],
            TensorSlot::PositionEmbedding => vec![e, hparams.n_ctx],
            TensorSlot::FinalNormGain | TensorSlot::FinalNormBias => vec![e],
            TensorSlot::Layer(_, slot) => slot.expected_dims(hparams),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub ln1_gain: Array1<f32>,
    pub ln1_bias: Array1<f32>,
    /// Fused query/key/value projection, `(3 * n_embd, n_embd)`.
    pub qkv_weight: Array2<f32>,
    pub qkv_bias: Array1<f32>,
    pub out_proj: Array2<f32>,
    pub out_proj_bias: Array1<f32>,
    pub ln2_gain: Array1<f32>,
    pub ln2_bias: Array1<f32>,
    pub mlp_up: Array2<f32>,
    pub mlp_up_bias: Array1<f32>,
    pub mlp_down: Array2<f32>,
    pub mlp_down_bias: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub token_embeddings: Array2<f32>,    // (n_vocab, n_embd)
    pub position_embeddings: Array2<f32>, // (n_ctx, n_embd)
    pub layers: Vec<LayerWeights>,
    pub final_ln_gain: Array1<f32>,
    pub final_ln_bias: Array1<f32>,
    pub lm_head: Array2<f32>, // (n_vocab, n_embd)
}

/// Borrowed view of one tensor, whatever its rank.
#[derive(Debug, Clone, Copy)]
pub enum TensorView<'a> {
    Vector(ArrayView1<'a, f32>),
    Matrix(ArrayView2<'a, f32>),
}

impl TensorView<'_> {
    /// Checkpoint dimensions, innermost first.
    pub fn dims(&self) -> Vec<usize> {
        match self {
            TensorView::Vector(v) => vec![v.len()],
            TensorView::Matrix(m) => vec![m.ncols(), m.nrows()],
        }
    }

    /// Elements in checkpoint order.
    pub fn to_vec(&self) -> Vec<f32> {
        match self {
            TensorView::Vector(v) => v.iter().copied().collect(),
            TensorView::Matrix(m) => m.iter().copied().collect(),
        }
    }
}

impl ModelWeights {
    pub fn tensor(&self, slot: TensorSlot) -> Option<TensorView<'_>> {
        use TensorView::{Matrix, Vector};
        let view = match slot {
            TensorSlot::TokenEmbedding => Matrix(self.token_embeddings.view()),
            TensorSlot::PositionEmbedding => Matrix(self.position_embeddings.view()),
            TensorSlot::FinalNormGain => Vector(self.final_ln_gain.view()),
            TensorSlot::FinalNormBias => Vector(self.final_ln_bias.view()),
            TensorSlot::Head => Matrix(self.lm_head.view()),
            TensorSlot::Layer(layer, slot) => {
                let w = self.layers.get(layer)?;
                match slot {
                    LayerSlot::AttnNormGain => Vector(w.ln1_gain.view()),
                    LayerSlot::AttnNormBias => Vector(w.ln1_bias.view()),
                    LayerSlot::QkvWeight => Matrix(w.qkv_weight.view()),
                    LayerSlot::QkvBias => Vector(w.qkv_bias.view()),
                    LayerSlot::AttnProjWeight => Matrix(w.out_proj.view()),
                    LayerSlot::AttnProjBias => Vector(w.out_proj_bias.view()),
                    LayerSlot::MlpNormGain => Vector(w.ln2_gain.view()),
                    LayerSlot::MlpNormBias => Vector(w.ln2_bias.view()),
                    LayerSlot::MlpUpWeight => Matrix(w.mlp_up.view()),
                    LayerSlot::MlpUpBias => Vector(w.mlp_up_bias.view()),
                    LayerSlot::MlpDownWeight => Matrix(w.mlp_down.view()),
                    LayerSlot::MlpDownBias => Vector(w.mlp_down_bias.view()),
                }
            }
        };
        Some(view)
    }

    /// Create random weights for testing (not for real inference).
    pub fn random(hparams: &Hyperparameters, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut matrix = |rows: usize, cols: usize, scale: f32| {
            Array2::from_shape_fn((rows, cols), |_| (rng.f32() - 0.5) * scale)
        };

        let e = hparams.n_embd;
        let f = hparams.ffn_dim();
        let token_embeddings = matrix(hparams.n_vocab, e, 0.5);
        let position_embeddings = matrix(hparams.n_ctx, e, 0.1);
        let lm_head = matrix(hparams.n_vocab, e, 0.5);

        let layers = (0..hparams.n_layer)
            .map(|_| LayerWeights {
                ln1_gain: Array1::ones(e),
                ln1_bias: Array1::zeros(e),
                qkv_weight: matrix(3 * e, e, 0.4),
                qkv_bias: Array1::zeros(3 * e),
                out_proj: matrix(e, e, 0.2),
                out_proj_bias: Array1::zeros(e),
                ln2_gain: Array1::ones(e),
                ln2_bias: Array1::zeros(e),
                mlp_up: matrix(f, e, 0.2),
                mlp_up_bias: Array1::zeros(f),
                mlp_down: matrix(e, f, 0.2),
                mlp_down_bias: Array1::zeros(e),
            })
            .collect();

        Self {
            token_embeddings,
            position_embeddings,
            layers,
            final_ln_gain: Array1::ones(e),
            final_ln_bias: Array1::zeros(e),
            lm_head,
        }
    }
}

#[derive(Debug)]
enum TensorData {
    Vector(Array1<f32>),
    Matrix(Array2<f32>),
}

/// Collects named tensors by slot and checks that every slot is filled.
///
/// Slots are only stored as records arrive, so the header's layer count never sizes an
/// allocation on its own.
pub struct WeightsBuilder {
    hparams: Hyperparameters,
    slots: HashMap<TensorSlot, TensorData>,
}

impl WeightsBuilder {
    pub fn new(hparams: &Hyperparameters) -> Self {
        Self {
            hparams: hparams.clone(),
            slots: HashMap::new(),
        }
    }

    /// Places one tensor. `dims` are innermost first and `data` holds their product.
    pub fn insert(&mut self, name: &str, dims: &[usize], data: Vec<f32>) -> Result<(), LoadError> {
        let slot = TensorSlot::parse(name, self.hparams.n_layer)
            .ok_or_else(|| LoadError::UnknownTensor(name.to_string()))?;

        let expected = slot.expected_dims(&self.hparams);
        if dims != expected.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected,
                found: dims.to_vec(),
            });
        }

        if self.slots.contains_key(&slot) {
            return Err(LoadError::DuplicateTensor(name.to_string()));
        }

        let computed: usize = dims.iter().product();
        let declared = data.len();
        let mismatch = || LoadError::ElementCountMismatch {
            name: name.to_string(),
            declared,
            computed,
        };
        if data.len() != computed {
            return Err(mismatch());
        }
        let tensor = match *dims {
            [_] => TensorData::Vector(Array1::from_vec(data)),
            [inner, outer] => TensorData::Matrix(
                Array2::from_shape_vec((outer, inner), data).map_err(|_| mismatch())?,
            ),
            _ => {
                return Err(LoadError::InvalidDimensionality {
                    name: name.to_string(),
                    n_dims: dims.len(),
                })
            }
        };
        self.slots.insert(slot, tensor);
        Ok(())
    }

    fn take(&mut self, slot: TensorSlot) -> Result<TensorData, LoadError> {
        self.slots
            .remove(&slot)
            .ok_or_else(|| LoadError::MissingTensor(slot.name()))
    }

    fn take_vector(&mut self, slot: TensorSlot) -> Result<Array1<f32>, LoadError> {
        match self.take(slot)? {
            TensorData::Vector(v) => Ok(v),
            TensorData::Matrix(_) => Err(LoadError::InvalidDimensionality {
                name: slot.name(),
                n_dims: 2,
            }),
        }
    }

    fn take_matrix(&mut self, slot: TensorSlot) -> Result<Array2<f32>, LoadError> {
        match self.take(slot)? {
            TensorData::Matrix(m) => Ok(m),
            TensorData::Vector(_) => Err(LoadError::InvalidDimensionality {
                name: slot.name(),
                n_dims: 1,
            }),
        }
    }

    /// Fails with `MissingTensor` for the first slot, in checkpoint order, left empty.
    pub fn finish(mut self) -> Result<ModelWeights, LoadError> {
        if let Some(missing) =
            TensorSlot::all(self.hparams.n_layer).find(|slot| !self.slots.contains_key(slot))
        {
            return Err(LoadError::MissingTensor(missing.name()));
        }

        let token_embeddings = self.take_matrix(TensorSlot::TokenEmbedding)?;
        let position_embeddings = self.take_matrix(TensorSlot::PositionEmbedding)?;
        let final_ln_gain = self.take_vector(TensorSlot::FinalNormGain)?;
        let final_ln_bias = self.take_vector(TensorSlot::FinalNormBias)?;
        let lm_head = self.take_matrix(TensorSlot::Head)?;

        let mut layers = Vec::with_capacity(self.hparams.n_layer);
        for layer in 0..self.hparams.n_layer {
            let slot = |s| TensorSlot::Layer(layer, s);
            layers.push(LayerWeights {
                ln1_gain: self.take_vector(slot(LayerSlot::AttnNormGain))?,
                ln1_bias: self.take_vector(slot(LayerSlot::AttnNormBias))?,
                qkv_weight: self.take_matrix(slot(LayerSlot::QkvWeight))?,
                qkv_bias: self.take_vector(slot(LayerSlot::QkvBias))?,
                out_proj: self.take_matrix(slot(LayerSlot::AttnProjWeight))?,
                out_proj_bias: self.take_vector(slot(LayerSlot::AttnProjBias))?,
                ln2_gain: self.take_vector(slot(LayerSlot::MlpNormGain))?,
                ln2_bias: self.take_vector(slot(LayerSlot::MlpNormBias))?,
                mlp_up: self.take_matrix(slot(LayerSlot::MlpUpWeight))?,
                mlp_up_bias: self.take_vector(slot(LayerSlot::MlpUpBias))?,
                mlp_down: self.take_matrix(slot(LayerSlot::MlpDownWeight))?,
                mlp_down_bias: self.take_vector(slot(LayerSlot::MlpDownBias))?,
            });
        }

        Ok(ModelWeights {
            token_embeddings,
            position_embeddings,
            layers,
            final_ln_gain,
            final_ln_bias,
            lm_head,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back_to_their_slots() {
        let hparams = Hyperparameters::tiny();
        for slot in TensorSlot::all(hparams.n_layer) {
            assert_eq!(TensorSlot::parse(&slot.name(), hparams.n_layer), Some(slot));
        }
        assert_eq!(TensorSlot::all(2).count(), 5 + 2 * 12);
        assert_eq!(TensorSlot::parse("model/h2/ln_1/g", 2), None);
        assert_eq!(TensorSlot::parse("model/h01/ln_1/g", 2), None);
        assert_eq!(TensorSlot::parse("model/h1/attn/q", 2), None);
    }

    #[test]
    fn matrices_are_stored_out_by_in() {
        let hparams = Hyperparameters::tiny();
        let dims = TensorSlot::Layer(0, LayerSlot::MlpDownWeight).expected_dims(&hparams);
        assert_eq!(dims, vec![64, 16]);
        let weights = ModelWeights::random(&hparams, 1);
        assert_eq!(weights.layers[0].mlp_down.dim(), (16, 64));
        assert_eq!(weights.layers[0].qkv_weight.dim(), (48, 16));
        assert_eq!(weights.position_embeddings.dim(), (32, 16));
    }

    #[test]
    fn builder_round_trips_random_weights() {
        let hparams = Hyperparameters::tiny();
        let weights = ModelWeights::random(&hparams, 7);
        let mut builder = WeightsBuilder::new(&hparams);
        for slot in TensorSlot::all(hparams.n_layer) {
            let view = weights.tensor(slot).expect("slot present");
            builder
                .insert(&slot.name(), &view.dims(), view.to_vec())
                .expect("insert");
        }
        let rebuilt = builder.finish().expect("complete");
        assert_eq!(rebuilt.lm_head, weights.lm_head);
        assert_eq!(rebuilt.layers[1].mlp_up, weights.layers[1].mlp_up);
    }

    #[test]
    fn builder_rejects_bad_tensors() {
        let hparams = Hyperparameters::tiny();
        let mut builder = WeightsBuilder::new(&hparams);

        let err = builder.insert("model/h0/mlp/gate", &[16], vec![0.0; 16]);
        assert!(matches!(err, Err(LoadError::UnknownTensor(_))));

        let err = builder.insert("model/ln_f/g", &[15], vec![0.0; 15]);
        assert!(matches!(err, Err(LoadError::ShapeMismatch { .. })));

        builder.insert("model/ln_f/g", &[16], vec![1.0; 16]).expect("first");
        let err = builder.insert("model/ln_f/g", &[16], vec![1.0; 16]);
        assert!(matches!(err, Err(LoadError::DuplicateTensor(_))));

        match builder.finish() {
            Err(LoadError::MissingTensor(name)) => assert_eq!(name, "model/wte"),
            other => panic!("expected missing tensor, got {other:?}"),
        }
    }
}
