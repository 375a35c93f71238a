//! Loaded model and the evaluator that runs one forward pass over it.

use crate::checkpoint::CheckpointReader;
use crate::config::{Hyperparameters, LAYER_NORM_EPS};
use crate::decoder::DecoderBlock;
use crate::error::{EvaluationError, LoadError};
use crate::kv_cache::KvCache;
use crate::plan::{ForwardPlan, Step};
use crate::scratch::{ScratchArena, Workspace};
use crate::tokenizer::{TokenId, Vocabulary, END_OF_TEXT};
use crate::weights::{ModelWeights, WeightsBuilder};
use excoder_kernels::{layer_norm_inplace, linear_into, ActivationKind, LinearInputs};
use ndarray::s;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Immutable after load; share it behind an `Arc` between sessions.
#[derive(Debug, Clone)]
pub struct Model {
    hparams: Hyperparameters,
    weights: ModelWeights,
    vocab: Vocabulary,
}

/// Mutable per-session resources: the key/value cache and the scratch arena.
#[derive(Debug)]
pub struct EvalState {
    cache: KvCache,
    scratch: ScratchArena,
}

impl EvalState {
    /// Key/value history written so far. Its length is the session cursor.
    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// Arena the evaluator carves its per-call buffers from.
    pub fn scratch(&self) -> &ScratchArena {
        &self.scratch
    }

    /// Positions already evaluated in this session.
    pub fn n_past(&self) -> usize {
        self.cache.len()
    }

    /// Sizes the arena for a session before its first evaluation.
    pub fn reserve_scratch(&mut self, bytes: usize) {
        self.scratch.ensure_capacity(bytes);
    }

    /// Starts a new session, discarding cached positions and any poison.
    pub fn reset(&mut self) {
        self.cache.reset();
    }
}

/// Output of one evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Logits of the last batch position, one per vocabulary entry.
    pub logits: Vec<f32>,
    /// Scratch bytes the plan required.
    pub scratch_bytes: usize,
}

impl Model {
    /// Assembles a model from parts already in memory. No shape checks are made here.
    pub fn new(hparams: Hyperparameters, weights: ModelWeights, vocab: Vocabulary) -> Self {
        Self {
            hparams,
            weights,
            vocab,
        }
    }

    /// Reads a checkpoint file. See [`Model::from_bytes`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let start = Instant::now();
        let data = std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model = Self::from_bytes(&data)?;
        info!(
            path = %path.display(),
            bytes = data.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "checkpoint loaded"
        );
        Ok(model)
    }

    /// Parses a whole checkpoint. Every tensor slot must be filled exactly once with
    /// the shape the header implies.
    pub fn from_bytes(data: &[u8]) -> Result<Self, LoadError> {
        let mut reader = CheckpointReader::new(data)?;
        let hparams = reader.hparams().clone();
        info!(
            n_vocab = hparams.n_vocab,
            n_ctx = hparams.n_ctx,
            n_embd = hparams.n_embd,
            n_head = hparams.n_head,
            n_layer = hparams.n_layer,
            format = ?hparams.format,
            vocab = reader.vocab().len(),
            "checkpoint header"
        );

        let mut builder = WeightsBuilder::new(&hparams);
        let mut tensors = 0usize;
        while let Some(record) = reader.next_tensor()? {
            debug!(name = %record.name, dims = ?record.dims, "tensor");
            builder.insert(&record.name, &record.dims, record.data)?;
            tensors += 1;
        }
        let weights = builder.finish()?;
        debug!(tensors, "all tensors placed");

        Ok(Self::new(hparams, weights, reader.into_vocab()))
    }

    /// Header values the checkpoint was validated against.
    pub fn hparams(&self) -> &Hyperparameters {
        &self.hparams
    }

    /// Token table from the checkpoint. May hold fewer entries than `n_vocab`.
    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    /// Vocabulary id of `<|endoftext|>`, when the vocabulary has one.
    pub fn end_of_text_token(&self) -> Option<TokenId> {
        self.vocab.id(END_OF_TEXT.as_bytes())
    }

    /// Allocates a full-context cache and the given arena for a new session.
    pub fn new_state(&self, scratch: ScratchArena) -> EvalState {
        EvalState {
            cache: self.new_cache(self.hparams.n_ctx),
            scratch,
        }
    }

    pub(crate) fn new_cache(&self, capacity: usize) -> KvCache {
        KvCache::new(self.hparams.n_layer, capacity, self.hparams.n_embd)
    }

    /// Runs one forward pass for `tokens` at positions `n_past..` and returns the logits
    /// of the last position.
    ///
    /// Nothing is written to `state` unless every precondition holds and the scratch
    /// layout fits. A failure after that poisons the cache until `reset`.
    pub fn evaluate(
        &self,
        state: &mut EvalState,
        n_past: usize,
        tokens: &[TokenId],
    ) -> Result<Evaluation, EvaluationError> {
        let plan = ForwardPlan::build(&self.hparams, n_past, tokens)?;
        self.evaluate_plan(&plan, &mut state.cache, &mut state.scratch)
    }

    pub(crate) fn evaluate_plan(
        &self,
        plan: &ForwardPlan<'_>,
        cache: &mut KvCache,
        scratch: &mut ScratchArena,
    ) -> Result<Evaluation, EvaluationError> {
        cache.check_append(plan.n_past, plan.n_tokens())?;
        let mut ws = scratch.carve(&plan.layout)?;
        debug!(
            n_past = plan.n_past,
            n_tokens = plan.n_tokens(),
            steps = plan.steps.len(),
            scratch_bytes = plan.scratch_bytes(),
            "evaluate"
        );

        match self.run(plan, &mut ws, cache) {
            Ok(()) => {
                cache.commit(plan.n_tokens());
                Ok(Evaluation {
                    logits: ws.logits.iter().copied().collect(),
                    scratch_bytes: plan.scratch_bytes(),
                })
            }
            Err(err) => {
                cache.poison();
                Err(err)
            }
        }
    }

    fn run(
        &self,
        plan: &ForwardPlan<'_>,
        ws: &mut Workspace<'_>,
        cache: &mut KvCache,
    ) -> Result<(), EvaluationError> {
        let last = plan.n_tokens() - 1;
        for &step in &plan.steps {
            trace!(?step, "step");
            match step {
                Step::Embed => self.embed(plan, ws),
                Step::Layer(layer, op) => {
                    DecoderBlock::new(layer, &self.weights.layers[layer], self.hparams.n_head)
                        .execute(op, ws, cache, plan.n_past)?
                }
                Step::FinalNorm => {
                    layer_norm_inplace(
                        ws.hidden.slice_mut(s![last..=last, ..]),
                        self.weights.final_ln_gain.view(),
                        self.weights.final_ln_bias.view(),
                        LAYER_NORM_EPS,
                    )?;
                }
                Step::Head => {
                    let inputs = LinearInputs::new(
                        ws.hidden.slice(s![last..=last, ..]),
                        self.weights.lm_head.view(),
                        None,
                        ActivationKind::None,
                    );
                    linear_into(&inputs, ws.logits.view_mut())?;
                }
            }
        }
        Ok(())
    }

    fn embed(&self, plan: &ForwardPlan<'_>, ws: &mut Workspace<'_>) {
        for (i, &token) in plan.tokens.iter().enumerate() {
            let mut row = ws.hidden.row_mut(i);
            row.assign(&self.weights.token_embeddings.row(token as usize));
            row += &self.weights.position_embeddings.row(plan.n_past + i);
        }
    }
}
