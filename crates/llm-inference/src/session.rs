//! Decode loop: feeds a prompt, then samples and feeds back one token at a time.

use crate::error::GenerationError;
use crate::memory::ScratchBudget;
use crate::model::{EvalState, Model};
use crate::sampler::{Sampler, SamplingParams};
use crate::tokenizer::TokenId;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: usize,
    /// Largest prompt chunk handed to one evaluation.
    pub batch_size: usize,
    pub sampling: SamplingParams,
    pub seed: u64,
    /// Generation stops when this token is sampled. It is never emitted.
    pub eos_token: Option<TokenId>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 200,
            batch_size: 8,
            sampling: SamplingParams::default(),
            seed: 0,
            eos_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The end-of-text token was sampled.
    Stop,
    /// `max_tokens` were produced.
    Length,
    /// The context filled before `max_tokens` were produced.
    ContextFull,
}

impl FinishReason {
    /// Label used by OpenAI-style completion responses.
    pub fn as_api_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length | FinishReason::ContextFull => "length",
        }
    }
}

/// Progress reported while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeEvent<'a> {
    /// A prompt chunk is about to be evaluated.
    PromptChunk(&'a [TokenId]),
    /// A token was generated.
    Token(TokenId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub prompt_eval: Duration,
    /// Every evaluation, prompt chunks included.
    pub predict: Duration,
    pub sample: Duration,
    pub evaluated_positions: usize,
    pub samples: usize,
    /// Largest scratch layout served during the session.
    pub scratch_bytes: usize,
}

impl Timings {
    pub fn predict_per_position(&self) -> Duration {
        match u32::try_from(self.evaluated_positions) {
            Ok(n) if n > 0 => self.predict / n,
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub tokens: Vec<TokenId>,
    pub prompt_tokens: usize,
    pub finish_reason: FinishReason,
    pub timings: Timings,
}

impl GenerationOutput {
    pub fn completion_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens + self.tokens.len()
    }
}

enum Phase {
    Init,
    PromptFeed { fed: usize },
    Generate { logits: Vec<f32> },
    Done(FinishReason),
}

/// One generation session over a shared model.
pub struct DecodeLoop<'m> {
    model: &'m Model,
    params: GenerationParams,
    budget: Option<ScratchBudget>,
}

impl<'m> DecodeLoop<'m> {
    pub fn new(model: &'m Model, params: GenerationParams) -> Self {
        Self {
            model,
            params,
            budget: None,
        }
    }

    /// Sizes the session arena from an estimate before the first evaluation.
    pub fn with_scratch_budget(mut self, budget: ScratchBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Runs a full session on `state`, which is reset first.
    pub fn run<F>(
        &self,
        state: &mut EvalState,
        prompt: &[TokenId],
        mut on_event: F,
    ) -> Result<GenerationOutput, GenerationError>
    where
        F: FnMut(DecodeEvent<'_>),
    {
        let n_ctx = self.model.hparams().n_ctx;
        if prompt.is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }
        if prompt.len() > n_ctx {
            return Err(GenerationError::PromptTooLong {
                prompt_tokens: prompt.len(),
                n_ctx,
            });
        }

        let max_new = self.params.max_tokens.min(n_ctx - prompt.len());
        let batch_size = self.params.batch_size.max(1);
        let mut sampler = Sampler::new(self.params.sampling, self.params.seed);
        let mut tokens = Vec::with_capacity(max_new);
        let mut timings = Timings::default();
        let mut n_past = 0;

        let mut phase = Phase::Init;
        let finish_reason = loop {
            phase = match phase {
                Phase::Init => {
                    state.reset();
                    if let Some(budget) = self.budget {
                        state.reserve_scratch(budget.arena_bytes(prompt.len() + max_new));
                    }
                    Phase::PromptFeed { fed: 0 }
                }
                Phase::PromptFeed { fed } => {
                    let end = (fed + batch_size).min(prompt.len());
                    let chunk = &prompt[fed..end];
                    on_event(DecodeEvent::PromptChunk(chunk));

                    let start = Instant::now();
                    let evaluation = self.model.evaluate(state, n_past, chunk)?;
                    let elapsed = start.elapsed();
                    timings.prompt_eval += elapsed;
                    timings.predict += elapsed;
                    timings.evaluated_positions += chunk.len();
                    timings.scratch_bytes = timings.scratch_bytes.max(evaluation.scratch_bytes);
                    n_past += chunk.len();
                    debug!(n_past, chunk = chunk.len(), "prompt chunk evaluated");

                    if end == prompt.len() {
                        Phase::Generate {
                            logits: evaluation.logits,
                        }
                    } else {
                        Phase::PromptFeed { fed: end }
                    }
                }
                Phase::Generate { logits } => {
                    if tokens.len() >= max_new {
                        Phase::Done(if tokens.len() >= self.params.max_tokens {
                            FinishReason::Length
                        } else {
                            FinishReason::ContextFull
                        })
                    } else {
                        let start = Instant::now();
                        let token = sampler
                            .sample(&logits)
                            .ok_or(GenerationError::EmptyLogits)?;
                        timings.sample += start.elapsed();
                        timings.samples += 1;

                        if Some(token) == self.params.eos_token {
                            Phase::Done(FinishReason::Stop)
                        } else {
                            tokens.push(token);
                            on_event(DecodeEvent::Token(token));
                            if tokens.len() >= max_new {
                                // The final token needs no logits of its own.
                                Phase::Generate { logits }
                            } else {
                                let start = Instant::now();
                                let evaluation = self.model.evaluate(state, n_past, &[token])?;
                                timings.predict += start.elapsed();
                                timings.evaluated_positions += 1;
                                timings.scratch_bytes =
                                    timings.scratch_bytes.max(evaluation.scratch_bytes);
                                n_past += 1;
                                Phase::Generate {
                                    logits: evaluation.logits,
                                }
                            }
                        }
                    }
                }
                Phase::Done(reason) => break reason,
            };
        };

        debug!(
            prompt_tokens = prompt.len(),
            generated = tokens.len(),
            ?finish_reason,
            "decode loop done"
        );
        Ok(GenerationOutput {
            tokens,
            prompt_tokens: prompt.len(),
            finish_reason,
            timings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hyperparameters;
    use crate::error::EvaluationError;
    use crate::memory::estimate_bytes_per_token;
    use crate::scratch::{ScratchArena, ScratchPolicy};
    use crate::tokenizer::Vocabulary;
    use crate::weights::ModelWeights;

    fn tiny_model() -> Model {
        let hparams = Hyperparameters::tiny();
        Model::new(
            hparams.clone(),
            ModelWeights::random(&hparams, 21),
            Vocabulary::default(),
        )
    }

    fn greedy(max_tokens: usize) -> GenerationParams {
        GenerationParams {
            max_tokens,
            batch_size: 3,
            sampling: SamplingParams::greedy(),
            ..GenerationParams::default()
        }
    }

    #[test]
    fn stops_at_max_tokens_and_chunks_prompt() {
        let model = tiny_model();
        let mut state = model.new_state(ScratchArena::unbounded());
        let mut chunks = Vec::new();
        let mut streamed = Vec::new();

        let out = DecodeLoop::new(&model, greedy(5))
            .run(&mut state, &[1, 2, 3, 4, 5, 6, 7], |event| match event {
                DecodeEvent::PromptChunk(chunk) => chunks.push(chunk.len()),
                DecodeEvent::Token(token) => streamed.push(token),
            })
            .expect("generate");

        assert_eq!(chunks, vec![3, 3, 1]);
        assert_eq!(out.tokens.len(), 5);
        assert_eq!(out.tokens, streamed);
        assert_eq!(out.finish_reason, FinishReason::Length);
        assert_eq!(out.total_tokens(), 12);
        // prompt plus every generated token except the last
        assert_eq!(state.n_past(), 11);
        assert_eq!(out.timings.evaluated_positions, 11);
    }

    #[test]
    fn end_of_text_stops_without_emitting() {
        let model = tiny_model();
        let mut state = model.new_state(ScratchArena::unbounded());
        let prompt = [9, 4];

        let first = DecodeLoop::new(&model, greedy(1))
            .run(&mut state, &prompt, |_| {})
            .expect("probe");
        let eos = first.tokens[0];

        let params = GenerationParams {
            eos_token: Some(eos),
            ..greedy(10)
        };
        let out = DecodeLoop::new(&model, params)
            .run(&mut state, &prompt, |_| {})
            .expect("generate");
        assert!(out.tokens.is_empty());
        assert_eq!(out.finish_reason, FinishReason::Stop);
        assert_eq!(out.finish_reason.as_api_str(), "stop");
    }

    #[test]
    fn context_limit_cuts_generation() {
        let model = tiny_model();
        let mut state = model.new_state(ScratchArena::unbounded());
        let prompt: Vec<TokenId> = (0..30).collect();
        let out = DecodeLoop::new(&model, greedy(10))
            .run(&mut state, &prompt, |_| {})
            .expect("generate");
        assert_eq!(out.tokens.len(), 2);
        assert_eq!(out.finish_reason, FinishReason::ContextFull);
        assert_eq!(out.finish_reason.as_api_str(), "length");
    }

    #[test]
    fn same_seed_reproduces_output() {
        let model = tiny_model();
        let params = GenerationParams {
            max_tokens: 8,
            seed: 1234,
            sampling: SamplingParams {
                top_k: 10,
                top_p: 0.95,
                temperature: 1.0,
            },
            ..GenerationParams::default()
        };
        let mut state = model.new_state(ScratchArena::unbounded());
        let decode = DecodeLoop::new(&model, params);
        let a = decode.run(&mut state, &[3, 1, 4], |_| {}).expect("first");
        let b = decode.run(&mut state, &[3, 1, 4], |_| {}).expect("second");
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn rejects_empty_and_oversized_prompts() {
        let model = tiny_model();
        let mut state = model.new_state(ScratchArena::unbounded());
        let decode = DecodeLoop::new(&model, greedy(4));
        assert!(matches!(
            decode.run(&mut state, &[], |_| {}),
            Err(GenerationError::EmptyPrompt)
        ));
        let long: Vec<TokenId> = vec![1; 33];
        assert!(matches!(
            decode.run(&mut state, &long, |_| {}),
            Err(GenerationError::PromptTooLong {
                prompt_tokens: 33,
                n_ctx: 32
            })
        ));
    }

    #[test]
    fn budgeted_fail_fast_session_completes() {
        let model = tiny_model();
        let budget = ScratchBudget::new(estimate_bytes_per_token(&model).expect("estimate"), 0);
        let mut state = model.new_state(ScratchArena::with_capacity(0, ScratchPolicy::FailFast));
        let out = DecodeLoop::new(&model, greedy(6))
            .with_scratch_budget(budget)
            .run(&mut state, &[5, 6, 7, 8], |_| {})
            .expect("fits");
        assert_eq!(out.tokens.len(), 6);
        assert!(state.scratch().capacity_bytes() >= out.timings.scratch_bytes);
    }

    #[test]
    fn evaluation_failure_is_fatal() {
        let model = tiny_model();
        let mut state = model.new_state(ScratchArena::with_capacity(0, ScratchPolicy::FailFast));
        let err = DecodeLoop::new(&model, greedy(2))
            .run(&mut state, &[1, 2], |_| {})
            .expect_err("arena is empty");
        assert!(matches!(
            err,
            GenerationError::Evaluation(EvaluationError::OutOfScratchMemory { .. })
        ));
    }
}
