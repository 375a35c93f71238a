//! SantaCoder-style decoder inference with an incremental key/value cache.
//!
//! This crate implements the engine behind the excoder drivers:
//! - checkpoint loading (f32 and f16 weights) with name-checked tensor placement
//! - a planned forward pass that runs out of one reusable scratch arena
//! - a scratch estimator, top-k/top-p sampling and the prompt-feed/generate loop
//!
//! `Model` is immutable after load. Sessions own an `EvalState` (cache + arena), so one
//! model can serve many sessions.

pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod error;
pub mod kv_cache;
pub mod memory;
pub mod model;
pub mod plan;
pub mod sampler;
pub mod scratch;
pub mod session;
pub mod tokenizer;
pub mod weights;

pub use config::{EngineConfig, Hyperparameters, WeightFormat};
pub use error::{EvaluationError, GenerationError, LoadError};
pub use memory::{estimate_bytes_per_token, ScratchBudget};
pub use model::{EvalState, Evaluation, Model};
pub use sampler::{Sampler, SamplingParams};
pub use scratch::{ScratchArena, ScratchPolicy};
pub use session::{DecodeEvent, DecodeLoop, FinishReason, GenerationOutput, GenerationParams, Timings};
pub use tokenizer::{TokenId, Vocabulary};
pub use weights::ModelWeights;
