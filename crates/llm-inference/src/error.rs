//! Error types for loading, evaluation and generation.

use std::path::PathBuf;
use thiserror::Error;

/// Failures while reading a checkpoint. Fatal at startup.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read checkpoint '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad magic 0x{found:08x}, not an excoder checkpoint")]
    BadMagic { found: u32 },

    #[error("checkpoint truncated in {section} at byte {offset} (needed {needed} more bytes)")]
    Truncated {
        section: &'static str,
        offset: usize,
        needed: usize,
    },

    #[error("invalid hyperparameters: {0}")]
    InvalidHyperparameters(String),

    #[error("unsupported format tag {0}")]
    UnsupportedFormat(i32),

    #[error("vocabulary holds {count} tokens but the model declares {n_vocab}")]
    VocabularyOverflow { count: usize, n_vocab: usize },

    #[error("negative {what} ({value}) at byte {offset}")]
    NegativeLength {
        what: &'static str,
        value: i32,
        offset: usize,
    },

    #[error("tensor name at byte {offset} is not valid UTF-8")]
    InvalidTensorName { offset: usize },

    #[error("tensor '{name}' has {n_dims} dimensions, expected 1 or 2")]
    InvalidDimensionality { name: String, n_dims: usize },

    #[error("tensor '{name}' declares {declared} elements but its dimensions hold {computed}")]
    ElementCountMismatch {
        name: String,
        declared: usize,
        computed: usize,
    },

    #[error("unknown tensor '{0}'")]
    UnknownTensor(String),

    #[error("tensor '{0}' appears more than once")]
    DuplicateTensor(String),

    #[error("tensor '{name}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("tensor '{0}' missing from checkpoint")]
    MissingTensor(String),
}

/// Failures of a single forward pass. Fatal to the session that issued it.
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("evaluation called with an empty token batch")]
    EmptyBatch,

    #[error("n_past {n_past} + {n_tokens} new tokens exceeds the context length {n_ctx}")]
    ContextOverflow {
        n_past: usize,
        n_tokens: usize,
        n_ctx: usize,
    },

    #[error("token id {token} outside the vocabulary of {n_vocab}")]
    TokenOutOfRange { token: u32, n_vocab: usize },

    #[error("cache holds {expected} positions but evaluation starts at n_past {found}")]
    CursorMismatch { expected: usize, found: usize },

    #[error("n_past {n_past} + {n_tokens} new tokens exceeds the cache capacity {capacity}")]
    CacheOverflow {
        n_past: usize,
        n_tokens: usize,
        capacity: usize,
    },

    #[error("key/value cache is poisoned by an earlier failed evaluation")]
    CachePoisoned,

    #[error("scratch arena too small: need {required} bytes, have {capacity}")]
    OutOfScratchMemory { required: usize, capacity: usize },

    #[error("scratch layout error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("kernel failure: {0}")]
    Kernel(#[from] anyhow::Error),
}

/// Failures of a decode loop session.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("prompt has {prompt_tokens} tokens but the context holds {n_ctx}")]
    PromptTooLong { prompt_tokens: usize, n_ctx: usize },

    #[error("sampler received an empty logit vector")]
    EmptyLogits,

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}
