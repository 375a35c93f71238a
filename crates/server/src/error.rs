use crate::types::ErrorResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use excoder_llm::GenerationError;
use thiserror::Error;
use tracing::error;

/// Problems with a request that are reported before any evaluation runs.
#[derive(Error, Debug)]
pub enum RequestValidationError {
    #[error("you must specify a prompt or input_ids")]
    MissingPrompt,

    #[error("specify either prompt or input_ids, not both")]
    ConflictingPrompt,

    #[error("prompt produced no tokens")]
    EmptyPrompt,

    #[error("input_ids[{index}] = {value} is outside the vocabulary of {n_vocab}")]
    TokenOutOfRange {
        index: usize,
        value: i64,
        n_vocab: usize,
    },

    #[error("prompt has {prompt_tokens} tokens but the context holds {n_ctx}")]
    PromptTooLong { prompt_tokens: usize, n_ctx: usize },

    #[error("temperature must be finite and non-negative, got {0}")]
    InvalidTemperature(f32),

    #[error("top_p must be in (0, 1], got {0}")]
    InvalidTopP(f32),

    #[error("invalid request body: {0}")]
    MalformedBody(String),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] RequestValidationError),

    #[error("failed to predict")]
    Generation(#[source] GenerationError),

    #[error("generation task failed: {0}")]
    Task(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Generation(_) | ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Validation(err) => err.to_string(),
            ApiError::Generation(source) => {
                error!(error = %source, "generation failed");
                self.to_string()
            }
            ApiError::Task(reason) => {
                error!(%reason, "generation task failed");
                "failed to predict".to_string()
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}
