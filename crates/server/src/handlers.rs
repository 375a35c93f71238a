use crate::error::{ApiError, RequestValidationError};
use crate::state::AppState;
use crate::types::{
    CompletionChoice, CompletionRequest, CompletionResponse, HealthResponse, TokenResponse, Usage,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use excoder_llm::{GenerationParams, SamplingParams, TokenId};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Resolves the prompt tokens and generation parameters for a request.
pub fn prepare(
    state: &AppState,
    request: &CompletionRequest,
) -> Result<(Vec<TokenId>, GenerationParams), RequestValidationError> {
    let engine = &state.engine;
    let hparams = engine.model().hparams();
    let n_vocab = hparams.n_vocab;

    let prompt = match (&request.prompt, &request.input_ids) {
        (None, None) => return Err(RequestValidationError::MissingPrompt),
        (Some(_), Some(_)) => return Err(RequestValidationError::ConflictingPrompt),
        (Some(text), None) => engine.model().vocab().tokenize(text),
        (None, Some(ids)) => ids
            .iter()
            .enumerate()
            .map(|(index, &value)| {
                u32::try_from(value)
                    .ok()
                    .filter(|&token| (token as usize) < n_vocab)
                    .ok_or(RequestValidationError::TokenOutOfRange {
                        index,
                        value,
                        n_vocab,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
    };
    if prompt.is_empty() {
        return Err(RequestValidationError::EmptyPrompt);
    }
    if prompt.len() > hparams.n_ctx {
        return Err(RequestValidationError::PromptTooLong {
            prompt_tokens: prompt.len(),
            n_ctx: hparams.n_ctx,
        });
    }

    let defaults = &state.config.defaults;
    let temperature = request.temperature.unwrap_or(defaults.temperature);
    if !temperature.is_finite() || temperature < 0.0 {
        return Err(RequestValidationError::InvalidTemperature(temperature));
    }
    let top_p = request.top_p.unwrap_or(defaults.top_p);
    if !(top_p > 0.0 && top_p <= 1.0) {
        return Err(RequestValidationError::InvalidTopP(top_p));
    }

    let params = GenerationParams {
        max_tokens: request.max_tokens.unwrap_or(defaults.max_tokens),
        batch_size: engine.batch_size(),
        sampling: SamplingParams {
            top_k: request.top_k.unwrap_or(defaults.top_k),
            top_p,
            temperature,
        },
        seed: state.config.seed.unwrap_or_else(|| fastrand::u64(..)),
        eos_token: engine.eos_token(),
    };
    Ok((prompt, params))
}

/// Completion handler shared by every completion route.
pub async fn completions(
    State(state): State<AppState>,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let Json(request) =
        body.map_err(|rejection| RequestValidationError::MalformedBody(rejection.body_text()))?;
    let (prompt, params) = prepare(&state, &request)?;

    let start = Instant::now();
    let engine = Arc::clone(&state.engine);
    let output = tokio::task::spawn_blocking(move || engine.generate(&prompt, params))
        .await
        .map_err(|err| ApiError::Task(err.to_string()))?
        .map_err(ApiError::Generation)?;

    let text = state.engine.model().vocab().decode(&output.tokens);
    let usage = Usage {
        prompt_tokens: output.prompt_tokens,
        completion_tokens: output.completion_tokens(),
        total_tokens: output.total_tokens(),
    };
    info!(
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        finish_reason = ?output.finish_reason,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "completion"
    );

    Ok(Json(CompletionResponse {
        id: format!("cmpl-{}", Uuid::new_v4()),
        object: "text_completion".to_string(),
        model: state.config.model_label.clone(),
        created: unix_timestamp(),
        choices: vec![CompletionChoice {
            text,
            index: 0,
            finish_reason: output.finish_reason.as_api_str().to_string(),
            logprobs: None,
        }],
        usage,
    }))
}

pub async fn token() -> Json<TokenResponse> {
    Json(TokenResponse::default())
}

pub async fn root() -> &'static str {
    "Hello world"
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let hparams = state.engine.model().hparams();
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.config.model_label.clone(),
        n_ctx: hparams.n_ctx,
        n_vocab: hparams.n_vocab,
    })
}
