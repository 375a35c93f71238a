//! Shared model plus the evaluation state requests run against.

use crate::config::{ServerConfig, SessionPolicy};
use excoder_llm::{
    estimate_bytes_per_token, DecodeLoop, EvalState, EvaluationError, GenerationError,
    GenerationOutput, GenerationParams, Model, ScratchBudget, ScratchPolicy, TokenId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

enum SessionPool {
    Shared(Mutex<EvalState>),
    PerRequest,
}

pub struct Engine {
    model: Arc<Model>,
    sessions: SessionPool,
    budget: ScratchBudget,
    policy: ScratchPolicy,
    batch_size: usize,
    eos_token: Option<TokenId>,
}

impl Engine {
    /// Runs the scratch estimator once and sets up sessions per the configured policy.
    pub fn new(model: Arc<Model>, config: &ServerConfig) -> Result<Self, EvaluationError> {
        let bytes_per_token = estimate_bytes_per_token(&model)?;
        let budget = ScratchBudget::new(bytes_per_token, config.engine.scratch_margin_bytes);
        Ok(Self::with_budget(model, config, budget))
    }

    pub fn with_budget(model: Arc<Model>, config: &ServerConfig, budget: ScratchBudget) -> Self {
        let policy = config.engine.scratch_policy;
        let batch_size = config.batch_size.max(1);
        let sessions = match config.session_policy {
            SessionPolicy::Shared => {
                let arena = budget.arena(batch_size, policy);
                SessionPool::Shared(Mutex::new(model.new_state(arena)))
            }
            SessionPolicy::PerRequest => SessionPool::PerRequest,
        };
        let eos_token = config.eos_token.or_else(|| model.end_of_text_token());
        info!(
            policy = ?config.session_policy,
            bytes_per_token = budget.bytes_per_token,
            ?eos_token,
            "engine ready"
        );

        Self {
            model,
            sessions,
            budget,
            policy,
            batch_size,
            eos_token,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn eos_token(&self) -> Option<TokenId> {
        self.eos_token
    }

    /// Cursor of the shared session, `None` under `PerRequest`.
    #[cfg(test)]
    pub(crate) fn shared_cursor(&self) -> Option<usize> {
        match &self.sessions {
            SessionPool::Shared(state) => Some(state.lock().n_past()),
            SessionPool::PerRequest => None,
        }
    }

    /// Runs one full decode session. Blocks the calling thread.
    pub fn generate(
        &self,
        prompt: &[TokenId],
        params: GenerationParams,
    ) -> Result<GenerationOutput, GenerationError> {
        let decode = DecodeLoop::new(&self.model, params).with_scratch_budget(self.budget);
        match &self.sessions {
            SessionPool::Shared(state) => {
                let mut state = state.lock();
                debug!("shared session acquired");
                decode.run(&mut state, prompt, |_| {})
            }
            SessionPool::PerRequest => {
                let arena = self.budget.arena(self.batch_size, self.policy);
                let mut state = self.model.new_state(arena);
                decode.run(&mut state, prompt, |_| {})
            }
        }
    }
}
