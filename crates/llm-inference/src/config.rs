//! Checkpoint hyperparameters and engine settings.

use crate::error::LoadError;
use crate::scratch::ScratchPolicy;
use serde::{Deserialize, Serialize};

pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Storage type selected by the checkpoint's format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightFormat {
    F32,
    F16,
}

impl WeightFormat {
    pub fn from_tag(tag: i32) -> Result<Self, LoadError> {
        match tag {
            0 => Ok(WeightFormat::F32),
            1 => Ok(WeightFormat::F16),
            other => Err(LoadError::UnsupportedFormat(other)),
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            WeightFormat::F32 => 0,
            WeightFormat::F16 => 1,
        }
    }

    /// Bytes per stored element. Gains, biases and other vectors stay f32 in every format.
    pub fn element_size(self, n_dims: usize) -> usize {
        match (self, n_dims) {
            (WeightFormat::F16, 2) => 2,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub n_vocab: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub format: WeightFormat,
}

impl Hyperparameters {
    /// SantaCoder-sized model (1.1B parameters).
    pub fn santacoder() -> Self {
        Self {
            n_vocab: 49280,
            n_ctx: 2048,
            n_embd: 2048,
            n_head: 16,
            n_layer: 24,
            format: WeightFormat::F16,
        }
    }

    /// Tiny config for tests and quick iteration.
    pub fn tiny() -> Self {
        Self {
            n_vocab: 64,
            n_ctx: 32,
            n_embd: 16,
            n_head: 4,
            n_layer: 2,
            format: WeightFormat::F32,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn ffn_dim(&self) -> usize {
        4 * self.n_embd
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        let fields = [
            ("n_vocab", self.n_vocab),
            ("n_ctx", self.n_ctx),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(LoadError::InvalidHyperparameters(format!(
                "{name} must be positive"
            )));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(LoadError::InvalidHyperparameters(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        Ok(())
    }
}

/// Sizing knobs for per-session resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Headroom added on top of the estimated scratch requirement.
    pub scratch_margin_bytes: usize,
    pub scratch_policy: ScratchPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scratch_margin_bytes: 4 * 1024 * 1024,
            scratch_policy: ScratchPolicy::Grow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_tags_round_trip_and_reject_unknown() {
        assert_eq!(WeightFormat::from_tag(0).expect("f32"), WeightFormat::F32);
        assert_eq!(WeightFormat::from_tag(1).expect("f16").tag(), 1);
        assert!(matches!(
            WeightFormat::from_tag(7),
            Err(LoadError::UnsupportedFormat(7))
        ));
        assert_eq!(WeightFormat::F16.element_size(2), 2);
        assert_eq!(WeightFormat::F16.element_size(1), 4);
    }

    #[test]
    fn validate_rejects_indivisible_heads() {
        let mut hparams = Hyperparameters::tiny();
        assert!(hparams.validate().is_ok());
        hparams.n_head = 5;
        let err = hparams.validate().expect_err("indivisible");
        assert!(err.to_string().contains("n_head 5"));
        hparams.n_head = 0;
        assert!(hparams.validate().is_err());
    }

    #[test]
    fn santacoder_dimensions() {
        let hparams = Hyperparameters::santacoder();
        assert_eq!(hparams.head_dim(), 128);
        assert_eq!(hparams.ffn_dim(), 8192);
    }

    #[test]
    fn engine_config_fills_defaults_from_partial_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"scratch_policy":"fail-fast"}"#).expect("parse");
        assert_eq!(config.scratch_policy, ScratchPolicy::FailFast);
        assert_eq!(config.scratch_margin_bytes, 4 * 1024 * 1024);
    }
}
