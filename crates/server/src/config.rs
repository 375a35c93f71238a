//! Server configuration, loadable from a JSON file.

use anyhow::{Context, Result};
use excoder_llm::{EngineConfig, TokenId};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How evaluation state is shared between concurrent requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPolicy {
    /// One cache and arena behind a mutex. Requests queue.
    #[default]
    Shared,
    /// A fresh cache and arena per request.
    PerRequest,
}

/// Values used when a request leaves a field out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 200,
            temperature: 0.6,
            top_k: 40,
            top_p: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Reported as `model` in completion responses.
    pub model_label: String,
    pub session_policy: SessionPolicy,
    pub batch_size: usize,
    /// Fixed sampling seed. Each request draws its own when absent.
    pub seed: Option<u64>,
    /// Overrides the vocabulary's `<|endoftext|>` id.
    pub eos_token: Option<TokenId>,
    pub defaults: RequestDefaults,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18080,
            model_label: "excoder".to_string(),
            session_policy: SessionPolicy::Shared,
            batch_size: 8,
            seed: None,
            eos_token: None,
            defaults: RequestDefaults::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read server config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse server config {}", path.display()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use excoder_llm::ScratchPolicy;
    use std::io::Write;

    #[test]
    fn defaults_match_completion_tool() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:18080");
        assert_eq!(config.defaults.max_tokens, 200);
        assert!((config.defaults.temperature - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.session_policy, SessionPolicy::Shared);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"port": 9000, "session_policy": "per-request",
                "engine": {{"scratch_policy": "fail-fast"}}}}"#
        )
        .expect("write");

        let config = ServerConfig::from_json_file(file.path()).expect("parse");
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.session_policy, SessionPolicy::PerRequest);
        assert_eq!(config.engine.scratch_policy, ScratchPolicy::FailFast);
        assert_eq!(config.defaults.top_k, 40);
    }

    #[test]
    fn unreadable_file_reports_path() {
        let err = ServerConfig::from_json_file("/nonexistent/excoder.json").expect_err("missing");
        assert!(err.to_string().contains("/nonexistent/excoder.json"));
    }
}
