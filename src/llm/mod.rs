//! LLM access for intent extraction and the daily summary.
//!
//! Anthropic and OpenAI are reached through rig-core; `RigAdapter` maps
//! rig's `CompletionModel` onto `LlmProvider`.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::str::FromStr;
use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, LlmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    /// Environment variable holding the API key.
    pub fn key_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "gpt" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    /// `EXEC_ASSIST_LLM_BACKEND` picks the backend; without it Anthropic wins
    /// when `ANTHROPIC_API_KEY` is set, else OpenAI. `EXEC_ASSIST_MODEL`
    /// overrides the backend's default model.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("EXEC_ASSIST_LLM_BACKEND") {
            Ok(name) => name.parse().map_err(|message| ConfigError::InvalidValue {
                key: "EXEC_ASSIST_LLM_BACKEND".to_string(),
                message,
            })?,
            Err(_) if std::env::var(LlmBackend::Anthropic.key_var()).is_ok() => {
                LlmBackend::Anthropic
            }
            Err(_) => LlmBackend::OpenAi,
        };
        let api_key = std::env::var(backend.key_var())
            .map_err(|_| ConfigError::MissingEnvVar(backend.key_var().to_string()))?;
        let model = std::env::var("EXEC_ASSIST_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| backend.default_model().to_string());
        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

fn client_error(backend: LlmBackend, e: impl std::fmt::Display) -> LlmError {
    LlmError::RequestFailed {
        provider: backend.label().to_string(),
        reason: format!("failed to create client: {e}"),
    }
}

/// Build the provider for `config`. No network traffic happens here.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::{anthropic, openai};

    let key = config.api_key.expose_secret();
    let provider: Arc<dyn LlmProvider> = match config.backend {
        LlmBackend::Anthropic => {
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(client.completion_model(&config.model), &config.model))
        }
        LlmBackend::OpenAi => {
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(client.completion_model(&config.model), &config.model))
        }
    };
    tracing::info!(backend = config.backend.label(), model = %config.model, "LLM provider ready");
    Ok(provider)
}
