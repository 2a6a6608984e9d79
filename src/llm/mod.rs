//! LLM integration for the worker swarm.
//!
//! Supports:
//! - **Ollama**: local models over `/api/chat`
//! - **OpenAI-compatible**: any `/v1/chat/completions` endpoint
//!
//! Both adapters speak JSON over `reqwest` and surface every transport or
//! decoding failure as an [`LlmError`].

mod ollama;
mod openai;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::config::env_parse;
use crate::error::{ConfigError, LlmError};

/// Per-request timeout for model calls. Local models can be slow.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A model endpoint a worker talks to.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Cheap reachability check.
    async fn health_check(&self) -> Result<(), LlmError>;

    /// Send the system prompt and conversation, returning the reply text.
    async fn invoke(&self, system_prompt: &str, turns: &[ChatMessage]) -> Result<String, LlmError>;
}

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    Ollama,
    OpenAi,
}

impl std::str::FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" | "open_ai" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend '{other}'")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub temperature: f32,
}

impl LlmConfig {
    pub fn ollama(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend: LlmBackend::Ollama,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
            temperature: 0.7,
        }
    }

    /// Load from `SWARM_LLM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = env_parse("SWARM_LLM_BACKEND")?.unwrap_or(LlmBackend::Ollama);
        let endpoint = std::env::var("SWARM_LLM_ENDPOINT")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let model = std::env::var("SWARM_LLM_MODEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "qwen2.5-coder".to_string());
        let api_key = std::env::var("SWARM_LLM_API_KEY")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        let temperature = env_parse("SWARM_LLM_TEMPERATURE")?.unwrap_or(0.7);

        if backend == LlmBackend::OpenAi && api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("SWARM_LLM_API_KEY".to_string()));
        }

        Ok(Self {
            backend,
            endpoint,
            model,
            api_key,
            temperature,
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Ollama => {
            tracing::info!("Using Ollama at {} (model: {})", config.endpoint, config.model);
            Ok(Arc::new(OllamaProvider::new(
                &config.endpoint,
                &config.model,
                config.temperature,
            )?))
        }
        LlmBackend::OpenAi => {
            let api_key = config.api_key.clone().ok_or_else(|| LlmError::AuthFailed {
                provider: "openai".to_string(),
            })?;
            tracing::info!("Using OpenAI-compatible endpoint {} (model: {})", config.endpoint, config.model);
            Ok(Arc::new(OpenAiProvider::new(
                &config.endpoint,
                &config.model,
                api_key,
                config.temperature,
            )?))
        }
    }
}

/// Shared HTTP client construction for the adapters.
pub(crate) fn http_client(provider: &str) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("Failed to build HTTP client: {e}"),
        })
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
