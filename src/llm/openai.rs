use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{ChatMessage, LlmProvider, http_client, join_url};
use crate::error::LlmError;

const PROVIDER: &str = "openai";

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
}

/// Any OpenAI-compatible chat completions endpoint.
pub struct OpenAiProvider {
    base_url: String,
    model: String,
    api_key: SecretString,
    temperature: f32,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: SecretString,
        temperature: f32,
    ) -> Result<Self, LlmError> {
        let trimmed = endpoint.trim_end_matches('/');
        let base_url = if trimmed.ends_with("/v1") {
            trimmed.to_string()
        } else {
            join_url(trimmed, "v1")
        };
        Ok(Self {
            base_url,
            model: model.to_string(),
            api_key,
            temperature,
            client: http_client(PROVIDER)?,
        })
    }

    fn request_failed(reason: impl std::fmt::Display) -> LlmError {
        LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: reason.to_string(),
        }
    }

    fn check_auth(status: StatusCode) -> Result<(), LlmError> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let res = self
            .client
            .get(join_url(&self.base_url, "models"))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(Self::request_failed)?;
        Self::check_auth(res.status())?;
        if !res.status().is_success() {
            return Err(Self::request_failed(format!("health check returned {}", res.status())));
        }
        Ok(())
    }

    async fn invoke(&self, system_prompt: &str, turns: &[ChatMessage]) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(OpenAiMessage {
            role: "system",
            content: system_prompt,
        });
        messages.extend(turns.iter().map(|m| OpenAiMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        let req = OpenAiRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let res = self
            .client
            .post(join_url(&self.base_url, "chat/completions"))
            .bearer_auth(self.api_key.expose_secret())
            .json(&req)
            .send()
            .await
            .map_err(Self::request_failed)?;

        Self::check_auth(res.status())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(Self::request_failed(format!("{status}: {body}")));
        }

        let parsed: OpenAiResponse = res.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "response contained no choices".to_string(),
            })
    }
}
