use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, LlmProvider, http_client, join_url};
use crate::error::LlmError;

const PROVIDER: &str = "ollama";

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageOwned,
}

#[derive(Deserialize)]
struct OllamaMessageOwned {
    #[serde(default)]
    content: String,
}

/// Local Ollama server.
pub struct OllamaProvider {
    endpoint: String,
    model: String,
    temperature: f32,
    client: Client,
}

impl OllamaProvider {
    pub fn new(endpoint: &str, model: &str, temperature: f32) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
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
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let res = self
            .client
            .get(join_url(&self.endpoint, "api/tags"))
            .send()
            .await
            .map_err(Self::request_failed)?;
        if !res.status().is_success() {
            return Err(Self::request_failed(format!("health check returned {}", res.status())));
        }
        Ok(())
    }

    async fn invoke(&self, system_prompt: &str, turns: &[ChatMessage]) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(OllamaMessage {
            role: "system",
            content: system_prompt,
        });
        messages.extend(turns.iter().map(|m| OllamaMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        let req = OllamaRequest {
            model: &self.model,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let res = self
            .client
            .post(join_url(&self.endpoint, "api/chat"))
            .json(&req)
            .send()
            .await
            .map_err(Self::request_failed)?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(Self::request_failed(format!("{status}: {body}")));
        }

        let parsed: OllamaResponse = res.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;
        Ok(parsed.message.content)
    }
}
