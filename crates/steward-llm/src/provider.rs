// SPDX-License-Identifier: MIT OR Apache-2.0
//! OpenAI-compatible HTTP provider.
//!
//! Works against any endpoint that speaks `/chat/completions` and
//! `/embeddings` — a homelab llama.cpp/vLLM proxy or a hosted API.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use steward_core::cancel::CancelToken;
use steward_core::config::LlmProviderConfig;
use tracing::debug;

use crate::{Completion, CompletionProvider, CompletionRequest, LlmError, TokenUsage};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// [`CompletionProvider`] backed by an OpenAI-compatible HTTP endpoint.
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageBody,
}

#[derive(Deserialize)]
struct MessageBody {
    content: String,
}

#[derive(Deserialize, Default)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

impl HttpProvider {
    /// Build a provider from its configuration, resolving the API key
    /// from the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Transport`] if the HTTP client cannot be
    /// constructed.
    pub fn from_config(config: &LlmProviderConfig, timeout: Duration) -> Result<Self, LlmError> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Transport {
                provider: config.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: config.model.clone(),
            client,
        })
    }

    /// Build a provider directly (used by tests against wiremock).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            default_model: default_model.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("default reqwest client"),
        }
    }

    fn effective_model(&self, requested: &str) -> String {
        if requested.is_empty() {
            self.default_model.clone()
        } else {
            requested.to_string()
        }
    }

    fn classify_status(&self, status: reqwest::StatusCode, model: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::Auth {
                provider: self.name.clone(),
            },
            404 => LlmError::ModelNotFound {
                provider: self.name.clone(),
                model: model.to_string(),
            },
            code => LlmError::Transport {
                provider: self.name.clone(),
                reason: format!("http status {code}"),
            },
        }
    }

    fn transport_error(&self, e: &reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                provider: self.name.clone(),
            }
        } else {
            LlmError::Transport {
                provider: self.name.clone(),
                reason: e.to_string(),
            }
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<Completion, LlmError> {
        let model = self.effective_model(&request.model);
        let mut body = serde_json::json!({
            "model": model,
            "messages": request.messages,
        });
        if let Some(temperature) = request.params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = request.params.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if request.params.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", self.base_url);
        debug!(target: "steward.llm.http", provider = %self.name, %model, "chat completion");

        let send = self.authorize(self.client.post(&url)).json(&body).send();
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(LlmError::Cancelled),
            result = send => result.map_err(|e| self.transport_error(&e))?,
        };

        if !response.status().is_success() {
            return Err(self.classify_status(response.status(), &model));
        }

        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: self.name.clone(),
                    reason: e.to_string(),
                })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.name.clone(),
                reason: "no choices in response".into(),
            })?;
        let usage = parsed.usage.unwrap_or_default();
        Ok(Completion {
            content: choice.message.content,
            model: parsed.model.unwrap_or(model),
            provider: self.name.clone(),
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.default_model,
            "input": texts,
        });
        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        if !response.status().is_success() {
            return Err(self.classify_status(response.status(), &self.default_model));
        }
        let parsed: EmbeddingsResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: self.name.clone(),
                    reason: e.to_string(),
                })?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
