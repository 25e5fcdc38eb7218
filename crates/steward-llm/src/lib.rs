// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-llm
#![deny(unsafe_code)]

mod cache;
mod gateway;
mod provider;
mod quota;

pub use cache::ResponseCache;
pub use gateway::Gateway;
pub use provider::HttpProvider;
pub use quota::QuotaTracker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use steward_core::cancel::CancelToken;
use thiserror::Error;

/// One chat message in a completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    /// Build a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Completion token cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Ask the provider for a strict-JSON response.
    #[serde(default)]
    pub json_mode: bool,
}

/// A completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier. Empty means "the provider's default model".
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Sampling parameters.
    #[serde(default)]
    pub params: CompletionParams,
}

/// Token counters reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed.
    pub prompt_tokens: u64,
    /// Completion tokens produced.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Total tokens in this exchange.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A successful completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// The assistant's text.
    pub content: String,
    /// Model that actually answered.
    pub model: String,
    /// Provider that answered.
    pub provider: String,
    /// Token usage.
    pub usage: TokenUsage,
}

/// Errors from completion providers and the gateway.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider did not answer within the deadline.
    #[error("provider `{provider}` timed out")]
    Timeout {
        /// The provider that timed out.
        provider: String,
    },

    /// Transport-level failure (connect, TLS, 5xx).
    #[error("provider `{provider}` transport error: {reason}")]
    Transport {
        /// The failing provider.
        provider: String,
        /// What went wrong.
        reason: String,
    },

    /// The provider rejected our credentials. Not retried, not
    /// fallen through — a different provider will not fix a bad key.
    #[error("provider `{provider}` rejected authentication")]
    Auth {
        /// The rejecting provider.
        provider: String,
    },

    /// The requested model does not exist on this provider. Aborts the
    /// chain: falling through would silently answer with a different
    /// model than the caller pinned.
    #[error("provider `{provider}` does not serve model `{model}`")]
    ModelNotFound {
        /// The provider.
        provider: String,
        /// The missing model.
        model: String,
    },

    /// The provider answered with something unparsable.
    #[error("provider `{provider}` returned an invalid response: {reason}")]
    InvalidResponse {
        /// The provider.
        provider: String,
        /// Parse failure detail.
        reason: String,
    },

    /// The operation was cancelled.
    #[error("completion cancelled")]
    Cancelled,

    /// Every provider in the chain was skipped or failed.
    #[error("all providers exhausted: {summary}")]
    Exhausted {
        /// Per-provider failure summary.
        summary: String,
    },
}

impl LlmError {
    /// Returns `true` when the chain should try the next provider.
    #[must_use]
    pub fn falls_through(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Transport { .. } | Self::InvalidResponse { .. }
        )
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stable provider name (used in logs and quota tracking).
    fn name(&self) -> &str;

    /// Produce a completion.
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<Completion, LlmError>;

    /// Embed texts for similarity search.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}
