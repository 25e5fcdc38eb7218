// SPDX-License-Identifier: MIT OR Apache-2.0
//! Orchestrator configuration: recognized keys, defaults, validation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// A value failed a semantic check.
    #[error("invalid configuration value for `{key}`: {reason}")]
    Invalid {
        /// The offending key.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// One provider in the LLM fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    /// Stable provider name (used in logs and quota tracking).
    pub name: String,
    /// Chat-completions base URL (OpenAI-compatible).
    pub base_url: String,
    /// Environment variable holding the API key, if the endpoint
    /// requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Default model requested from this provider.
    pub model: String,
    /// Monthly spend cap in USD used for quota tracking.
    #[serde(default)]
    pub monthly_spend_cap_usd: Option<f64>,
    /// Blended cost estimate used for quota accounting.
    #[serde(default)]
    pub usd_per_million_tokens: Option<f64>,
}

/// Top-level orchestrator configuration.
///
/// Every field has the default named in the public contract; a config
/// file only needs to state what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Seconds without a heartbeat before an agent is unavailable.
    pub heartbeat_ttl_seconds: u64,
    /// Free-capacity percentage below which dispatch pauses.
    pub pause_capacity_threshold_percent: f64,
    /// Resume-loop tick interval in seconds.
    pub pause_resume_interval_seconds: u64,
    /// Consecutive failures that open an agent's circuit breaker.
    pub breaker_consecutive_failures: u32,
    /// Breaker cooldown window in seconds.
    pub breaker_cooldown_seconds: u64,
    /// Maximum retries for a retryable failure.
    pub retry_max_attempts: u32,
    /// Backoff ladder in seconds, one entry per retry.
    pub retry_backoff_seconds: Vec<u64>,
    /// Default task deadline when the plan provides no hint.
    pub default_task_deadline_seconds: u64,
    /// Ordered LLM provider fallback chain.
    pub llm_provider_chain: Vec<LlmProviderConfig>,
    /// Spend percentage at which a provider is pre-emptively skipped.
    pub llm_quota_threshold_percent: f64,
    /// Response-cache time-to-live in seconds.
    pub llm_cache_ttl_seconds: u64,
    /// Response-cache entry bound.
    pub llm_cache_max_entries: usize,
    /// Root of the audit commit log.
    pub audit_log_path: PathBuf,
    /// AMQP broker URL.
    pub bus_url: String,
    /// Postgres connection URL for the state store.
    pub database_url: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_seconds: 30,
            pause_capacity_threshold_percent: 20.0,
            pause_resume_interval_seconds: 10,
            breaker_consecutive_failures: 5,
            breaker_cooldown_seconds: 60,
            retry_max_attempts: 3,
            retry_backoff_seconds: vec![1, 2, 4],
            default_task_deadline_seconds: 30,
            llm_provider_chain: Vec::new(),
            llm_quota_threshold_percent: 80.0,
            llm_cache_ttl_seconds: 3600,
            llm_cache_max_entries: 512,
            audit_log_path: PathBuf::from(".audit/tasks/"),
            bus_url: "amqp://127.0.0.1:5672/%2f".to_string(),
            database_url: "postgres://steward@127.0.0.1/steward".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse failure or invalid values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file from disk and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read/parse failure or invalid values.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check semantic constraints on all values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_ttl_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "heartbeat_ttl_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if !(0.0..=100.0).contains(&self.pause_capacity_threshold_percent) {
            return Err(ConfigError::Invalid {
                key: "pause_capacity_threshold_percent",
                reason: format!(
                    "{} is outside 0..=100",
                    self.pause_capacity_threshold_percent
                ),
            });
        }
        if self.pause_resume_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "pause_resume_interval_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.breaker_consecutive_failures == 0 {
            return Err(ConfigError::Invalid {
                key: "breaker_consecutive_failures",
                reason: "must be greater than zero".into(),
            });
        }
        if self.retry_backoff_seconds.is_empty() {
            return Err(ConfigError::Invalid {
                key: "retry_backoff_seconds",
                reason: "at least one backoff step is required".into(),
            });
        }
        if !(0.0..=100.0).contains(&self.llm_quota_threshold_percent) {
            return Err(ConfigError::Invalid {
                key: "llm_quota_threshold_percent",
                reason: format!("{} is outside 0..=100", self.llm_quota_threshold_percent),
            });
        }
        for provider in &self.llm_provider_chain {
            if provider.name.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "llm_provider_chain",
                    reason: "provider name must not be empty".into(),
                });
            }
            if provider.base_url.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "llm_provider_chain",
                    reason: format!("provider `{}` has an empty base_url", provider.name),
                });
            }
        }
        Ok(())
    }

    /// Heartbeat TTL as a [`Duration`].
    #[must_use]
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_seconds)
    }

    /// Resume-loop tick interval as a [`Duration`].
    #[must_use]
    pub fn resume_interval(&self) -> Duration {
        Duration::from_secs(self.pause_resume_interval_seconds)
    }

    /// Breaker cooldown window as a [`Duration`].
    #[must_use]
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_seconds)
    }

    /// Backoff delay for the given zero-indexed retry attempt.
    ///
    /// Attempts beyond the configured ladder reuse the last step.
    #[must_use]
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.retry_backoff_seconds.len() - 1);
        Duration::from_secs(self.retry_backoff_seconds[idx])
    }
}
