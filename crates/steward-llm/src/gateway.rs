// SPDX-License-Identifier: MIT OR Apache-2.0
//! The fallback chain.
//!
//! A request traverses the configured provider list in order until one
//! succeeds or the chain is exhausted. Quota-skipped providers are
//! passed over pre-emptively; auth and model-not-found errors abort
//! the traversal.

use std::sync::Arc;
use std::time::Duration;
use steward_core::cancel::CancelToken;
use steward_core::config::{LlmProviderConfig, OrchestratorConfig};
use tracing::{info, warn};

use crate::{
    Completion, CompletionProvider, CompletionRequest, HttpProvider, LlmError, QuotaTracker,
    ResponseCache,
};

struct ChainEntry {
    provider: Arc<dyn CompletionProvider>,
    usd_per_million_tokens: f64,
}

/// Vendor-agnostic completion gateway with fallback, quota tracking,
/// and response caching.
pub struct Gateway {
    chain: Vec<ChainEntry>,
    quota: QuotaTracker,
    cache: ResponseCache,
}

impl Gateway {
    /// Assemble the gateway from configuration, building one HTTP
    /// provider per chain entry.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] if a provider client cannot be built.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, LlmError> {
        let quota = QuotaTracker::new(config.llm_quota_threshold_percent);
        let mut chain = Vec::with_capacity(config.llm_provider_chain.len());
        for provider_config in &config.llm_provider_chain {
            quota.register(&provider_config.name, provider_config.monthly_spend_cap_usd);
            let provider =
                HttpProvider::from_config(provider_config, crate::provider::DEFAULT_TIMEOUT)?;
            chain.push(ChainEntry {
                provider: Arc::new(provider),
                usd_per_million_tokens: provider_config.usd_per_million_tokens.unwrap_or(0.0),
            });
        }
        Ok(Self {
            chain,
            quota,
            cache: ResponseCache::new(
                Duration::from_secs(config.llm_cache_ttl_seconds),
                config.llm_cache_max_entries,
            ),
        })
    }

    /// Assemble a gateway from pre-built providers (tests, embedding
    /// custom backends).
    #[must_use]
    pub fn new(
        providers: Vec<Arc<dyn CompletionProvider>>,
        configs: &[LlmProviderConfig],
        quota_threshold_percent: f64,
        cache_ttl: Duration,
        cache_max_entries: usize,
    ) -> Self {
        let quota = QuotaTracker::new(quota_threshold_percent);
        let mut chain = Vec::with_capacity(providers.len());
        for provider in providers {
            let config = configs.iter().find(|c| c.name == provider.name());
            let cap = config.and_then(|c| c.monthly_spend_cap_usd);
            quota.register(provider.name(), cap);
            chain.push(ChainEntry {
                provider,
                usd_per_million_tokens: config
                    .and_then(|c| c.usd_per_million_tokens)
                    .unwrap_or(0.0),
            });
        }
        Self {
            chain,
            quota,
            cache: ResponseCache::new(cache_ttl, cache_max_entries),
        }
    }

    /// The quota tracker, for refreshes from an accounting source.
    #[must_use]
    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Complete a request through the fallback chain.
    ///
    /// # Errors
    ///
    /// - The first non-fall-through provider error (auth,
    ///   model-not-found, cancellation) aborts immediately.
    /// - [`LlmError::Exhausted`] when every provider was skipped or
    ///   failed transiently.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<Completion, LlmError> {
        let key = ResponseCache::key(request);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let mut failures: Vec<String> = Vec::new();
        for entry in &self.chain {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            let name = entry.provider.name().to_string();
            if self.quota.should_skip(&name) {
                failures.push(format!("{name}: skipped by quota"));
                continue;
            }
            match entry.provider.complete(request, cancel).await {
                Ok(completion) => {
                    let cost = completion.usage.total() as f64 / 1_000_000.0
                        * entry.usd_per_million_tokens;
                    if cost > 0.0 {
                        self.quota.record(&name, cost);
                    }
                    info!(
                        target: "steward.llm.gateway",
                        provider = %name,
                        model = %completion.model,
                        tokens = completion.usage.total(),
                        "completion served"
                    );
                    self.cache.put(key, completion.clone());
                    return Ok(completion);
                }
                Err(e) if e.falls_through() => {
                    warn!(
                        target: "steward.llm.gateway",
                        provider = %name,
                        error = %e,
                        "provider failed, falling through"
                    );
                    failures.push(format!("{name}: {e}"));
                }
                Err(e) => return Err(e),
            }
        }
        Err(LlmError::Exhausted {
            summary: if failures.is_empty() {
                "provider chain is empty".to_string()
            } else {
                failures.join("; ")
            },
        })
    }

    /// Embed texts via the first provider that succeeds.
    ///
    /// # Errors
    ///
    /// Same abort/fall-through rules as [`complete`](Self::complete).
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut failures: Vec<String> = Vec::new();
        for entry in &self.chain {
            let name = entry.provider.name().to_string();
            if self.quota.should_skip(&name) {
                failures.push(format!("{name}: skipped by quota"));
                continue;
            }
            match entry.provider.embed(texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) if e.falls_through() => {
                    failures.push(format!("{name}: {e}"));
                }
                Err(e) => return Err(e),
            }
        }
        Err(LlmError::Exhausted {
            summary: if failures.is_empty() {
                "provider chain is empty".to_string()
            } else {
                failures.join("; ")
            },
        })
    }
}
