// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-provider monthly spend tracking.
//!
//! Counters are best-effort in-memory state flushed opportunistically;
//! under-counting after a crash is acceptable because the conservative
//! startup default is to skip a capped provider until its first
//! refresh lands.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

struct ProviderQuota {
    spent_usd: f64,
    cap_usd: Option<f64>,
    /// Capped providers start unrefreshed and are skipped until an
    /// authoritative spend figure arrives.
    refreshed: bool,
}

/// Tracks monthly spend per provider and answers "should this provider
/// be skipped pre-emptively?".
pub struct QuotaTracker {
    providers: Mutex<HashMap<String, ProviderQuota>>,
    threshold_percent: f64,
}

impl QuotaTracker {
    /// Create a tracker with the configured skip threshold.
    #[must_use]
    pub fn new(threshold_percent: f64) -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
            threshold_percent,
        }
    }

    /// Register a provider and its cap. Uncapped providers are always
    /// admitted and never need a refresh.
    pub fn register(&self, provider: &str, cap_usd: Option<f64>) {
        let mut providers = self.providers.lock().expect("quota lock poisoned");
        providers.insert(
            provider.to_string(),
            ProviderQuota {
                spent_usd: 0.0,
                cap_usd,
                refreshed: cap_usd.is_none(),
            },
        );
    }

    /// Replace the in-memory counter with an authoritative figure.
    pub fn refresh(&self, provider: &str, spent_usd: f64) {
        let mut providers = self.providers.lock().expect("quota lock poisoned");
        if let Some(quota) = providers.get_mut(provider) {
            quota.spent_usd = spent_usd;
            quota.refreshed = true;
            debug!(
                target: "steward.llm.quota",
                provider,
                spent_usd,
                "quota refreshed"
            );
        }
    }

    /// Add an estimated cost for one completed call.
    pub fn record(&self, provider: &str, cost_usd: f64) {
        let mut providers = self.providers.lock().expect("quota lock poisoned");
        if let Some(quota) = providers.get_mut(provider) {
            quota.spent_usd += cost_usd;
        }
    }

    /// Returns `true` when the provider should be skipped: unknown,
    /// capped-but-unrefreshed, or past the spend threshold.
    #[must_use]
    pub fn should_skip(&self, provider: &str) -> bool {
        let providers = self.providers.lock().expect("quota lock poisoned");
        let Some(quota) = providers.get(provider) else {
            return true;
        };
        let Some(cap) = quota.cap_usd else {
            return false;
        };
        if !quota.refreshed {
            warn!(
                target: "steward.llm.quota",
                provider,
                "capped provider not yet refreshed, skipping"
            );
            return true;
        }
        if cap <= 0.0 {
            return true;
        }
        (quota.spent_usd / cap) * 100.0 >= self.threshold_percent
    }

    /// Current spend for a provider, if registered.
    #[must_use]
    pub fn spent_usd(&self, provider: &str) -> Option<f64> {
        let providers = self.providers.lock().expect("quota lock poisoned");
        providers.get(provider).map(|q| q.spent_usd)
    }
}
