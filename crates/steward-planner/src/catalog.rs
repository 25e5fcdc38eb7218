// SPDX-License-Identifier: MIT OR Apache-2.0
//! Playbook catalog and semantic resolution.
//!
//! `deploy_service` tasks name a service, not a playbook. The catalog
//! resolves the name against playbook descriptions by cosine
//! similarity over embeddings, with an exact-alias shortcut that
//! avoids the embedding round-trip entirely.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use steward_llm::Gateway;
use tokio::sync::RwLock;
use tracing::debug;

use crate::PlanError;

/// Similarity floor below which a match is not trusted.
pub const MIN_SIMILARITY: f32 = 0.35;

/// One deployable playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookEntry {
    /// Playbook file name (e.g. `uptime-kuma.yml`).
    pub name: String,
    /// Free-text description used for semantic matching.
    pub description: String,
    /// Service names this playbook deploys (exact-match aliases).
    #[serde(default)]
    pub services: Vec<String>,
}

/// Cached playbook catalog.
pub struct PlaybookCatalog {
    entries: Vec<PlaybookEntry>,
    /// Description embeddings, computed once on first resolve.
    embeddings: RwLock<Option<Arc<Vec<Vec<f32>>>>>,
}

impl PlaybookCatalog {
    /// Build a catalog from entries.
    #[must_use]
    pub fn new(entries: Vec<PlaybookEntry>) -> Self {
        Self {
            entries,
            embeddings: RwLock::new(None),
        }
    }

    /// Parse a catalog from its JSON form (as produced by
    /// `discover_playbooks`).
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidPlan`] when the document is not a
    /// playbook list.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, PlanError> {
        let entries: Vec<PlaybookEntry> = serde_json::from_value(value.clone())
            .map_err(|e| PlanError::InvalidPlan {
                reason: format!("invalid playbook catalog: {e}"),
            })?;
        Ok(Self::new(entries))
    }

    /// All known entries.
    #[must_use]
    pub fn entries(&self) -> &[PlaybookEntry] {
        &self.entries
    }

    /// Resolve a service name to a playbook.
    ///
    /// Exact aliases win without touching the gateway; otherwise the
    /// query is embedded and matched by cosine similarity against the
    /// cached description embeddings.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnresolvedService`] when nothing clears
    /// [`MIN_SIMILARITY`], or [`PlanError::Llm`] when embedding fails.
    pub async fn resolve(
        &self,
        service: &str,
        gateway: &Gateway,
    ) -> Result<PlaybookEntry, PlanError> {
        let needle = service.to_lowercase();
        if let Some(exact) = self.entries.iter().find(|e| {
            e.services.iter().any(|s| s.to_lowercase() == needle)
                || e.name.to_lowercase() == needle
        }) {
            return Ok(exact.clone());
        }
        if self.entries.is_empty() {
            return Err(PlanError::UnresolvedService {
                service: service.to_string(),
            });
        }

        let embeddings = self.description_embeddings(gateway).await?;
        let query = gateway
            .embed(&[service.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PlanError::InvalidPlan {
                reason: "embedding endpoint returned no vectors".into(),
            })?;

        let mut best: Option<(usize, f32)> = None;
        for (idx, candidate) in embeddings.iter().enumerate() {
            let score = cosine_similarity(&query, candidate);
            if best.is_none_or(|(_, current)| score > current) {
                best = Some((idx, score));
            }
        }
        match best {
            Some((idx, score)) if score >= MIN_SIMILARITY => {
                debug!(
                    target: "steward.planner.catalog",
                    service,
                    playbook = %self.entries[idx].name,
                    score,
                    "service resolved"
                );
                Ok(self.entries[idx].clone())
            }
            _ => Err(PlanError::UnresolvedService {
                service: service.to_string(),
            }),
        }
    }

    async fn description_embeddings(
        &self,
        gateway: &Gateway,
    ) -> Result<Arc<Vec<Vec<f32>>>, PlanError> {
        if let Some(cached) = self.embeddings.read().await.as_ref() {
            return Ok(Arc::clone(cached));
        }
        let descriptions: Vec<String> =
            self.entries.iter().map(|e| e.description.clone()).collect();
        let computed = Arc::new(gateway.embed(&descriptions).await?);
        *self.embeddings.write().await = Some(Arc::clone(&computed));
        Ok(computed)
    }
}

/// Cosine similarity of two vectors; 0.0 for mismatched or zero-norm
/// inputs.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, 0.5, 0.2];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn catalog_parses_from_json() {
        let catalog = PlaybookCatalog::from_json(&serde_json::json!([
            {"name": "uptime-kuma.yml", "description": "Deploy Uptime Kuma monitoring", "services": ["uptime-kuma", "kuma"]},
            {"name": "jellyfin.yml", "description": "Deploy the Jellyfin media server"}
        ]))
        .unwrap();
        assert_eq!(catalog.entries().len(), 2);
        assert_eq!(catalog.entries()[0].services.len(), 2);
    }
}
