// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded TTL response cache.
//!
//! Keys hash `(model, canonical(messages), params)`; entries expire
//! after the TTL and the least-recently-used entry is evicted when the
//! cache is full. Best-effort in-memory state — a restart simply
//! starts cold.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{Completion, CompletionRequest};

struct Entry {
    completion: Completion,
    inserted: Instant,
    last_access: Instant,
}

/// Bounded TTL cache for completions.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    /// Create a cache with the given TTL and size bound.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Deterministic cache key for a request.
    #[must_use]
    pub fn key(request: &CompletionRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.model.as_bytes());
        hasher.update(b"|");
        let messages =
            steward_core::canonical_json(&request.messages).unwrap_or_default();
        hasher.update(messages.as_bytes());
        hasher.update(b"|");
        let params = steward_core::canonical_json(&request.params).unwrap_or_default();
        hasher.update(params.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a completion. Expired entries count as misses and are
    /// dropped.
    pub fn get(&self, key: &str) -> Option<Completion> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.inserted) <= self.ttl => {
                entry.last_access = now;
                Some(entry.completion.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a completion, evicting expired then LRU entries as needed.
    pub fn put(&self, key: String, completion: Completion) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();
        entries.retain(|_, e| now.duration_since(e.inserted) <= self.ttl);
        while entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
        entries.insert(
            key,
            Entry {
                completion,
                inserted: now,
                last_access: now,
            },
        );
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    /// Returns `true` when the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
