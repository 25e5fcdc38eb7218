// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deadline tracking for in-flight tasks.
//!
//! A task is armed at dispatch with its effective deadline and
//! re-armed on every progress message. The supervisor's ticker drains
//! expired entries and synthesizes timeout errors for them. Monotonic
//! clock only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Entry {
    expires_at: Instant,
    window: Duration,
}

/// Cloneable tracker of per-task deadlines.
#[derive(Clone, Default)]
pub struct DeadlineTracker {
    entries: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl DeadlineTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a task with the given window.
    pub fn arm(&self, task_id: Uuid, window: Duration) {
        let mut entries = self.entries.lock().expect("deadline lock poisoned");
        entries.insert(
            task_id,
            Entry {
                expires_at: Instant::now() + window,
                window,
            },
        );
    }

    /// Push a task's deadline out by its original window (progress was
    /// observed).
    pub fn refresh(&self, task_id: Uuid) {
        let mut entries = self.entries.lock().expect("deadline lock poisoned");
        if let Some(entry) = entries.get_mut(&task_id) {
            entry.expires_at = Instant::now() + entry.window;
        }
    }

    /// Stop tracking a task.
    pub fn disarm(&self, task_id: Uuid) {
        let mut entries = self.entries.lock().expect("deadline lock poisoned");
        entries.remove(&task_id);
    }

    /// Remove and return every expired task.
    #[must_use]
    pub fn drain_expired(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("deadline lock poisoned");
        let expired: Vec<Uuid> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }

    /// Number of armed tasks.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.entries.lock().expect("deadline lock poisoned").len()
    }
}
