// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry queue for failed audit writes.
//!
//! Audit failures must not block the execution supervisor: the task
//! stays terminal in the state store and the artifact is parked here
//! for a later flush. Crossing the alert threshold raises an ERROR log
//! line for the operator.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::{AuditArtifact, AuditError, AuditLog};

/// Queue depth at which an alert is raised.
pub const RETRY_ALERT_THRESHOLD: usize = 32;

/// Parked audit writes awaiting a flush.
#[derive(Clone)]
pub struct AuditRetryQueue {
    inner: Arc<Mutex<VecDeque<AuditArtifact>>>,
    alert_threshold: usize,
}

impl AuditRetryQueue {
    /// Create a queue with the default alert threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(RETRY_ALERT_THRESHOLD)
    }

    /// Create a queue with a custom alert threshold.
    #[must_use]
    pub fn with_threshold(alert_threshold: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            alert_threshold,
        }
    }

    /// Park an artifact whose write failed.
    pub async fn park(&self, artifact: AuditArtifact, cause: &AuditError) {
        let mut queue = self.inner.lock().await;
        warn!(
            target: "steward.audit.retry",
            task_id = %artifact.task_id,
            error = %cause,
            "audit write failed, parked for retry"
        );
        queue.push_back(artifact);
        if queue.len() > self.alert_threshold {
            error!(
                target: "steward.audit.retry",
                depth = queue.len(),
                threshold = self.alert_threshold,
                "audit retry queue exceeded alert threshold"
            );
        }
    }

    /// Current queue depth.
    pub async fn depth(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Retry every parked artifact against `log`. Artifacts that fail
    /// again are re-parked in order; a divergence is dropped with an
    /// ERROR, since retrying it can never succeed.
    ///
    /// Returns how many artifacts were flushed.
    pub async fn flush(&self, log: &AuditLog) -> usize {
        let mut queue = self.inner.lock().await;
        let mut remaining = VecDeque::new();
        let mut flushed = 0;
        while let Some(artifact) = queue.pop_front() {
            match log.record(&artifact) {
                Ok(_) => flushed += 1,
                Err(AuditError::Diverged { task_id }) => {
                    error!(
                        target: "steward.audit.retry",
                        %task_id,
                        "parked artifact diverges from stored artifact; dropping"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "steward.audit.retry",
                        task_id = %artifact.task_id,
                        error = %e,
                        "audit retry failed, keeping parked"
                    );
                    remaining.push_back(artifact);
                }
            }
        }
        *queue = remaining;
        flushed
    }
}

impl Default for AuditRetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use steward_core::{
        ApprovalStatus, Plan, ResourceBudget, RiskLevel, Task, TaskStatus, WorkType,
    };
    use uuid::Uuid;

    fn artifact() -> AuditArtifact {
        let mut task = Task::new(Uuid::new_v4(), 0, WorkType::RunPlaybook, serde_json::json!({}));
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        let plan = Plan {
            id: task.plan_id,
            request_id: Uuid::new_v4(),
            summary: "s".into(),
            risk: RiskLevel::Low,
            estimated_duration_seconds: 0,
            budget: ResourceBudget::default(),
            approval: ApprovalStatus::Approved,
            approver: None,
            decided_at: None,
            tasks: vec![],
        };
        AuditArtifact::from_task(&task, &plan)
    }

    #[tokio::test]
    async fn flush_drains_parked_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join(".audit/tasks"));
        let queue = AuditRetryQueue::new();

        queue
            .park(artifact(), &AuditError::ChainCorrupt("synthetic".into()))
            .await;
        queue
            .park(artifact(), &AuditError::ChainCorrupt("synthetic".into()))
            .await;
        assert_eq!(queue.depth().await, 2);

        let flushed = queue.flush(&log).await;
        assert_eq!(flushed, 2);
        assert_eq!(queue.depth().await, 0);
        assert_eq!(log.commits().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn flush_after_manual_record_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join(".audit/tasks"));
        let queue = AuditRetryQueue::new();

        let parked = artifact();
        log.record(&parked).unwrap();
        queue
            .park(parked, &AuditError::ChainCorrupt("synthetic".into()))
            .await;

        let flushed = queue.flush(&log).await;
        assert_eq!(flushed, 1);
        assert_eq!(log.commits().unwrap().len(), 1);
    }
}
