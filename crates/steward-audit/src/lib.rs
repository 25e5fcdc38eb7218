// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-audit
#![deny(unsafe_code)]

mod retry;

pub use retry::{AuditRetryQueue, RETRY_ALERT_THRESHOLD};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use steward_core::{
    FailureInfo, Plan, ResourcesUsed, RiskLevel, Task, TaskOutcome, TaskStatus, WorkType,
    canonical_json, sha256_hex,
};
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

/// Errors from audit log operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Filesystem failure.
    #[error("audit I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("audit serialization failed: {0}")]
    Json(#[from] steward_core::ContractError),

    /// An artifact for this task already exists with different content.
    /// This is a bug somewhere upstream; the log never overwrites.
    #[error("audit artifact for task {task_id} diverges from the stored artifact")]
    Diverged {
        /// The conflicting task.
        task_id: Uuid,
    },

    /// The commit log on disk is corrupt.
    #[error("audit commit log corrupt: {0}")]
    ChainCorrupt(String),
}

/// Snapshot of the plan a task belonged to, embedded in its artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    /// The plan id.
    pub plan_id: Uuid,
    /// The owning request id.
    pub request_id: Uuid,
    /// Plan summary at approval time.
    pub summary: String,
    /// Plan risk level.
    pub risk: RiskLevel,
}

/// Snapshot of the dispatch that produced the terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSnapshot {
    /// The agent that ran (or was to run) the task.
    pub agent_id: Option<String>,
    /// The work type dispatched.
    pub work_type: WorkType,
    /// The parameters dispatched.
    pub parameters: serde_json::Value,
    /// When the task was dispatched.
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Retries consumed before the terminal outcome.
    pub retry_count: u32,
    /// The idempotency key correlating wire messages.
    pub idempotency_key: Uuid,
}

/// The JSON document written once per terminal task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditArtifact {
    /// The terminal task.
    pub task_id: Uuid,
    /// Its terminal status.
    pub status: TaskStatus,
    /// Plan context.
    pub plan: PlanSnapshot,
    /// Dispatch context.
    pub dispatch: DispatchSnapshot,
    /// Structured outcome, when the agent produced one.
    pub outcome: Option<TaskOutcome>,
    /// Failure classification, when the task failed.
    pub failure: Option<FailureInfo>,
    /// Resources the task consumed.
    pub resources_used: Option<ResourcesUsed>,
    /// Services the task touched.
    pub services_touched: Vec<String>,
    /// Artifact timestamp. Derived from the task's completion time so
    /// idempotent re-records serialize identically.
    pub recorded_at: DateTime<Utc>,
}

impl AuditArtifact {
    /// Build the artifact for a terminal task.
    #[must_use]
    pub fn from_task(task: &Task, plan: &Plan) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            plan: PlanSnapshot {
                plan_id: plan.id,
                request_id: plan.request_id,
                summary: plan.summary.clone(),
                risk: plan.risk,
            },
            dispatch: DispatchSnapshot {
                agent_id: task.agent_id.clone(),
                work_type: task.work_type,
                parameters: task.parameters.clone(),
                dispatched_at: task.dispatched_at,
                retry_count: task.retry_count,
                idempotency_key: task.idempotency_key,
            },
            outcome: task.outcome.clone(),
            failure: task.failure.clone(),
            resources_used: task.resources_used.clone(),
            services_touched: task.services_touched.clone(),
            recorded_at: task.completed_at.unwrap_or(task.created_at),
        }
    }
}

/// One entry of the commit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditCommit {
    /// Hash of the previous commit; `None` for the first.
    pub parent: Option<String>,
    /// SHA-256 of the canonical artifact content.
    pub artifact_sha256: String,
    /// The committed task.
    pub task_id: Uuid,
    /// Its terminal status.
    pub status: TaskStatus,
    /// `audit: <task_id> <status> at <iso8601>`.
    pub message: String,
    /// When the commit was appended.
    pub committed_at: DateTime<Utc>,
    /// Hash of this commit (over the canonical form with this field
    /// nulled, so the stored hash is not self-referential).
    pub commit_sha256: Option<String>,
}

fn commit_hash(commit: &AuditCommit) -> Result<String, AuditError> {
    let mut v = serde_json::to_value(commit)
        .map_err(|e| AuditError::Json(steward_core::ContractError::Json(e)))?;
    if let serde_json::Value::Object(map) = &mut v {
        map.insert("commit_sha256".to_string(), serde_json::Value::Null);
    }
    let json = canonical_json(&v)?;
    Ok(sha256_hex(json.as_bytes()))
}

/// Result of verifying the stored commit chain.
#[derive(Debug, Clone)]
pub struct ChainVerification {
    /// Number of commits inspected.
    pub commit_count: usize,
    /// Task ids whose commit hash did not recompute.
    pub invalid_commits: Vec<Uuid>,
    /// Task ids whose parent link does not match the preceding commit.
    pub broken_links: Vec<Uuid>,
    /// Task ids whose artifact file is missing or hashes differently.
    pub artifact_mismatches: Vec<Uuid>,
    /// `true` when every check passed.
    pub is_valid: bool,
}

/// Append-only, content-addressed audit log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    tasks_dir: PathBuf,
    commits_path: PathBuf,
}

impl AuditLog {
    /// Create a log rooted at the artifact directory (the configured
    /// `audit_log_path`). The commit log lives beside it.
    #[must_use]
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        let tasks_dir: PathBuf = tasks_dir.into();
        let commits_path = tasks_dir
            .parent()
            .map(|p| p.join("commits.jsonl"))
            .unwrap_or_else(|| PathBuf::from("commits.jsonl"));
        Self {
            tasks_dir,
            commits_path,
        }
    }

    /// Path of the artifact for a task.
    #[must_use]
    pub fn artifact_path(&self, task_id: Uuid) -> PathBuf {
        self.tasks_dir.join(format!("{task_id}.json"))
    }

    /// Record a terminal task.
    ///
    /// Returns `true` when a new artifact and commit were written,
    /// `false` when an identical artifact already existed (no new
    /// commit). An existing artifact with different content fails with
    /// [`AuditError::Diverged`] — never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on I/O or serialization failure, or on
    /// divergence.
    pub fn record(&self, artifact: &AuditArtifact) -> Result<bool, AuditError> {
        std::fs::create_dir_all(&self.tasks_dir)?;
        let path = self.artifact_path(artifact.task_id);
        let canonical = canonical_json(artifact)?;

        if path.exists() {
            let existing = std::fs::read_to_string(&path)?;
            let existing_canonical = reserialize(&existing)?;
            if existing_canonical == canonical {
                debug!(
                    target: "steward.audit",
                    task_id = %artifact.task_id,
                    "artifact already recorded, no-op"
                );
                return Ok(false);
            }
            error!(
                target: "steward.audit",
                task_id = %artifact.task_id,
                "artifact divergence detected; refusing to overwrite"
            );
            return Err(AuditError::Diverged {
                task_id: artifact.task_id,
            });
        }

        // Write the artifact before the commit so a crash between the
        // two leaves a file the next record() call can reconcile.
        let pretty = serde_json::to_string_pretty(artifact)
            .map_err(|e| AuditError::Json(steward_core::ContractError::Json(e)))?;
        write_atomic(&path, pretty.as_bytes())?;

        let parent = self.head_hash()?;
        let mut commit = AuditCommit {
            parent,
            artifact_sha256: sha256_hex(canonical.as_bytes()),
            task_id: artifact.task_id,
            status: artifact.status,
            message: format!(
                "audit: {} {} at {}",
                artifact.task_id,
                artifact.status,
                artifact.recorded_at.to_rfc3339()
            ),
            committed_at: Utc::now(),
            commit_sha256: None,
        };
        commit.commit_sha256 = Some(commit_hash(&commit)?);
        self.append_commit(&commit)?;
        debug!(
            target: "steward.audit",
            task_id = %artifact.task_id,
            status = %artifact.status,
            "artifact committed"
        );
        Ok(true)
    }

    /// Load an artifact by task id, if present.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if the file exists but cannot be parsed.
    pub fn load(&self, task_id: Uuid) -> Result<Option<AuditArtifact>, AuditError> {
        let path = self.artifact_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let artifact = serde_json::from_str(&text)
            .map_err(|e| AuditError::ChainCorrupt(format!("artifact {task_id}: {e}")))?;
        Ok(Some(artifact))
    }

    /// All commits, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ChainCorrupt`] if any line fails to parse.
    pub fn commits(&self) -> Result<Vec<AuditCommit>, AuditError> {
        if !self.commits_path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.commits_path)?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .map_err(|e| AuditError::ChainCorrupt(format!("commit line {}: {e}", i + 1)))
            })
            .collect()
    }

    /// Replay the commit log: recompute every commit hash, verify the
    /// parent links, and re-hash every artifact on disk.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if the log itself cannot be read.
    pub fn verify_chain(&self) -> Result<ChainVerification, AuditError> {
        let commits = self.commits()?;
        let mut invalid_commits = Vec::new();
        let mut broken_links = Vec::new();
        let mut artifact_mismatches = Vec::new();
        let mut previous_hash: Option<String> = None;

        for commit in &commits {
            let recomputed = commit_hash(commit)?;
            if commit.commit_sha256.as_deref() != Some(recomputed.as_str()) {
                invalid_commits.push(commit.task_id);
            }
            if commit.parent != previous_hash {
                broken_links.push(commit.task_id);
            }
            previous_hash = commit.commit_sha256.clone();

            match self.load(commit.task_id) {
                Ok(Some(artifact)) => {
                    let canonical = canonical_json(&artifact)?;
                    if sha256_hex(canonical.as_bytes()) != commit.artifact_sha256 {
                        artifact_mismatches.push(commit.task_id);
                    }
                }
                _ => artifact_mismatches.push(commit.task_id),
            }
        }

        let is_valid =
            invalid_commits.is_empty() && broken_links.is_empty() && artifact_mismatches.is_empty();
        Ok(ChainVerification {
            commit_count: commits.len(),
            invalid_commits,
            broken_links,
            artifact_mismatches,
            is_valid,
        })
    }

    fn head_hash(&self) -> Result<Option<String>, AuditError> {
        Ok(self.commits()?.last().and_then(|c| c.commit_sha256.clone()))
    }

    fn append_commit(&self, commit: &AuditCommit) -> Result<(), AuditError> {
        use std::io::Write;
        if let Some(parent) = self.commits_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(commit)
            .map_err(|e| AuditError::Json(steward_core::ContractError::Json(e)))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.commits_path)?;
        writeln!(file, "{line}")?;
        file.sync_all()?;
        Ok(())
    }
}

/// Parse stored JSON and re-serialize canonically for comparison.
fn reserialize(text: &str) -> Result<String, AuditError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| AuditError::ChainCorrupt(format!("stored artifact unparsable: {e}")))?;
    Ok(canonical_json(&value)?)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AuditError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::{ApprovalStatus, Plan, ResourceBudget, Task, WorkType};

    fn terminal_task_and_plan(status: TaskStatus) -> (Task, Plan) {
        let mut task = Task::new(
            Uuid::new_v4(),
            0,
            WorkType::RunPlaybook,
            serde_json::json!({"playbook": "kuma.yml"}),
        );
        task.status = status;
        task.agent_id = Some("ansible-1".into());
        task.completed_at = Some(Utc::now());
        task.services_touched = vec!["uptime-kuma".into()];
        task.outcome = Some(TaskOutcome {
            exit_code: Some(0),
            output: Some("ok".into()),
        });
        task.resources_used = Some(ResourcesUsed {
            duration_seconds: 3.0,
            gpu_vram_mb: None,
            cpu_time_ms: Some(200),
        });
        let plan = Plan {
            id: task.plan_id,
            request_id: Uuid::new_v4(),
            summary: "deploy kuma".into(),
            risk: RiskLevel::Low,
            estimated_duration_seconds: 60,
            budget: ResourceBudget::default(),
            approval: ApprovalStatus::Approved,
            approver: Some("sam".into()),
            decided_at: Some(Utc::now()),
            tasks: vec![],
        };
        (task, plan)
    }

    fn log_in(dir: &tempfile::TempDir) -> AuditLog {
        AuditLog::new(dir.path().join(".audit/tasks"))
    }

    #[test]
    fn record_writes_artifact_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        let (task, plan) = terminal_task_and_plan(TaskStatus::Success);
        let artifact = AuditArtifact::from_task(&task, &plan);

        assert!(log.record(&artifact).unwrap());
        assert!(log.artifact_path(task.id).exists());

        let commits = log.commits().unwrap();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].message.starts_with(&format!("audit: {}", task.id)));
        assert!(commits[0].message.contains("success"));
        assert!(commits[0].parent.is_none());
    }

    #[test]
    fn record_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        let (task, plan) = terminal_task_and_plan(TaskStatus::Success);
        let artifact = AuditArtifact::from_task(&task, &plan);

        assert!(log.record(&artifact).unwrap());
        assert!(!log.record(&artifact).unwrap());
        assert_eq!(log.commits().unwrap().len(), 1);
    }

    #[test]
    fn divergent_record_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        let (task, plan) = terminal_task_and_plan(TaskStatus::Success);
        let artifact = AuditArtifact::from_task(&task, &plan);
        log.record(&artifact).unwrap();

        let mut divergent = artifact.clone();
        divergent.outcome = Some(TaskOutcome {
            exit_code: Some(1),
            output: Some("different".into()),
        });
        let err = log.record(&divergent).unwrap_err();
        assert!(matches!(err, AuditError::Diverged { task_id } if task_id == task.id));

        // The original artifact is untouched.
        let stored = log.load(task.id).unwrap().unwrap();
        assert_eq!(stored.outcome.unwrap().exit_code, Some(0));
    }

    #[test]
    fn chain_links_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        for status in [TaskStatus::Success, TaskStatus::Failed, TaskStatus::Cancelled] {
            let (task, plan) = terminal_task_and_plan(status);
            log.record(&AuditArtifact::from_task(&task, &plan)).unwrap();
        }

        let commits = log.commits().unwrap();
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[1].parent, commits[0].commit_sha256);
        assert_eq!(commits[2].parent, commits[1].commit_sha256);

        let verification = log.verify_chain().unwrap();
        assert!(verification.is_valid, "{verification:?}");
        assert_eq!(verification.commit_count, 3);
    }

    #[test]
    fn tampered_artifact_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        let (task, plan) = terminal_task_and_plan(TaskStatus::Success);
        log.record(&AuditArtifact::from_task(&task, &plan)).unwrap();

        let path = log.artifact_path(task.id);
        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        value["services_touched"] = serde_json::json!(["tampered"]);
        std::fs::write(&path, value.to_string()).unwrap();

        let verification = log.verify_chain().unwrap();
        assert!(!verification.is_valid);
        assert_eq!(verification.artifact_mismatches, vec![task.id]);
    }

    #[test]
    fn empty_log_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);
        let verification = log.verify_chain().unwrap();
        assert!(verification.is_valid);
        assert_eq!(verification.commit_count, 0);
    }
}
