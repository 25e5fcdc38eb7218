// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for Steward. Every other crate in the workspace
//! consumes these types; none of them redefine entity shapes.

/// Cancellation primitives shared by all long-lived operations.
pub mod cancel;
/// Orchestrator configuration and validation.
pub mod config;
/// Wire error-code registry (5001–5999) and retryability rules.
pub mod error;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use error::{ErrorDetail, WireErrorCode};

/// Protocol version embedded in every wire envelope.
///
/// # Examples
///
/// ```
/// assert_eq!(steward_core::PROTOCOL_VERSION, "1.0");
/// ```
pub const PROTOCOL_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Lifecycle of a user-level change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// The request has been accepted but not yet planned.
    Received,
    /// The planner is deriving a plan for the request.
    Planning,
    /// A plan exists and is awaiting operator approval.
    PendingApproval,
    /// The plan was approved and is queued for dispatch.
    Approved,
    /// One or more tasks are executing.
    Executing,
    /// Every task finished successfully.
    Complete,
    /// The request or its plan was rejected.
    Rejected,
    /// Planning or execution failed.
    Failed,
}

impl RequestState {
    /// Returns `true` when no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Rejected | Self::Failed)
    }
}

/// A user-level unit of work: free-form text that the planner turns
/// into a [`Plan`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChangeRequest {
    /// Unique request identifier.
    pub id: Uuid,
    /// Identity of the requesting user.
    pub requester: String,
    /// The natural-language request text.
    pub text: String,
    /// Timestamp when the request was received.
    pub created_at: DateTime<Utc>,
    /// Parsed intent produced by the planner (opaque to everyone else).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<serde_json::Value>,
    /// Current lifecycle state.
    pub state: RequestState,
}

impl ChangeRequest {
    /// Create a freshly received request.
    #[must_use]
    pub fn new(requester: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester: requester.into(),
            text: text.into(),
            created_at: Utc::now(),
            intent: None,
            state: RequestState::Received,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Operator-facing risk classification of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Routine, easily reversible change.
    Low,
    /// Change touching a shared service.
    Medium,
    /// Destructive or hard-to-reverse change.
    High,
}

/// Approval lifecycle of a plan. Immutable once approved or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for an operator decision.
    Pending,
    /// Approved for dispatch.
    Approved,
    /// Rejected; the plan will never run.
    Rejected,
    /// Replaced by a sibling plan via `modify`.
    Superseded,
}

/// Aggregate resource budget declared for a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceBudget {
    /// Upper bound on total wall-clock seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
    /// Upper bound on resident memory per task, in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    /// Upper bound on GPU memory, in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_vram_mb: Option<u64>,
}

/// An ordered set of tasks derived from one request.
///
/// The plan owns its tasks; a [`Task`] refers back to its plan only by
/// foreign key.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    /// Unique plan identifier.
    pub id: Uuid,
    /// The request this plan was derived from (1:1 while current).
    pub request_id: Uuid,
    /// Human-readable summary of what the plan will do.
    pub summary: String,
    /// Risk classification.
    pub risk: RiskLevel,
    /// Planner's duration estimate in seconds.
    pub estimated_duration_seconds: u64,
    /// Declared resource budget.
    #[serde(default)]
    pub budget: ResourceBudget,
    /// Approval lifecycle state.
    pub approval: ApprovalStatus,
    /// Identity of the approving or rejecting operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    /// Timestamp of the approval decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// The tasks, in dispatch order.
    pub tasks: Vec<Task>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The kind of action an agent is asked to perform.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    /// Execute a named playbook on a target host.
    RunPlaybook,
    /// Deploy a service by name; the planner rewrites this into
    /// `run_playbook` after catalog resolution.
    DeployService,
    /// Enumerate the playbooks an agent can run.
    DiscoverPlaybooks,
    /// Restart a managed service.
    RestartService,
}

impl WorkType {
    /// Every work type the planner accepts, in catalog order.
    pub const ALL: &'static [WorkType] = &[
        WorkType::RunPlaybook,
        WorkType::DeployService,
        WorkType::DiscoverPlaybooks,
        WorkType::RestartService,
    ];

    /// Wire name of this work type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunPlaybook => "run_playbook",
            Self::DeployService => "deploy_service",
            Self::DiscoverPlaybooks => "discover_playbooks",
            Self::RestartService => "restart_service",
        }
    }

    /// Parse a wire name back into a work type.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().find(|w| w.as_str() == s).copied()
    }
}

impl std::fmt::Display for WorkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling hints attached to a task and forwarded to the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SchedulingHints {
    /// Hard deadline for the task in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
    /// Memory hint for placement, in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
}

/// Task lifecycle states.
///
/// Terminal states (`success`, `failed`, `rejected`, `cancelled`) are
/// read-only in the state store; the store enforces that, not callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created by the planner, not yet surfaced for approval.
    Received,
    /// Waiting on operator approval of the parent plan.
    PendingApproval,
    /// Approved and eligible for dispatch.
    Approved,
    /// Parked in the pause queue for capacity.
    Paused,
    /// Handed to an agent, awaiting the first status message.
    Dispatched,
    /// The agent reported it is executing.
    Running,
    /// Finished successfully.
    Success,
    /// Finished unsuccessfully.
    Failed,
    /// Rejected before execution.
    Rejected,
    /// Cancelled by a user while non-terminal.
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` if this status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Rejected | Self::Cancelled
        )
    }

    /// Returns the set of statuses that are valid successors of `self`.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Received => &[Self::PendingApproval, Self::Rejected],
            Self::PendingApproval => &[Self::Approved, Self::Rejected, Self::Cancelled],
            Self::Approved => &[Self::Paused, Self::Dispatched, Self::Cancelled],
            Self::Paused => &[Self::Approved, Self::Cancelled],
            Self::Dispatched => &[Self::Running, Self::Failed, Self::Cancelled],
            Self::Running => &[Self::Success, Self::Failed, Self::Cancelled],
            Self::Success | Self::Failed | Self::Rejected | Self::Cancelled => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Paused => "paused",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Resources actually consumed by a completed task, as reported by the
/// agent in its `work_result`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourcesUsed {
    /// Wall-clock execution time in seconds.
    pub duration_seconds: f64,
    /// Peak GPU memory, in MiB, if the work touched a GPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_vram_mb: Option<u64>,
    /// CPU time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
}

/// Structured outcome of a finished task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskOutcome {
    /// Process exit code reported by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Bounded output text (full output travels as chunks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Why a task failed, when it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FailureInfo {
    /// Wire error code, when the failure originated on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<WireErrorCode>,
    /// Stable machine-readable reason (e.g. `retry_budget_exceeded`).
    pub reason: String,
}

impl FailureInfo {
    /// Reason recorded when the retry budget is exhausted.
    pub const RETRY_BUDGET_EXCEEDED: &'static str = "retry_budget_exceeded";

    /// Failure carrying a wire error code.
    #[must_use]
    pub fn from_code(code: WireErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }

    /// Failure with a reason only.
    #[must_use]
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }
}

/// A single unit of work dispatched to exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    /// Unique task identifier.
    pub id: Uuid,
    /// The plan this task belongs to.
    pub plan_id: Uuid,
    /// Position within the plan (dispatch order).
    pub ordinal: u32,
    /// The action the agent is asked to perform.
    pub work_type: WorkType,
    /// Work-type specific parameters, validated at plan time.
    pub parameters: serde_json::Value,
    /// Scheduling hints forwarded to the agent.
    #[serde(default)]
    pub hints: SchedulingHints,
    /// Agent currently (or last) assigned, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Approval timestamp, once approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    /// Dispatch timestamp, once handed to an agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Completion timestamp, once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Resources the planner expects the task to need.
    #[serde(default)]
    pub estimated: ResourceBudget,
    /// Resources actually used; populated before the task turns terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_used: Option<ResourcesUsed>,
    /// Services this task touched; populated before terminal.
    #[serde(default)]
    pub services_touched: Vec<String>,
    /// Structured outcome; populated before terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    /// Failure classification when `status == failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// Number of retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Correlates every dispatch attempt and its result messages.
    pub idempotency_key: Uuid,
}

impl Task {
    /// Create a task in `received` with a fresh idempotency key.
    #[must_use]
    pub fn new(plan_id: Uuid, ordinal: u32, work_type: WorkType, parameters: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            ordinal,
            work_type,
            parameters,
            hints: SchedulingHints::default(),
            agent_id: None,
            status: TaskStatus::Received,
            created_at: Utc::now(),
            approved_at: None,
            dispatched_at: None,
            completed_at: None,
            estimated: ResourceBudget::default(),
            resources_used: None,
            services_touched: Vec::new(),
            outcome: None,
            failure: None,
            retry_count: 0,
            idempotency_key: Uuid::new_v4(),
        }
    }

    /// Effective deadline in seconds: the hint if present, else `default_secs`.
    #[must_use]
    pub fn effective_deadline_seconds(&self, default_secs: u64) -> u64 {
        self.hints.max_duration_seconds.unwrap_or(default_secs)
    }
}

// ---------------------------------------------------------------------------
// Execution steps
// ---------------------------------------------------------------------------

/// Status of a single execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The step is in progress.
    Running,
    /// The step finished.
    Completed,
    /// The step failed.
    Failed,
}

/// Upper bound on the stored output summary of a step.
pub const STEP_OUTPUT_SUMMARY_MAX: usize = 4096;

/// A fine-grained, append-only record of task progress — one per
/// `work_status` message.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionStep {
    /// Unique step identifier.
    pub id: Uuid,
    /// The task this step belongs to.
    pub task_id: Uuid,
    /// Step ordinal within the task.
    pub ordinal: u32,
    /// Agent that reported the step.
    pub agent_id: String,
    /// What the agent was doing.
    pub action: String,
    /// Step status.
    pub status: StepStatus,
    /// Bounded output excerpt (truncated to [`STEP_OUTPUT_SUMMARY_MAX`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    /// When the step was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Step duration in milliseconds, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ExecutionStep {
    /// Truncate `output` to the stored summary bound, preserving a
    /// UTF-8 boundary.
    #[must_use]
    pub fn summarize(output: &str) -> String {
        if output.len() <= STEP_OUTPUT_SUMMARY_MAX {
            return output.to_string();
        }
        let mut end = STEP_OUTPUT_SUMMARY_MAX;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        output[..end].to_string()
    }
}

// ---------------------------------------------------------------------------
// Pause queue
// ---------------------------------------------------------------------------

/// Why a task was parked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    /// The selected agent had insufficient free capacity.
    InsufficientCapacity {
        /// Agent whose capacity check failed.
        agent_id: String,
        /// Free capacity the agent reported, in percent.
        free_percent: f64,
    },
    /// No agent currently qualifies for the work type.
    NoAgentAvailable,
}

/// A parked task with enough context to resume without re-planning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PauseEntry {
    /// The paused task.
    pub task_id: Uuid,
    /// Why it was parked.
    pub reason: PauseReason,
    /// The full dispatch envelope, captured at pause time, so resume
    /// can re-publish without rebuilding.
    pub payload: serde_json::Value,
    /// When the task was parked.
    pub paused_at: DateTime<Utc>,
    /// Earliest instant the resume loop may reconsider the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Agent persistence record
// ---------------------------------------------------------------------------

/// Persisted view of a registered agent.
///
/// The live registry keeps richer runtime state (breaker, cooldown,
/// active task counts); this record is what survives a restart and
/// seeds the registry during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentRecord {
    /// Stable agent identity.
    pub id: String,
    /// Agent type (routing key component, e.g. `ansible`).
    pub agent_type: String,
    /// Capabilities the agent declared at registration.
    pub capabilities: Vec<String>,
    /// SHA-256 of the bearer token issued at registration.
    pub token_sha256: String,
    /// Number of tasks the agent can run concurrently.
    pub declared_capacity: u32,
    /// When the agent registered.
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat the orchestrator saw.
    pub last_heartbeat: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Hashing helpers
// ---------------------------------------------------------------------------

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for hashing and byte-stable
/// encoding.
///
/// Object keys are sorted (serde_json maps through a `Value` whose
/// object representation is ordered), so two semantically equal values
/// always serialize identically.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&sort_value(v))?)
}

fn sort_value(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_value(v))).collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_value).collect())
        }
        other => other,
    }
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
