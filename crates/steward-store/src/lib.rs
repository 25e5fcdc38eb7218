// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-store
#![deny(unsafe_code)]

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use steward_core::{
    AgentRecord, ChangeRequest, ExecutionStep, FailureInfo, PauseEntry, Plan, RequestState, Task,
    TaskOutcome, TaskStatus,
};
use thiserror::Error;
use uuid::Uuid;

/// Hard upper bound on page sizes.
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Errors from state-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced entity does not exist.
    #[error("{entity} `{id}` not found")]
    NotFound {
        /// Entity kind (`request`, `plan`, `task`, …).
        entity: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// A compare-and-set found a different stored status.
    ///
    /// Treated as a concurrency signal: the caller re-reads and
    /// decides.
    #[error("status conflict on task {task_id}: expected {expected}, found {found}")]
    StatusConflict {
        /// The task whose transition failed.
        task_id: Uuid,
        /// The status the caller expected.
        expected: TaskStatus,
        /// The status actually stored.
        found: TaskStatus,
    },

    /// A write touched a task already in a terminal status.
    ///
    /// Means a racing terminal transition won; callers log and discard.
    #[error("task {task_id} is terminal and read-only")]
    ImmutabilityViolation {
        /// The terminal task.
        task_id: Uuid,
    },

    /// The requested transition is not in the state machine.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Stored status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// The plan has already been approved, rejected, or superseded.
    #[error("plan {plan_id} already decided: {status:?}")]
    PlanDecided {
        /// The plan whose decision was attempted twice.
        plan_id: Uuid,
        /// Its current approval status.
        status: steward_core::ApprovalStatus,
    },

    /// The backing database failed.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored document failed to (de)serialize.
    #[error("stored value corrupt: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The page items.
    pub items: Vec<T>,
    /// Total matching rows, ignoring pagination.
    pub total: u64,
    /// Offset this page started at.
    pub offset: usize,
    /// Limit this page was capped to.
    pub limit: usize,
}

/// Filter for task queries. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Only tasks whose `services_touched` contains this service.
    pub service: Option<String>,
    /// Only tasks assigned to this agent.
    pub agent_id: Option<String>,
    /// Only tasks created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only tasks created before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Page size (clamped to [`MAX_PAGE_LIMIT`]).
    pub limit: usize,
    /// Page offset.
    pub offset: usize,
}

impl TaskFilter {
    /// The effective limit: at least 1, at most [`MAX_PAGE_LIMIT`].
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

/// Fields written together when a task reaches a terminal outcome.
///
/// Bundled so the terminal CAS and the outcome columns land in one
/// atomic store operation — a terminal task always has its outcome,
/// resources, and touched services populated.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    /// Structured outcome.
    pub outcome: TaskOutcome,
    /// Resources the agent reported.
    pub resources_used: steward_core::ResourcesUsed,
    /// Services the task touched.
    pub services_touched: Vec<String>,
    /// Failure classification, when the terminal status is `failed`.
    pub failure: Option<FailureInfo>,
}

/// Transactional CRUD over the entities the orchestrator owns.
///
/// The orchestrator is a single writer; concurrent logical flows
/// coordinate through the CAS transition operations here.
#[async_trait]
pub trait StateStore: Send + Sync {
    // -- Requests -----------------------------------------------------------

    /// Persist a new request.
    async fn insert_request(&self, request: &ChangeRequest) -> Result<(), StoreError>;

    /// Fetch a request by id.
    async fn get_request(&self, id: Uuid) -> Result<ChangeRequest, StoreError>;

    /// Move a request to a new lifecycle state.
    async fn set_request_state(&self, id: Uuid, state: RequestState) -> Result<(), StoreError>;

    /// Record the parsed intent on a request.
    async fn set_request_intent(
        &self,
        id: Uuid,
        intent: serde_json::Value,
    ) -> Result<(), StoreError>;

    // -- Plans --------------------------------------------------------------

    /// Persist a plan together with its tasks.
    async fn insert_plan(&self, plan: &Plan) -> Result<(), StoreError>;

    /// Fetch a plan (with tasks) by id.
    async fn get_plan(&self, id: Uuid) -> Result<Plan, StoreError>;

    /// All plans ever derived from a request, oldest first.
    async fn list_plans_for_request(&self, request_id: Uuid) -> Result<Vec<Plan>, StoreError>;

    /// Compare-and-set the approval status of a plan.
    ///
    /// Only `pending` plans may move; approved and rejected plans are
    /// immutable, so a second decision fails with
    /// [`StoreError::PlanDecided`] and leaves state unchanged.
    async fn decide_plan(
        &self,
        id: Uuid,
        decision: steward_core::ApprovalStatus,
        approver: Option<String>,
    ) -> Result<Plan, StoreError>;

    // -- Tasks --------------------------------------------------------------

    /// Fetch a task by id.
    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError>;

    /// Compare-and-set a task status transition.
    ///
    /// Checks, in order: the task exists; it is not terminal
    /// ([`StoreError::ImmutabilityViolation`]); the stored status equals
    /// `expected` ([`StoreError::StatusConflict`]); the transition is
    /// legal ([`StoreError::InvalidTransition`]). Timestamps
    /// (`approved_at`, `dispatched_at`, `completed_at`) are maintained
    /// by the store.
    async fn transition_task(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<Task, StoreError>;

    /// Terminal CAS: transition to `success`/`failed` while atomically
    /// writing the completion fields.
    async fn complete_task(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
        completion: CompletionRecord,
    ) -> Result<Task, StoreError>;

    /// Record the agent assignment on a non-terminal task.
    async fn assign_agent(&self, task_id: Uuid, agent_id: &str) -> Result<(), StoreError>;

    /// Increment and return the retry counter of a non-terminal task.
    async fn bump_retry(&self, task_id: Uuid) -> Result<u32, StoreError>;

    /// Paginated task query.
    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Page<Task>, StoreError>;

    // -- Execution steps ----------------------------------------------------

    /// Append an execution step; the store assigns the next ordinal.
    async fn append_step(&self, step: ExecutionStep) -> Result<ExecutionStep, StoreError>;

    /// All steps of a task, in ordinal order.
    async fn list_steps(&self, task_id: Uuid) -> Result<Vec<ExecutionStep>, StoreError>;

    // -- Pause queue --------------------------------------------------------

    /// Park a task.
    async fn enqueue_pause(&self, entry: &PauseEntry) -> Result<(), StoreError>;

    /// Parked entries, oldest first, up to `limit`.
    async fn list_paused(&self, limit: usize) -> Result<Vec<PauseEntry>, StoreError>;

    /// Remove and return a parked entry, if present.
    async fn remove_pause(&self, task_id: Uuid) -> Result<Option<PauseEntry>, StoreError>;

    // -- Agents -------------------------------------------------------------

    /// Insert or update a persisted agent record.
    async fn upsert_agent(&self, record: &AgentRecord) -> Result<(), StoreError>;

    /// All persisted agent records.
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;

    /// Remove a persisted agent record.
    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError>;
}
