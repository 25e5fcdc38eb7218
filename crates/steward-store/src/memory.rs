// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory [`StateStore`] used by tests and single-node development.
//!
//! Enforces exactly the same guard semantics as the Postgres
//! implementation; the guard lives in the store, not the caller.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use steward_core::{
    AgentRecord, ApprovalStatus, ChangeRequest, ExecutionStep, PauseEntry, Plan, RequestState,
    Task, TaskStatus,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{CompletionRecord, Page, StateStore, StoreError, TaskFilter};

#[derive(Default)]
struct Inner {
    requests: HashMap<Uuid, ChangeRequest>,
    plans: HashMap<Uuid, Plan>,
    tasks: HashMap<Uuid, Task>,
    steps: HashMap<Uuid, Vec<ExecutionStep>>,
    pauses: Vec<PauseEntry>,
    agents: HashMap<String, AgentRecord>,
}

/// In-memory [`StateStore`] implementation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn stamp_transition(task: &mut Task, next: TaskStatus) {
    let now = Utc::now();
    match next {
        TaskStatus::Approved if task.approved_at.is_none() => task.approved_at = Some(now),
        TaskStatus::Dispatched => task.dispatched_at = Some(now),
        s if s.is_terminal() => task.completed_at = Some(now),
        _ => {}
    }
    task.status = next;
}

fn check_transition(task: &Task, expected: TaskStatus, next: TaskStatus) -> Result<(), StoreError> {
    if task.status.is_terminal() {
        return Err(StoreError::ImmutabilityViolation { task_id: task.id });
    }
    if task.status != expected {
        return Err(StoreError::StatusConflict {
            task_id: task.id,
            expected,
            found: task.status,
        });
    }
    if !expected.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            from: expected,
            to: next,
        });
    }
    Ok(())
}

fn matches_filter(task: &Task, filter: &TaskFilter) -> bool {
    if let Some(status) = filter.status {
        if task.status != status {
            return false;
        }
    }
    if let Some(service) = &filter.service {
        if !task.services_touched.iter().any(|s| s == service) {
            return false;
        }
    }
    if let Some(agent_id) = &filter.agent_id {
        if task.agent_id.as_deref() != Some(agent_id.as_str()) {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if task.created_at < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if task.created_at >= until {
            return false;
        }
    }
    true
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn insert_request(&self, request: &ChangeRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<ChangeRequest, StoreError> {
        let inner = self.inner.read().await;
        inner
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "request",
                id: id.to_string(),
            })
    }

    async fn set_request_state(&self, id: Uuid, state: RequestState) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let request = inner.requests.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "request",
            id: id.to_string(),
        })?;
        request.state = state;
        Ok(())
    }

    async fn set_request_intent(
        &self,
        id: Uuid,
        intent: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let request = inner.requests.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "request",
            id: id.to_string(),
        })?;
        request.intent = Some(intent);
        Ok(())
    }

    async fn insert_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for task in &plan.tasks {
            inner.tasks.insert(task.id, task.clone());
        }
        inner.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> Result<Plan, StoreError> {
        let inner = self.inner.read().await;
        let mut plan = inner.plans.get(&id).cloned().ok_or(StoreError::NotFound {
            entity: "plan",
            id: id.to_string(),
        })?;
        // Task rows are authoritative; the plan's embedded copies are a
        // read-model refreshed on fetch.
        for task in &mut plan.tasks {
            if let Some(current) = inner.tasks.get(&task.id) {
                *task = current.clone();
            }
        }
        Ok(plan)
    }

    async fn list_plans_for_request(&self, request_id: Uuid) -> Result<Vec<Plan>, StoreError> {
        let inner = self.inner.read().await;
        let mut plans: Vec<Plan> = inner
            .plans
            .values()
            .filter(|p| p.request_id == request_id)
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.tasks.first().map_or(Utc::now(), |t| t.created_at));
        Ok(plans)
    }

    async fn decide_plan(
        &self,
        id: Uuid,
        decision: ApprovalStatus,
        approver: Option<String>,
    ) -> Result<Plan, StoreError> {
        let mut inner = self.inner.write().await;
        let plan = inner.plans.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "plan",
            id: id.to_string(),
        })?;
        if plan.approval != ApprovalStatus::Pending {
            return Err(StoreError::PlanDecided {
                plan_id: id,
                status: plan.approval,
            });
        }
        plan.approval = decision;
        plan.approver = approver;
        plan.decided_at = Some(Utc::now());
        Ok(plan.clone())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            })
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })?;
        check_transition(task, expected, next)?;
        stamp_transition(task, next);
        Ok(task.clone())
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
        completion: CompletionRecord,
    ) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })?;
        check_transition(task, expected, next)?;
        task.outcome = Some(completion.outcome);
        task.resources_used = Some(completion.resources_used);
        task.services_touched = completion.services_touched;
        task.failure = completion.failure;
        stamp_transition(task, next);
        Ok(task.clone())
    }

    async fn assign_agent(&self, task_id: Uuid, agent_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })?;
        if task.status.is_terminal() {
            return Err(StoreError::ImmutabilityViolation { task_id });
        }
        task.agent_id = Some(agent_id.to_string());
        Ok(())
    }

    async fn bump_retry(&self, task_id: Uuid) -> Result<u32, StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })?;
        if task.status.is_terminal() {
            return Err(StoreError::ImmutabilityViolation { task_id });
        }
        task.retry_count += 1;
        Ok(task.retry_count)
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Page<Task>, StoreError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| matches_filter(t, filter))
            .cloned()
            .collect();
        matches.sort_by_key(|t| (t.created_at, t.id));
        let total = matches.len() as u64;
        let limit = filter.effective_limit();
        let items = matches
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();
        Ok(Page {
            items,
            total,
            offset: filter.offset,
            limit,
        })
    }

    async fn append_step(&self, mut step: ExecutionStep) -> Result<ExecutionStep, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&step.task_id) {
            return Err(StoreError::NotFound {
                entity: "task",
                id: step.task_id.to_string(),
            });
        }
        let steps = inner.steps.entry(step.task_id).or_default();
        step.ordinal = steps.len() as u32;
        steps.push(step.clone());
        Ok(step)
    }

    async fn list_steps(&self, task_id: Uuid) -> Result<Vec<ExecutionStep>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.steps.get(&task_id).cloned().unwrap_or_default())
    }

    async fn enqueue_pause(&self, entry: &PauseEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.pauses.retain(|p| p.task_id != entry.task_id);
        inner.pauses.push(entry.clone());
        inner.pauses.sort_by_key(|p| p.paused_at);
        Ok(())
    }

    async fn list_paused(&self, limit: usize) -> Result<Vec<PauseEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.pauses.iter().take(limit).cloned().collect())
    }

    async fn remove_pause(&self, task_id: Uuid) -> Result<Option<PauseEntry>, StoreError> {
        let mut inner = self.inner.write().await;
        let position = inner.pauses.iter().position(|p| p.task_id == task_id);
        Ok(position.map(|i| inner.pauses.remove(i)))
    }

    async fn upsert_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.agents.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut agents: Vec<AgentRecord> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.agents.remove(agent_id);
        Ok(())
    }
}
