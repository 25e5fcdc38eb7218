// SPDX-License-Identifier: MIT OR Apache-2.0
//! Postgres-backed [`StateStore`].
//!
//! Transitions run inside a transaction with `SELECT ... FOR UPDATE`,
//! so the immutability guard and the compare-and-set are enforced by
//! the store regardless of how many logical flows race on a task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use steward_core::{
    AgentRecord, ApprovalStatus, ChangeRequest, ExecutionStep, PauseEntry, Plan, RequestState,
    Task, TaskStatus,
};
use tracing::debug;
use uuid::Uuid;

use crate::{CompletionRecord, Page, StateStore, StoreError, TaskFilter};

const SCHEMA: &str = include_str!("schema.sql");

/// Postgres [`StateStore`] implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the database is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by tests and the daemon).
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the idempotent schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if any DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!(target: "steward.store.pg", "schema ensured");
        Ok(())
    }
}

// Status enums travel as their serde string form so the database text
// always matches the wire text.
fn to_text<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Corrupt(format!(
            "expected string-serializable enum, got {other}"
        ))),
    }
}

fn from_text<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(
        text.to_string(),
    ))?)
}

fn json_or_none<T: Serialize>(value: &Option<T>) -> Result<Option<serde_json::Value>, StoreError> {
    value
        .as_ref()
        .map(|v| serde_json::to_value(v).map_err(StoreError::from))
        .transpose()
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.try_get("status")?;
    let work_type: String = row.try_get("work_type")?;
    let resources_used: Option<serde_json::Value> = row.try_get("resources_used")?;
    let outcome: Option<serde_json::Value> = row.try_get("outcome")?;
    let failure: Option<serde_json::Value> = row.try_get("failure")?;
    Ok(Task {
        id: row.try_get("id")?,
        plan_id: row.try_get("plan_id")?,
        ordinal: row.try_get::<i32, _>("ordinal")? as u32,
        work_type: from_text(&work_type)?,
        parameters: row.try_get("parameters")?,
        hints: serde_json::from_value(row.try_get("hints")?)?,
        agent_id: row.try_get("agent_id")?,
        status: from_text(&status)?,
        created_at: row.try_get("created_at")?,
        approved_at: row.try_get("approved_at")?,
        dispatched_at: row.try_get("dispatched_at")?,
        completed_at: row.try_get("completed_at")?,
        estimated: serde_json::from_value(row.try_get("estimated")?)?,
        resources_used: resources_used.map(serde_json::from_value).transpose()?,
        services_touched: serde_json::from_value(row.try_get("services_touched")?)?,
        outcome: outcome.map(serde_json::from_value).transpose()?,
        failure: failure.map(serde_json::from_value).transpose()?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        idempotency_key: row.try_get("idempotency_key")?,
    })
}

fn plan_from_row(row: &PgRow, tasks: Vec<Task>) -> Result<Plan, StoreError> {
    let risk: String = row.try_get("risk")?;
    let approval: String = row.try_get("approval")?;
    Ok(Plan {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        summary: row.try_get("summary")?,
        risk: from_text(&risk)?,
        estimated_duration_seconds: row.try_get::<i64, _>("estimated_duration_seconds")? as u64,
        budget: serde_json::from_value(row.try_get("budget")?)?,
        approval: from_text(&approval)?,
        approver: row.try_get("approver")?,
        decided_at: row.try_get("decided_at")?,
        tasks,
    })
}

fn step_from_row(row: &PgRow) -> Result<ExecutionStep, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ExecutionStep {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        ordinal: row.try_get::<i32, _>("ordinal")? as u32,
        agent_id: row.try_get("agent_id")?,
        action: row.try_get("action")?,
        status: from_text(&status)?,
        output_summary: row.try_get("output_summary")?,
        recorded_at: row.try_get("recorded_at")?,
        duration_ms: row
            .try_get::<Option<i64>, _>("duration_ms")?
            .map(|v| v as u64),
    })
}

async fn insert_task(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    task: &Task,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO tasks (id, plan_id, ordinal, work_type, parameters, hints, agent_id, status,
             created_at, approved_at, dispatched_at, completed_at, estimated, resources_used,
             services_touched, outcome, failure, retry_count, idempotency_key)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
    )
    .bind(task.id)
    .bind(task.plan_id)
    .bind(task.ordinal as i32)
    .bind(to_text(&task.work_type)?)
    .bind(&task.parameters)
    .bind(serde_json::to_value(&task.hints)?)
    .bind(&task.agent_id)
    .bind(to_text(&task.status)?)
    .bind(task.created_at)
    .bind(task.approved_at)
    .bind(task.dispatched_at)
    .bind(task.completed_at)
    .bind(serde_json::to_value(&task.estimated)?)
    .bind(json_or_none(&task.resources_used)?)
    .bind(serde_json::to_value(&task.services_touched)?)
    .bind(json_or_none(&task.outcome)?)
    .bind(json_or_none(&task.failure)?)
    .bind(task.retry_count as i32)
    .bind(task.idempotency_key)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Lock a task row and run the CAS checks against its stored status.
async fn lock_task_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    task_id: Uuid,
    expected: TaskStatus,
    next: TaskStatus,
) -> Result<(), StoreError> {
    let row = sqlx::query("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })?;
    let found: TaskStatus = from_text(&row.try_get::<String, _>("status")?)?;
    if found.is_terminal() {
        return Err(StoreError::ImmutabilityViolation { task_id });
    }
    if found != expected {
        return Err(StoreError::StatusConflict {
            task_id,
            expected,
            found,
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

fn timestamp_flags(next: TaskStatus) -> (bool, bool, bool) {
    (
        next == TaskStatus::Approved,
        next == TaskStatus::Dispatched,
        next.is_terminal(),
    )
}

#[async_trait]
impl StateStore for PgStore {
    async fn insert_request(&self, request: &ChangeRequest) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO requests (id, requester, text, created_at, intent, state)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(request.id)
        .bind(&request.requester)
        .bind(&request.text)
        .bind(request.created_at)
        .bind(&request.intent)
        .bind(to_text(&request.state)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<ChangeRequest, StoreError> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "request",
                id: id.to_string(),
            })?;
        let state: String = row.try_get("state")?;
        Ok(ChangeRequest {
            id: row.try_get("id")?,
            requester: row.try_get("requester")?,
            text: row.try_get("text")?,
            created_at: row.try_get("created_at")?,
            intent: row.try_get("intent")?,
            state: from_text(&state)?,
        })
    }

    async fn set_request_state(&self, id: Uuid, state: RequestState) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE requests SET state = $2 WHERE id = $1")
            .bind(id)
            .bind(to_text(&state)?)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "request",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_request_intent(
        &self,
        id: Uuid,
        intent: serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE requests SET intent = $2 WHERE id = $1")
            .bind(id)
            .bind(intent)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "request",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO plans (id, request_id, summary, risk, estimated_duration_seconds,
                 budget, approval, approver, decided_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(plan.id)
        .bind(plan.request_id)
        .bind(&plan.summary)
        .bind(to_text(&plan.risk)?)
        .bind(plan.estimated_duration_seconds as i64)
        .bind(serde_json::to_value(&plan.budget)?)
        .bind(to_text(&plan.approval)?)
        .bind(&plan.approver)
        .bind(plan.decided_at)
        .execute(&mut *tx)
        .await?;
        for task in &plan.tasks {
            insert_task(&mut tx, task).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> Result<Plan, StoreError> {
        let row = sqlx::query("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "plan",
                id: id.to_string(),
            })?;
        let task_rows = sqlx::query("SELECT * FROM tasks WHERE plan_id = $1 ORDER BY ordinal")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        let tasks = task_rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        plan_from_row(&row, tasks)
    }

    async fn list_plans_for_request(&self, request_id: Uuid) -> Result<Vec<Plan>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM plans WHERE request_id = $1 ORDER BY created_at, id")
                .bind(request_id)
                .fetch_all(&self.pool)
                .await?;
        let mut plans = Vec::with_capacity(rows.len());
        for row in &rows {
            let plan_id: Uuid = row.try_get("id")?;
            let task_rows =
                sqlx::query("SELECT * FROM tasks WHERE plan_id = $1 ORDER BY ordinal")
                    .bind(plan_id)
                    .fetch_all(&self.pool)
                    .await?;
            let tasks = task_rows
                .iter()
                .map(task_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            plans.push(plan_from_row(row, tasks)?);
        }
        Ok(plans)
    }

    async fn decide_plan(
        &self,
        id: Uuid,
        decision: ApprovalStatus,
        approver: Option<String>,
    ) -> Result<Plan, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT approval FROM plans WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "plan",
                id: id.to_string(),
            })?;
        let current: ApprovalStatus = from_text(&row.try_get::<String, _>("approval")?)?;
        if current != ApprovalStatus::Pending {
            return Err(StoreError::PlanDecided {
                plan_id: id,
                status: current,
            });
        }
        sqlx::query(
            "UPDATE plans SET approval = $2, approver = $3, decided_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(to_text(&decision)?)
        .bind(&approver)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.get_plan(id).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            })?;
        task_from_row(&row)
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_task_status(&mut tx, task_id, expected, next).await?;
        let (stamp_approved, stamp_dispatched, stamp_completed) = timestamp_flags(next);
        let row = sqlx::query(
            "UPDATE tasks SET status = $2,
                 approved_at = CASE WHEN $3 AND approved_at IS NULL THEN now() ELSE approved_at END,
                 dispatched_at = CASE WHEN $4 THEN now() ELSE dispatched_at END,
                 completed_at = CASE WHEN $5 THEN now() ELSE completed_at END
             WHERE id = $1
             RETURNING *",
        )
        .bind(task_id)
        .bind(to_text(&next)?)
        .bind(stamp_approved)
        .bind(stamp_dispatched)
        .bind(stamp_completed)
        .fetch_one(&mut *tx)
        .await?;
        let task = task_from_row(&row)?;
        tx.commit().await?;
        Ok(task)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
        completion: CompletionRecord,
    ) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_task_status(&mut tx, task_id, expected, next).await?;
        let row = sqlx::query(
            "UPDATE tasks SET status = $2, completed_at = now(),
                 outcome = $3, resources_used = $4, services_touched = $5, failure = $6
             WHERE id = $1
             RETURNING *",
        )
        .bind(task_id)
        .bind(to_text(&next)?)
        .bind(serde_json::to_value(&completion.outcome)?)
        .bind(serde_json::to_value(&completion.resources_used)?)
        .bind(serde_json::to_value(&completion.services_touched)?)
        .bind(json_or_none(&completion.failure)?)
        .fetch_one(&mut *tx)
        .await?;
        let task = task_from_row(&row)?;
        tx.commit().await?;
        Ok(task)
    }

    async fn assign_agent(&self, task_id: Uuid, agent_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET agent_id = $2 WHERE id = $1
                 AND status NOT IN ('success', 'failed', 'rejected', 'cancelled')",
        )
        .bind(task_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Distinguish missing from terminal.
            let _ = self.get_task(task_id).await?;
            return Err(StoreError::ImmutabilityViolation { task_id });
        }
        Ok(())
    }

    async fn bump_retry(&self, task_id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "UPDATE tasks SET retry_count = retry_count + 1 WHERE id = $1
                 AND status NOT IN ('success', 'failed', 'rejected', 'cancelled')
             RETURNING retry_count",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get::<i32, _>("retry_count")? as u32),
            None => {
                let _ = self.get_task(task_id).await?;
                Err(StoreError::ImmutabilityViolation { task_id })
            }
        }
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Page<Task>, StoreError> {
        let mut count_query = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "SELECT COUNT(*) AS total FROM tasks WHERE TRUE",
        );
        let mut page_query =
            sqlx::QueryBuilder::<sqlx::Postgres>::new("SELECT * FROM tasks WHERE TRUE");

        for builder in [&mut count_query, &mut page_query] {
            if let Some(status) = filter.status {
                builder.push(" AND status = ");
                builder.push_bind(to_text(&status)?);
            }
            if let Some(service) = &filter.service {
                builder.push(" AND services_touched @> ");
                builder.push_bind(serde_json::json!([service]));
            }
            if let Some(agent_id) = &filter.agent_id {
                builder.push(" AND agent_id = ");
                builder.push_bind(agent_id.clone());
            }
            if let Some(since) = filter.since {
                builder.push(" AND created_at >= ");
                builder.push_bind(since);
            }
            if let Some(until) = filter.until {
                builder.push(" AND created_at < ");
                builder.push_bind(until);
            }
        }

        let total: i64 = count_query
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let limit = filter.effective_limit();
        page_query.push(" ORDER BY created_at, id LIMIT ");
        page_query.push_bind(limit as i64);
        page_query.push(" OFFSET ");
        page_query.push_bind(filter.offset as i64);

        let rows = page_query.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            total: total as u64,
            offset: filter.offset,
            limit,
        })
    }

    async fn append_step(&self, mut step: ExecutionStep) -> Result<ExecutionStep, StoreError> {
        let mut tx = self.pool.begin().await?;
        // Lock the parent task so concurrent appends serialize on the
        // ordinal computation.
        sqlx::query("SELECT id FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(step.task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "task",
                id: step.task_id.to_string(),
            })?;
        let row = sqlx::query("SELECT COUNT(*) AS existing FROM execution_steps WHERE task_id = $1")
            .bind(step.task_id)
            .fetch_one(&mut *tx)
            .await?;
        step.ordinal = row.try_get::<i64, _>("existing")? as u32;
        sqlx::query(
            "INSERT INTO execution_steps (id, task_id, ordinal, agent_id, action, status,
                 output_summary, recorded_at, duration_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(step.id)
        .bind(step.task_id)
        .bind(step.ordinal as i32)
        .bind(&step.agent_id)
        .bind(&step.action)
        .bind(to_text(&step.status)?)
        .bind(&step.output_summary)
        .bind(step.recorded_at)
        .bind(step.duration_ms.map(|v| v as i64))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(step)
    }

    async fn list_steps(&self, task_id: Uuid) -> Result<Vec<ExecutionStep>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM execution_steps WHERE task_id = $1 ORDER BY ordinal")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(step_from_row).collect()
    }

    async fn enqueue_pause(&self, entry: &PauseEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pause_queue (task_id, reason, payload, paused_at, not_before)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (task_id) DO UPDATE SET
                 reason = EXCLUDED.reason, payload = EXCLUDED.payload,
                 paused_at = EXCLUDED.paused_at, not_before = EXCLUDED.not_before",
        )
        .bind(entry.task_id)
        .bind(serde_json::to_value(&entry.reason)?)
        .bind(&entry.payload)
        .bind(entry.paused_at)
        .bind(entry.not_before)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_paused(&self, limit: usize) -> Result<Vec<PauseEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM pause_queue ORDER BY paused_at LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(PauseEntry {
                    task_id: row.try_get("task_id")?,
                    reason: serde_json::from_value(row.try_get("reason")?)?,
                    payload: row.try_get("payload")?,
                    paused_at: row.try_get("paused_at")?,
                    not_before: row.try_get::<Option<DateTime<Utc>>, _>("not_before")?,
                })
            })
            .collect()
    }

    async fn remove_pause(&self, task_id: Uuid) -> Result<Option<PauseEntry>, StoreError> {
        let row = sqlx::query("DELETE FROM pause_queue WHERE task_id = $1 RETURNING *")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(PauseEntry {
                task_id: row.try_get("task_id")?,
                reason: serde_json::from_value(row.try_get("reason")?)?,
                payload: row.try_get("payload")?,
                paused_at: row.try_get("paused_at")?,
                not_before: row.try_get::<Option<DateTime<Utc>>, _>("not_before")?,
            })
        })
        .transpose()
    }

    async fn upsert_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agents (id, agent_type, capabilities, token_sha256, declared_capacity,
                 registered_at, last_heartbeat)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                 agent_type = EXCLUDED.agent_type, capabilities = EXCLUDED.capabilities,
                 token_sha256 = EXCLUDED.token_sha256,
                 declared_capacity = EXCLUDED.declared_capacity,
                 last_heartbeat = EXCLUDED.last_heartbeat",
        )
        .bind(&record.id)
        .bind(&record.agent_type)
        .bind(serde_json::to_value(&record.capabilities)?)
        .bind(&record.token_sha256)
        .bind(record.declared_capacity as i32)
        .bind(record.registered_at)
        .bind(record.last_heartbeat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(AgentRecord {
                    id: row.try_get("id")?,
                    agent_type: row.try_get("agent_type")?,
                    capabilities: serde_json::from_value(row.try_get("capabilities")?)?,
                    token_sha256: row.try_get("token_sha256")?,
                    declared_capacity: row.try_get::<i32, _>("declared_capacity")? as u32,
                    registered_at: row.try_get("registered_at")?,
                    last_heartbeat: row.try_get("last_heartbeat")?,
                })
            })
            .collect()
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
