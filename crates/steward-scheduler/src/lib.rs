// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-scheduler
#![deny(unsafe_code)]

mod policy;
mod resume;

pub use policy::{RetryDecision, RetryPolicy};
pub use resume::ResumeLoop;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use steward_core::config::OrchestratorConfig;
use steward_core::{PauseEntry, PauseReason, Plan, Task, TaskStatus};
use steward_events::{Event, EventFanout, EventKey, EventKind};
use steward_proto::{Envelope, MessageBody, WorkRequest};
use steward_registry::AgentRegistry;
use steward_store::{StateStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from scheduling and dispatch hand-off.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// State store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The dispatch sink (execution supervisor) refused the task.
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// The hand-off seam to the execution supervisor: once the scheduler
/// has admitted a task onto an agent, the sink owns actual dispatch.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Publish the work request and drive the task to `dispatched`.
    async fn dispatch(&self, task: &Task, agent_id: &str) -> Result<(), SchedulerError>;
}

/// Where the admission check decided a task should go.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// Dispatch now on this agent.
    Dispatch(String),
    /// Park with this reason.
    Pause(PauseReason),
}

/// Returns `true` when an agent's free capacity is below the pause
/// threshold. Exactly at the threshold admits.
#[must_use]
pub fn should_pause(free_capacity_percent: f64, threshold_percent: f64) -> bool {
    free_capacity_percent < threshold_percent
}

/// Admission control and pause management.
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    fanout: Arc<EventFanout>,
    config: OrchestratorConfig,
}

impl Scheduler {
    /// Assemble the scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AgentRegistry>,
        fanout: Arc<EventFanout>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            fanout,
            config,
        }
    }

    /// Decide placement for one task: select an agent, then check its
    /// capacity against the pause threshold and its declared slot
    /// count.
    #[must_use]
    pub fn place(&self, task: &Task) -> Placement {
        let Some(agent_id) = self.registry.select(task.work_type, &task.hints) else {
            return Placement::Pause(PauseReason::NoAgentAvailable);
        };
        let free = self
            .registry
            .free_capacity_percent(&agent_id)
            .unwrap_or(0.0);
        if should_pause(free, self.config.pause_capacity_threshold_percent)
            || !self.registry.has_free_slot(&agent_id)
        {
            return Placement::Pause(PauseReason::InsufficientCapacity {
                agent_id,
                free_percent: free,
            });
        }
        Placement::Dispatch(agent_id)
    }

    /// Dispatch an approved plan: walk its tasks in ordinal order and
    /// either hand each to the sink or park it. Returns how many tasks
    /// were handed off immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on store failures; individual task
    /// pauses are not errors.
    pub async fn dispatch_plan(
        &self,
        plan: &Plan,
        sink: &dyn DispatchSink,
    ) -> Result<usize, SchedulerError> {
        let mut tasks = plan.tasks.clone();
        tasks.sort_by_key(|t| t.ordinal);
        let mut dispatched = 0;
        for task in &tasks {
            // Re-read: an earlier cancel or resume may have moved it.
            let current = self.store.get_task(task.id).await?;
            if current.status != TaskStatus::Approved {
                debug!(
                    target: "steward.scheduler",
                    task_id = %task.id,
                    status = %current.status,
                    "skipping non-approved task"
                );
                continue;
            }
            match self.place(&current) {
                Placement::Dispatch(agent_id) => {
                    sink.dispatch(&current, &agent_id).await?;
                    dispatched += 1;
                }
                Placement::Pause(reason) => {
                    self.park(&current, reason).await?;
                }
            }
        }
        Ok(dispatched)
    }

    /// Park an approved task in the pause queue.
    ///
    /// The captured payload is the full dispatch envelope, so resume
    /// can round-trip it through the codec without re-planning.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] on store failures.
    pub async fn park(&self, task: &Task, reason: PauseReason) -> Result<(), SchedulerError> {
        let agent_type = match &reason {
            PauseReason::InsufficientCapacity { agent_id, .. } => self
                .registry
                .agent_type(agent_id)
                .unwrap_or_else(|| task.work_type.as_str().to_string()),
            PauseReason::NoAgentAvailable => task.work_type.as_str().to_string(),
        };
        let envelope = Envelope::to_agent(
            agent_type,
            task.idempotency_key,
            MessageBody::WorkRequest(WorkRequest {
                task_id: task.id,
                work_type: task.work_type,
                parameters: task.parameters.clone(),
                hints: task.hints.clone(),
            }),
        );
        let payload = serde_json::to_value(&envelope).map_err(StoreError::from)?;

        self.store
            .transition_task(task.id, TaskStatus::Approved, TaskStatus::Paused)
            .await?;
        self.store
            .enqueue_pause(&PauseEntry {
                task_id: task.id,
                reason: reason.clone(),
                payload,
                paused_at: Utc::now(),
                not_before: None,
            })
            .await?;
        info!(
            target: "steward.scheduler",
            task_id = %task.id,
            reason = ?reason,
            "task parked"
        );
        self.fanout.broadcast(Event::new(
            EventKind::Paused,
            EventKey::Execution(task.id),
            serde_json::json!({ "task_id": task.id, "reason": reason }),
        ));
        self.fanout.broadcast(Event::new(
            EventKind::Paused,
            EventKey::Plan(task.plan_id),
            serde_json::json!({ "task_id": task.id }),
        ));
        Ok(())
    }

    /// One pass of the resume scan: oldest-first, re-check capacity,
    /// re-dispatch entries whose agent now has room. Returns how many
    /// tasks were resumed.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on store failures; per-entry dispatch
    /// failures re-park the task instead of aborting the pass.
    pub async fn resume_pass(&self, sink: &dyn DispatchSink) -> Result<usize, SchedulerError> {
        let entries = self.store.list_paused(256).await?;
        let now = Utc::now();
        let mut resumed = 0;
        for entry in entries {
            if entry.not_before.is_some_and(|at| at > now) {
                continue;
            }
            let task = match self.store.get_task(entry.task_id).await {
                Ok(task) => task,
                Err(StoreError::NotFound { .. }) => {
                    self.store.remove_pause(entry.task_id).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if task.status != TaskStatus::Paused {
                // A cancel won the race; drop the stale entry.
                self.store.remove_pause(entry.task_id).await?;
                continue;
            }
            let placement = self.place(&task);
            let Placement::Dispatch(agent_id) = placement else {
                continue;
            };

            self.store.remove_pause(entry.task_id).await?;
            let task = match self
                .store
                .transition_task(task.id, TaskStatus::Paused, TaskStatus::Approved)
                .await
            {
                Ok(task) => task,
                Err(StoreError::StatusConflict { .. } | StoreError::ImmutabilityViolation { .. }) => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            info!(
                target: "steward.scheduler.resume",
                task_id = %task.id,
                agent_id = %agent_id,
                "task resumed"
            );
            self.fanout.broadcast(Event::new(
                EventKind::Resumed,
                EventKey::Execution(task.id),
                serde_json::json!({ "task_id": task.id, "agent_id": agent_id }),
            ));
            self.fanout.broadcast(Event::new(
                EventKind::Resumed,
                EventKey::Plan(task.plan_id),
                serde_json::json!({ "task_id": task.id }),
            ));
            match sink.dispatch(&task, &agent_id).await {
                Ok(()) => resumed += 1,
                Err(e) => {
                    warn!(
                        target: "steward.scheduler.resume",
                        task_id = %task.id,
                        error = %e,
                        "resume dispatch failed, re-parking"
                    );
                    self.park(&task, PauseReason::NoAgentAvailable).await?;
                }
            }
        }
        Ok(resumed)
    }

    /// The configuration this scheduler runs with.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Pause-queue depth, for the health snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] on store failures.
    pub async fn paused_depth(&self) -> Result<usize, SchedulerError> {
        Ok(self.store.list_paused(100_000).await?.len())
    }
}
