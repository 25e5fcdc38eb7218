// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-supervisor
#![deny(unsafe_code)]

mod deadline;
mod reconcile;

pub use deadline::DeadlineTracker;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use steward_audit::{AuditArtifact, AuditLog, AuditRetryQueue};
use steward_bus::{BusError, MessageBus, Topology};
use steward_core::cancel::CancelToken;
use steward_core::config::OrchestratorConfig;
use steward_core::{ErrorDetail, Task, TaskStatus, WireErrorCode};
use steward_events::{Event, EventFanout, EventKey, EventKind};
use steward_proto::{ChunkAssembler, Envelope, MessageBody, WorkRequest};
use steward_registry::AgentRegistry;
use steward_scheduler::{DispatchSink, RetryPolicy, SchedulerError};
use steward_store::{StateStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// State store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Bus failure.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Drives every task through its state machine and reconciles agent
/// messages against the state store.
pub struct Supervisor {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) audit: AuditLog,
    pub(crate) audit_retry: AuditRetryQueue,
    pub(crate) fanout: Arc<EventFanout>,
    pub(crate) policy: RetryPolicy,
    pub(crate) config: OrchestratorConfig,
    pub(crate) deadlines: DeadlineTracker,
    pub(crate) assemblers: Mutex<HashMap<Uuid, ChunkAssembler>>,
}

impl Supervisor {
    /// Assemble the supervisor.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn MessageBus>,
        registry: Arc<AgentRegistry>,
        audit: AuditLog,
        fanout: Arc<EventFanout>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            audit,
            audit_retry: AuditRetryQueue::new(),
            fanout,
            policy: RetryPolicy::from_config(&config),
            config,
            deadlines: DeadlineTracker::new(),
            assemblers: Mutex::new(HashMap::new()),
        }
    }

    /// The audit retry queue (exposed for the health snapshot).
    #[must_use]
    pub fn audit_retry(&self) -> &AuditRetryQueue {
        &self.audit_retry
    }

    /// Number of in-flight tasks with an armed deadline.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.deadlines.armed()
    }

    /// Run the reconciliation loop: consume the status and result
    /// queues and tick the deadline monitor until cancelled.
    pub fn spawn(supervisor: Arc<Supervisor>, cancel: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut status_sub = match supervisor.bus.subscribe(Topology::STATUS).await {
                Ok(sub) => sub,
                Err(e) => {
                    error!(
                        target: "steward.supervisor",
                        error = %e,
                        "cannot subscribe to status queue"
                    );
                    return;
                }
            };
            let mut results_sub = match supervisor.bus.subscribe(Topology::RESULTS).await {
                Ok(sub) => sub,
                Err(e) => {
                    error!(
                        target: "steward.supervisor",
                        error = %e,
                        "cannot subscribe to results queue"
                    );
                    return;
                }
            };
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(target: "steward.supervisor", "reconciliation loop running");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(target: "steward.supervisor", "reconciliation loop stopping");
                        break;
                    }
                    Some(delivery) = status_sub.recv() => {
                        supervisor.handle_delivery(delivery).await;
                    }
                    Some(delivery) = results_sub.recv() => {
                        supervisor.handle_delivery(delivery).await;
                    }
                    _ = ticker.tick() => {
                        supervisor.check_deadlines().await;
                        let _ = supervisor.audit_retry.flush(&supervisor.audit).await;
                    }
                }
            }
        })
    }

    /// Synthesize timeouts for every task whose deadline expired.
    pub async fn check_deadlines(&self) {
        for task_id in self.deadlines.drain_expired() {
            warn!(
                target: "steward.supervisor",
                %task_id,
                "no progress before deadline, synthesizing timeout"
            );
            self.apply_failure(
                task_id,
                WireErrorCode::Timeout,
                "deadline expired without progress".to_string(),
            )
            .await;
        }
    }

    /// User-initiated cancellation of a task.
    ///
    /// Moves a non-terminal task to `cancelled` (a task that never left
    /// `received` becomes `rejected`), removes any pause entry, sends a
    /// best-effort cancel signal to the assigned agent, records the
    /// audit artifact, and broadcasts. Returns `false` when the task
    /// was already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Store`] on store failures other than
    /// transition races (a racing terminal transition wins quietly).
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool, SupervisorError> {
        let task = self.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        let next = if task.status == TaskStatus::Received {
            TaskStatus::Rejected
        } else {
            TaskStatus::Cancelled
        };
        let was_in_flight = matches!(
            task.status,
            TaskStatus::Dispatched | TaskStatus::Running
        );
        if task.status == TaskStatus::Paused {
            self.store.remove_pause(task_id).await?;
        }

        let cancelled = match self.store.transition_task(task_id, task.status, next).await {
            Ok(task) => task,
            Err(StoreError::StatusConflict { .. } | StoreError::ImmutabilityViolation { .. }) => {
                debug!(
                    target: "steward.supervisor",
                    %task_id,
                    "cancel lost a transition race, discarding"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(agent_id) = &cancelled.agent_id {
            if was_in_flight {
                self.registry.release(agent_id);
                self.send_cancel_signal(&cancelled, agent_id).await;
            }
        }
        self.deadlines.disarm(task_id);
        self.assemblers.lock().await.remove(&task_id);
        info!(
            target: "steward.supervisor",
            %task_id,
            status = %cancelled.status,
            "task cancelled"
        );
        self.finalize(&cancelled).await;
        Ok(true)
    }

    /// Best-effort cancel signal: an `error` envelope with code 5008
    /// referencing the task's request id. Agents abort the matching
    /// in-flight work and discard the task.
    async fn send_cancel_signal(&self, task: &Task, agent_id: &str) {
        let agent_type = self
            .registry
            .agent_type(agent_id)
            .unwrap_or_else(|| task.work_type.as_str().to_string());
        let envelope = Envelope::to_agent(
            &agent_type,
            task.idempotency_key,
            MessageBody::Error(
                ErrorDetail::new(WireErrorCode::OperationCancelled)
                    .with_context("task_id", task.id.to_string()),
            ),
        );
        if let Err(e) = self
            .bus
            .publish(&Topology::agent_queue(&agent_type), &envelope)
            .await
        {
            warn!(
                target: "steward.supervisor",
                task_id = %task.id,
                error = %e,
                "cancel signal not delivered"
            );
        }
    }

    /// Record a task that turned terminal outside the result path
    /// (operator rejection, pre-dispatch cancellation): every terminal
    /// task gets its audit artifact, however it got there.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Store`] when the task cannot be read.
    pub async fn finalize_terminal(&self, task_id: Uuid) -> Result<(), SupervisorError> {
        let task = self.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            self.finalize(&task).await;
        }
        Ok(())
    }

    /// Finalize a terminal task: audit, events, and the request-level
    /// rollup. Audit failures are parked for retry, never propagated —
    /// audit is a non-critical path for liveness.
    pub(crate) async fn finalize(&self, task: &Task) {
        match self.store.get_plan(task.plan_id).await {
            Ok(plan) => {
                let artifact = AuditArtifact::from_task(task, &plan);
                match self.audit.record(&artifact) {
                    Ok(_) => {}
                    Err(e @ steward_audit::AuditError::Diverged { .. }) => {
                        // The immutable log and the state store disagree
                        // about a terminal task. That is data corruption;
                        // external supervision restarts the process.
                        error!(
                            target: "steward.supervisor",
                            task_id = %task.id,
                            error = %e,
                            "audit artifact diverges from store, aborting"
                        );
                        std::process::abort();
                    }
                    Err(e) => {
                        self.audit_retry.park(artifact, &e).await;
                    }
                }
                self.rollup_request(&plan).await;
            }
            Err(e) => {
                error!(
                    target: "steward.supervisor",
                    task_id = %task.id,
                    error = %e,
                    "cannot load plan for audit artifact"
                );
            }
        }

        let kind = if task.status == TaskStatus::Success {
            EventKind::ExecutionDone
        } else {
            EventKind::ExecutionFailed
        };
        let payload = serde_json::json!({
            "task_id": task.id,
            "status": task.status,
            "failure": task.failure,
        });
        self.fanout.broadcast(Event::new(
            kind,
            EventKey::Execution(task.id),
            payload.clone(),
        ));
        self.fanout
            .broadcast(Event::new(kind, EventKey::Plan(task.plan_id), payload));
    }

    /// Once every task of a plan is terminal, settle the owning
    /// request: `complete` iff all succeeded, else `failed`.
    async fn rollup_request(&self, plan: &steward_core::Plan) {
        let plan = match self.store.get_plan(plan.id).await {
            Ok(plan) => plan,
            Err(_) => return,
        };
        if !plan.tasks.iter().all(|t| t.status.is_terminal()) {
            return;
        }
        let all_success = plan.tasks.iter().all(|t| t.status == TaskStatus::Success);
        let state = if all_success {
            steward_core::RequestState::Complete
        } else {
            steward_core::RequestState::Failed
        };
        if let Err(e) = self.store.set_request_state(plan.request_id, state).await {
            warn!(
                target: "steward.supervisor",
                request_id = %plan.request_id,
                error = %e,
                "request rollup failed"
            );
        } else {
            self.fanout.broadcast(Event::new(
                if all_success {
                    EventKind::ExecutionDone
                } else {
                    EventKind::ExecutionFailed
                },
                EventKey::Request(plan.request_id),
                serde_json::json!({ "plan_id": plan.id, "state": state }),
            ));
        }
    }

    pub(crate) fn effective_deadline(&self, task: &Task) -> Duration {
        Duration::from_secs(
            task.effective_deadline_seconds(self.config.default_task_deadline_seconds),
        )
    }

    pub(crate) fn work_request_envelope(&self, task: &Task, agent_type: &str) -> Envelope {
        Envelope::to_agent(
            agent_type,
            task.idempotency_key,
            MessageBody::WorkRequest(WorkRequest {
                task_id: task.id,
                work_type: task.work_type,
                parameters: task.parameters.clone(),
                hints: task.hints.clone(),
            }),
        )
    }
}

#[async_trait]
impl DispatchSink for Supervisor {
    async fn dispatch(&self, task: &Task, agent_id: &str) -> Result<(), SchedulerError> {
        let agent_type = self
            .registry
            .agent_type(agent_id)
            .ok_or_else(|| SchedulerError::Dispatch(format!("unknown agent `{agent_id}`")))?;

        self.store
            .assign_agent(task.id, agent_id)
            .await
            .map_err(SchedulerError::Store)?;
        let task = self
            .store
            .transition_task(task.id, TaskStatus::Approved, TaskStatus::Dispatched)
            .await
            .map_err(SchedulerError::Store)?;
        if let Err(e) = self.registry.record_dispatch(agent_id) {
            warn!(
                target: "steward.supervisor",
                agent_id,
                error = %e,
                "dispatch bookkeeping failed"
            );
        }
        self.deadlines.arm(task.id, self.effective_deadline(&task));

        let envelope = self.work_request_envelope(&task, &agent_type);
        info!(
            target: "steward.supervisor",
            task_id = %task.id,
            agent_id,
            queue = %Topology::agent_queue(&agent_type),
            "task dispatched"
        );
        self.fanout.broadcast(Event::new(
            EventKind::DispatchStarted,
            EventKey::Execution(task.id),
            serde_json::json!({ "task_id": task.id, "agent_id": agent_id }),
        ));
        self.fanout.broadcast(Event::new(
            EventKind::DispatchStarted,
            EventKey::Plan(task.plan_id),
            serde_json::json!({ "task_id": task.id, "agent_id": agent_id }),
        ));

        if let Err(e) = self
            .bus
            .publish(&Topology::agent_queue(&agent_type), &envelope)
            .await
        {
            // The task is already `dispatched`; treat the publish
            // failure as an unavailable agent and let the retry policy
            // decide.
            warn!(
                target: "steward.supervisor",
                task_id = %task.id,
                error = %e,
                "work request publish failed"
            );
            self.apply_failure(
                task.id,
                WireErrorCode::AgentUnavailable,
                format!("publish failed: {e}"),
            )
            .await;
        }
        Ok(())
    }
}
