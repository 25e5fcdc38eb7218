// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-service
#![deny(unsafe_code)]

mod failure;

pub use failure::FailureView;

use std::sync::Arc;
use steward_core::cancel::CancelToken;
use steward_core::config::OrchestratorConfig;
use steward_core::{ApprovalStatus, ChangeRequest, Plan, RequestState, TaskStatus};
use steward_events::{Event, EventFanout, EventKey, EventKind};
use steward_llm::Gateway;
use steward_planner::{PlanError, Planner, PlaybookCatalog};
use steward_registry::{AgentRegistry, AgentView, HeartbeatMetrics, RegistryError};
use steward_scheduler::{ResumeLoop, Scheduler, SchedulerError};
use steward_store::{Page, StateStore, StoreError, TaskFilter};
use steward_supervisor::{Supervisor, SupervisorError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Errors surfaced at the request boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// State store failure or conflict.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Planner failure.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Scheduler/dispatch failure.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Supervisor failure.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The operation is not valid in the entity's current state.
    #[error("{0}")]
    InvalidState(String),
}

/// Health snapshot of the orchestrator, consumed by the adapter's
/// `/health` endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceSnapshot {
    /// Every known agent.
    pub agents: Vec<AgentView>,
    /// Tasks parked in the pause queue.
    pub paused_tasks: usize,
    /// Tasks with an armed deadline (dispatched or running).
    pub in_flight_tasks: usize,
    /// Audit writes awaiting retry.
    pub audit_retry_depth: usize,
}

/// The assembled orchestrator.
///
/// Construct with [`OrchestratorService::start`]; the resume loop and
/// the supervisor's reconciliation loop run until [`shutdown`]
/// (or drop of the root cancel token).
///
/// [`shutdown`]: OrchestratorService::shutdown
pub struct OrchestratorService {
    store: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    planner: Arc<Planner>,
    scheduler: Arc<Scheduler>,
    supervisor: Arc<Supervisor>,
    fanout: Arc<EventFanout>,
    cancel: CancelToken,
    resume_loop: Option<ResumeLoop>,
    supervisor_loop: Option<JoinHandle<()>>,
}

impl OrchestratorService {
    /// Wire the components together and start the background loops.
    ///
    /// Seeds the agent registry from the store (restart
    /// reconciliation) before anything is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if reconciliation fails.
    pub async fn start(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn steward_bus::MessageBus>,
        gateway: Arc<Gateway>,
        catalog: PlaybookCatalog,
        audit: steward_audit::AuditLog,
        config: OrchestratorConfig,
    ) -> Result<Self, ServiceError> {
        let registry = Arc::new(AgentRegistry::new(
            config.heartbeat_ttl(),
            config.breaker_consecutive_failures,
            config.breaker_cooldown(),
        ));
        registry.seed(store.list_agents().await?);

        let fanout = Arc::new(EventFanout::new());
        let planner = Arc::new(Planner::new(gateway, catalog));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&fanout),
            config.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            bus,
            Arc::clone(&registry),
            audit,
            Arc::clone(&fanout),
            config,
        ));

        let cancel = CancelToken::new();
        let supervisor_loop = Supervisor::spawn(Arc::clone(&supervisor), cancel.clone());
        let resume_loop = ResumeLoop::start(
            Arc::clone(&scheduler),
            Arc::clone(&supervisor) as Arc<dyn steward_scheduler::DispatchSink>,
            cancel.clone(),
        );
        info!(target: "steward.service", "orchestrator started");

        Ok(Self {
            store,
            registry,
            planner,
            scheduler,
            supervisor,
            fanout,
            cancel,
            resume_loop: Some(resume_loop),
            supervisor_loop: Some(supervisor_loop),
        })
    }

    /// Stop the background loops and wait for them.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(resume_loop) = self.resume_loop.take() {
            resume_loop.stop().await;
        }
        if let Some(handle) = self.supervisor_loop.take() {
            let _ = handle.await;
        }
        info!(target: "steward.service", "orchestrator stopped");
    }

    /// The event fan-out, for the adapter to attach subscribers.
    #[must_use]
    pub fn fanout(&self) -> &Arc<EventFanout> {
        &self.fanout
    }

    /// The agent registry (adapter-side registration endpoints).
    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    // -- Request lifecycle --------------------------------------------------

    /// Accept a change request and plan it asynchronously. Returns the
    /// request id immediately; planning outcome lands in the store.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the request cannot be
    /// persisted.
    pub async fn submit(
        &self,
        request_text: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<Uuid, ServiceError> {
        let request = ChangeRequest::new(user, request_text);
        self.store.insert_request(&request).await?;
        info!(
            target: "steward.service",
            request_id = %request.id,
            requester = %request.requester,
            "request accepted"
        );

        let store = Arc::clone(&self.store);
        let planner = Arc::clone(&self.planner);
        let cancel = self.cancel.clone();
        let request_id = request.id;
        tokio::spawn(async move {
            if let Err(e) = run_planning(&store, &planner, request, &cancel).await {
                error!(
                    target: "steward.service",
                    %request_id,
                    error = %e,
                    "planning failed"
                );
            }
        });
        Ok(request_id)
    }

    /// Fetch a request.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] when the request is unknown.
    pub async fn get_request(&self, request_id: Uuid) -> Result<ChangeRequest, ServiceError> {
        Ok(self.store.get_request(request_id).await?)
    }

    /// Fetch a plan with its tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] when the plan is unknown.
    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Plan, ServiceError> {
        Ok(self.store.get_plan(plan_id).await?)
    }

    /// Every plan derived from a request, including superseded ones.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] on store failures.
    pub async fn request_history(&self, request_id: Uuid) -> Result<Vec<Plan>, ServiceError> {
        Ok(self.store.list_plans_for_request(request_id).await?)
    }

    /// Approve a plan and gate it into dispatch. Returns `true` when
    /// at least one task was handed off immediately (the rest may be
    /// parked on capacity).
    ///
    /// A second approval of the same plan fails with the store's
    /// conflict error and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] (including `PlanDecided` on
    /// double approval) or [`ServiceError::Scheduler`].
    pub async fn approve(
        &self,
        plan_id: Uuid,
        approver: impl Into<String>,
    ) -> Result<bool, ServiceError> {
        let approver = approver.into();
        let plan = self
            .store
            .decide_plan(plan_id, ApprovalStatus::Approved, Some(approver.clone()))
            .await?;

        for task in &plan.tasks {
            match self
                .store
                .transition_task(task.id, TaskStatus::PendingApproval, TaskStatus::Approved)
                .await
            {
                Ok(_) => {}
                Err(StoreError::StatusConflict { .. }) => {
                    // Cancelled while pending; dispatch will skip it.
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.store
            .set_request_state(plan.request_id, RequestState::Approved)
            .await?;
        self.fanout.broadcast(Event::new(
            EventKind::PlanApproved,
            EventKey::Plan(plan.id),
            serde_json::json!({ "plan_id": plan.id, "approver": approver }),
        ));
        self.fanout.broadcast(Event::new(
            EventKind::PlanApproved,
            EventKey::Request(plan.request_id),
            serde_json::json!({ "plan_id": plan.id }),
        ));

        let plan = self.store.get_plan(plan_id).await?;
        let dispatched = self
            .scheduler
            .dispatch_plan(&plan, self.supervisor.as_ref())
            .await?;
        self.store
            .set_request_state(plan.request_id, RequestState::Executing)
            .await?;
        info!(
            target: "steward.service",
            %plan_id,
            dispatched,
            total = plan.tasks.len(),
            "plan approved"
        );
        Ok(dispatched > 0)
    }

    /// Reject a plan: its tasks become `rejected`, the request is
    /// settled as `rejected`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] on conflicts or store failures.
    pub async fn reject(
        &self,
        plan_id: Uuid,
        approver: impl Into<String>,
    ) -> Result<(), ServiceError> {
        let plan = self
            .store
            .decide_plan(plan_id, ApprovalStatus::Rejected, Some(approver.into()))
            .await?;
        for task in &plan.tasks {
            if self
                .store
                .transition_task(task.id, TaskStatus::PendingApproval, TaskStatus::Rejected)
                .await
                .is_ok()
            {
                self.supervisor.finalize_terminal(task.id).await?;
            }
        }
        self.store
            .set_request_state(plan.request_id, RequestState::Rejected)
            .await?;
        info!(target: "steward.service", %plan_id, "plan rejected");
        Ok(())
    }

    /// Replace a pending plan: the old plan is marked `superseded`
    /// (its tasks cancelled) and a sibling plan is derived from the new
    /// text under the same request. Returns the new plan id.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when the plan is already decided, the
    /// request is unknown, or re-planning fails.
    pub async fn modify(
        &self,
        plan_id: Uuid,
        new_request_text: impl Into<String>,
    ) -> Result<Uuid, ServiceError> {
        let old = self
            .store
            .decide_plan(plan_id, ApprovalStatus::Superseded, None)
            .await?;
        for task in &old.tasks {
            if self
                .store
                .transition_task(task.id, TaskStatus::PendingApproval, TaskStatus::Cancelled)
                .await
                .is_ok()
            {
                self.supervisor.finalize_terminal(task.id).await?;
            }
        }

        let mut request = self.store.get_request(old.request_id).await?;
        request.text = new_request_text.into();
        self.store
            .set_request_state(request.id, RequestState::Planning)
            .await?;

        let (plan, intent) = self.planner.plan(&request, &self.cancel).await?;
        persist_plan(&self.store, &request, plan.clone(), intent).await?;
        info!(
            target: "steward.service",
            old_plan = %plan_id,
            new_plan = %plan.id,
            "plan superseded"
        );
        Ok(plan.id)
    }

    /// Cancel one task.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] on store failures; cancelling an
    /// already-terminal task is a quiet no-op (`Ok`).
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<(), ServiceError> {
        self.supervisor.cancel_task(task_id).await?;
        Ok(())
    }

    /// Cancel a request: every non-terminal task of its current plans
    /// is cancelled and the request is settled.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] on store failures.
    pub async fn cancel_request(&self, request_id: Uuid) -> Result<(), ServiceError> {
        let plans = self.store.list_plans_for_request(request_id).await?;
        for plan in &plans {
            for task in &plan.tasks {
                if !task.status.is_terminal() {
                    self.supervisor.cancel_task(task.id).await?;
                }
            }
        }
        self.store
            .set_request_state(request_id, RequestState::Failed)
            .await?;
        info!(target: "steward.service", %request_id, "request cancelled");
        Ok(())
    }

    /// Query terminal and in-flight tasks for the audit view.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] on store failures.
    pub async fn query_audit(
        &self,
        filter: &TaskFilter,
    ) -> Result<Page<steward_core::Task>, ServiceError> {
        Ok(self.store.query_tasks(filter).await?)
    }

    // -- Agent surface ------------------------------------------------------

    /// Register a worker agent, persisting its record and returning
    /// the issued bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Registry`] or [`ServiceError::Store`].
    pub async fn register_agent(
        &self,
        id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: Vec<String>,
        declared_capacity: u32,
    ) -> Result<String, ServiceError> {
        let registration =
            self.registry
                .register(id, agent_type, capabilities, declared_capacity)?;
        self.store.upsert_agent(&registration.record).await?;
        Ok(registration.token)
    }

    /// Record an agent heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Registry`] for unknown agents.
    pub fn agent_heartbeat(
        &self,
        agent_id: &str,
        metrics: HeartbeatMetrics,
    ) -> Result<(), ServiceError> {
        Ok(self.registry.heartbeat(agent_id, metrics)?)
    }

    /// Remove an agent from the registry and the store.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] on store failures.
    pub async fn forget_agent(&self, agent_id: &str) -> Result<(), ServiceError> {
        self.registry.forget(agent_id);
        self.store.delete_agent(agent_id).await?;
        Ok(())
    }

    /// Point-in-time health snapshot.
    pub async fn snapshot(&self) -> ServiceSnapshot {
        let paused_tasks = self.scheduler.paused_depth().await.unwrap_or_else(|e| {
            warn!(target: "steward.service", error = %e, "pause depth unavailable");
            0
        });
        ServiceSnapshot {
            agents: self.registry.snapshot(),
            paused_tasks,
            in_flight_tasks: self.supervisor.in_flight(),
            audit_retry_depth: self.supervisor.audit_retry().depth().await,
        }
    }
}

/// Plan a request and persist the outcome. Failures settle the request
/// as `failed` with the planner's reason.
async fn run_planning(
    store: &Arc<dyn StateStore>,
    planner: &Planner,
    request: ChangeRequest,
    cancel: &CancelToken,
) -> Result<(), ServiceError> {
    store
        .set_request_state(request.id, RequestState::Planning)
        .await?;
    match planner.plan(&request, cancel).await {
        Ok((plan, intent)) => {
            persist_plan(store, &request, plan, intent).await?;
            Ok(())
        }
        Err(e) => {
            warn!(
                target: "steward.service",
                request_id = %request.id,
                reason = e.reason_code(),
                "request failed planning"
            );
            store
                .set_request_intent(
                    request.id,
                    serde_json::json!({ "planner_failure": e.reason_code(), "detail": e.to_string() }),
                )
                .await?;
            store
                .set_request_state(request.id, RequestState::Failed)
                .await?;
            Err(e.into())
        }
    }
}

/// Persist a freshly derived plan: tasks surface as pending approval
/// and the request carries its parsed intent.
async fn persist_plan(
    store: &Arc<dyn StateStore>,
    request: &ChangeRequest,
    mut plan: Plan,
    intent: serde_json::Value,
) -> Result<(), ServiceError> {
    for task in &mut plan.tasks {
        task.status = TaskStatus::PendingApproval;
    }
    store.insert_plan(&plan).await?;
    store.set_request_intent(request.id, intent).await?;
    store
        .set_request_state(request.id, RequestState::PendingApproval)
        .await?;
    Ok(())
}
