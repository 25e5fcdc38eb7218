// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reconciliation of agent messages against the state store.
//!
//! The bus delivers at-least-once; every handler is idempotent on the
//! envelope `request_id` and every persisted effect happens before the
//! delivery is acknowledged.

use chrono::Utc;
use std::time::Duration;
use steward_bus::{BusDelivery, Topology};
use steward_core::{
    ErrorDetail, ExecutionStep, StepStatus, Task, TaskOutcome, TaskStatus, WireErrorCode,
};
use steward_events::{Event, EventKey, EventKind};
use steward_proto::{Envelope, MessageBody, WorkResult, WorkResultKind, WorkStatus, WorkStatusKind};
use steward_scheduler::RetryDecision;
use steward_store::{CompletionRecord, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Supervisor, SupervisorError};

impl Supervisor {
    /// Process one delivery from the status or results queue.
    ///
    /// Persist-then-ack: a handler failure nacks with requeue so the
    /// broker redelivers; everything else (including deliberately
    /// discarded messages) acks.
    pub async fn handle_delivery(&self, delivery: BusDelivery) {
        let envelope = delivery.envelope.clone();

        if !self.authenticate(&envelope) {
            warn!(
                target: "steward.supervisor",
                from = %envelope.from_agent,
                message_id = %envelope.message_id,
                "authentication failed, dropping message"
            );
            self.notify_error(
                &envelope.from_agent,
                envelope.request_id,
                ErrorDetail::new(WireErrorCode::AuthFailed),
            )
            .await;
            let _ = delivery.ack().await;
            return;
        }

        let outcome = match &envelope.body {
            MessageBody::WorkStatus(status) => self.handle_status(&envelope, status).await,
            MessageBody::WorkResult(result) => self.handle_result(&envelope, result).await,
            MessageBody::Error(detail) => self.handle_error(&envelope, detail).await,
            MessageBody::WorkRequest(_) => {
                warn!(
                    target: "steward.supervisor",
                    from = %envelope.from_agent,
                    "unexpected work_request on an orchestrator queue"
                );
                self.notify_error(
                    &envelope.from_agent,
                    envelope.request_id,
                    ErrorDetail::new(WireErrorCode::InvalidMessage)
                        .with_message("work_request is not valid on orchestrator queues"),
                )
                .await;
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {
                let _ = delivery.ack().await;
            }
            Err(e) => {
                warn!(
                    target: "steward.supervisor",
                    error = %e,
                    "handler failed, requeueing delivery"
                );
                let _ = delivery.nack(true).await;
            }
        }
    }

    fn authenticate(&self, envelope: &Envelope) -> bool {
        match (envelope.agent_id(), envelope.bearer_token()) {
            (Some(agent_id), Some(token)) => self.registry.verify_token(agent_id, token),
            _ => false,
        }
    }

    async fn handle_status(
        &self,
        envelope: &Envelope,
        status: &WorkStatus,
    ) -> Result<(), SupervisorError> {
        let task = match self.store.get_task(status.task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound { .. }) => {
                warn!(
                    target: "steward.supervisor",
                    task_id = %status.task_id,
                    "status for unknown task dropped"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if task.status.is_terminal() {
            debug!(
                target: "steward.supervisor",
                task_id = %task.id,
                request_id = %envelope.request_id,
                "late status after terminal transition discarded"
            );
            return Ok(());
        }
        if envelope.request_id != task.idempotency_key {
            debug!(
                target: "steward.supervisor",
                task_id = %task.id,
                "status with foreign request_id discarded"
            );
            return Ok(());
        }

        if task.status == TaskStatus::Dispatched {
            match self
                .store
                .transition_task(task.id, TaskStatus::Dispatched, TaskStatus::Running)
                .await
            {
                Ok(_) => {}
                Err(StoreError::StatusConflict { .. })
                | Err(StoreError::ImmutabilityViolation { .. }) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        self.deadlines.refresh(task.id);

        let agent_id = envelope
            .agent_id()
            .unwrap_or(envelope.from_agent.as_str())
            .to_string();
        match &status.step {
            Some(step) if step.output_chunk.is_some() => {
                let chunk = step.output_chunk.as_ref().expect("checked above");
                let mut assemblers = self.assemblers.lock().await;
                let assembler = assemblers.entry(task.id).or_default();
                if let Err(e) = assembler.push(chunk) {
                    warn!(
                        target: "steward.supervisor",
                        task_id = %task.id,
                        error = %e,
                        "rejected output chunk"
                    );
                    return Ok(());
                }
                if assembler.is_complete() {
                    let assembler = assemblers.remove(&task.id).expect("present");
                    drop(assemblers);
                    let output = assembler.finish().unwrap_or_default();
                    self.record_step(
                        &task,
                        &agent_id,
                        &step.name,
                        StepStatus::Completed,
                        Some(&output),
                        step.duration_ms,
                    )
                    .await?;
                    self.emit_step_event(&task, status);
                }
            }
            Some(step) => {
                let step_status = match status.status {
                    WorkStatusKind::StepCompleted => StepStatus::Completed,
                    WorkStatusKind::Running | WorkStatusKind::Paused => StepStatus::Running,
                };
                self.record_step(
                    &task,
                    &agent_id,
                    &step.name,
                    step_status,
                    step.output.as_deref(),
                    step.duration_ms,
                )
                .await?;
                if status.status == WorkStatusKind::StepCompleted {
                    self.emit_step_event(&task, status);
                }
            }
            None => {
                let action = match status.status {
                    WorkStatusKind::Running => "running",
                    WorkStatusKind::StepCompleted => "step_completed",
                    WorkStatusKind::Paused => "paused",
                };
                self.record_step(&task, &agent_id, action, StepStatus::Running, None, None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn record_step(
        &self,
        task: &Task,
        agent_id: &str,
        action: &str,
        status: StepStatus,
        output: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Result<(), SupervisorError> {
        self.store
            .append_step(ExecutionStep {
                id: Uuid::new_v4(),
                task_id: task.id,
                ordinal: 0,
                agent_id: agent_id.to_string(),
                action: action.to_string(),
                status,
                output_summary: output.map(ExecutionStep::summarize),
                recorded_at: Utc::now(),
                duration_ms,
            })
            .await?;
        Ok(())
    }

    fn emit_step_event(&self, task: &Task, status: &WorkStatus) {
        let payload = serde_json::json!({
            "task_id": task.id,
            "progress_percent": status.progress_percent,
            "step": status.step.as_ref().map(|s| serde_json::json!({
                "number": s.number,
                "name": s.name,
            })),
        });
        self.fanout.broadcast(Event::new(
            EventKind::StepCompleted,
            EventKey::Execution(task.id),
            payload.clone(),
        ));
        self.fanout.broadcast(Event::new(
            EventKind::StepCompleted,
            EventKey::Plan(task.plan_id),
            payload,
        ));
    }

    async fn handle_result(
        &self,
        envelope: &Envelope,
        result: &WorkResult,
    ) -> Result<(), SupervisorError> {
        let task = match self.store.get_task(result.task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound { .. }) => {
                warn!(
                    target: "steward.supervisor",
                    task_id = %result.task_id,
                    "result for unknown task dropped"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if task.status.is_terminal() {
            debug!(
                target: "steward.supervisor",
                task_id = %task.id,
                request_id = %envelope.request_id,
                "duplicate result after terminal transition discarded"
            );
            return Ok(());
        }
        if envelope.request_id != task.idempotency_key {
            debug!(
                target: "steward.supervisor",
                task_id = %task.id,
                "result with foreign request_id discarded"
            );
            return Ok(());
        }
        if !matches!(task.status, TaskStatus::Dispatched | TaskStatus::Running) {
            warn!(
                target: "steward.supervisor",
                task_id = %task.id,
                status = %task.status,
                "result for a task that was never dispatched, dropping"
            );
            return Ok(());
        }

        // A result may arrive before any status message; the machine
        // still passes through `running`.
        if task.status == TaskStatus::Dispatched {
            match self
                .store
                .transition_task(task.id, TaskStatus::Dispatched, TaskStatus::Running)
                .await
            {
                Ok(_) => {}
                Err(StoreError::StatusConflict { .. })
                | Err(StoreError::ImmutabilityViolation { .. }) => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let success = result.status == WorkResultKind::Success;
        let next = if success {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };
        let completion = CompletionRecord {
            outcome: TaskOutcome {
                exit_code: Some(result.exit_code),
                output: Some(ExecutionStep::summarize(&result.output)),
            },
            resources_used: result.resources_used.clone(),
            services_touched: services_touched(envelope, &task),
            failure: (!success).then(|| {
                steward_core::FailureInfo::reason(format!(
                    "agent reported failure with exit code {}",
                    result.exit_code
                ))
            }),
        };
        let completed = match self
            .store
            .complete_task(task.id, TaskStatus::Running, next, completion)
            .await
        {
            Ok(task) => task,
            Err(StoreError::StatusConflict { .. }) | Err(StoreError::ImmutabilityViolation { .. }) => {
                debug!(
                    target: "steward.supervisor",
                    task_id = %task.id,
                    "terminal transition already applied, result discarded"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(agent_id) = &completed.agent_id {
            let _ = self.registry.record_outcome(agent_id, success);
        }
        self.deadlines.disarm(completed.id);
        self.assemblers.lock().await.remove(&completed.id);
        info!(
            target: "steward.supervisor",
            task_id = %completed.id,
            status = %completed.status,
            exit_code = result.exit_code,
            "task finished"
        );
        self.finalize(&completed).await;
        Ok(())
    }

    async fn handle_error(
        &self,
        envelope: &Envelope,
        detail: &ErrorDetail,
    ) -> Result<(), SupervisorError> {
        let Some(task_id) = detail
            .error_context
            .get("task_id")
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            warn!(
                target: "steward.supervisor",
                from = %envelope.from_agent,
                code = %detail.error_code,
                "error envelope without task context dropped"
            );
            return Ok(());
        };
        self.apply_failure(task_id, detail.error_code, detail.error_message.clone())
            .await;
        Ok(())
    }

    /// Apply the retry policy to one observed failure of an in-flight
    /// task: back off and re-dispatch, or turn the task terminal.
    pub(crate) async fn apply_failure(&self, task_id: Uuid, code: WireErrorCode, context: String) {
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(_) => return,
        };
        if task.status.is_terminal() {
            debug!(
                target: "steward.supervisor",
                %task_id,
                "failure for terminal task discarded"
            );
            return;
        }
        if !matches!(task.status, TaskStatus::Dispatched | TaskStatus::Running) {
            warn!(
                target: "steward.supervisor",
                %task_id,
                status = %task.status,
                "failure for a task that is not in flight, dropping"
            );
            return;
        }
        if let Some(agent_id) = &task.agent_id {
            let _ = self.registry.record_outcome(agent_id, false);
        }

        match self.policy.decide(code, task.retry_count) {
            RetryDecision::RetryAfter(delay) => {
                let retries = match self.store.bump_retry(task_id).await {
                    Ok(retries) => retries,
                    Err(_) => return,
                };
                warn!(
                    target: "steward.supervisor",
                    %task_id,
                    code = %code,
                    retries,
                    delay_seconds = delay.as_secs(),
                    "retryable failure, backing off"
                );
                let _ = self
                    .record_step(
                        &task,
                        task.agent_id.as_deref().unwrap_or("-"),
                        "retry",
                        StepStatus::Failed,
                        Some(&format!("{code}: {context}")),
                        None,
                    )
                    .await;
                self.deadlines.disarm(task_id);
                self.schedule_redispatch(&task, delay);
            }
            RetryDecision::FailImmediately => {
                self.fail_task(&task, code, context).await;
            }
            RetryDecision::BudgetExhausted => {
                self.fail_task(
                    &task,
                    code,
                    steward_core::FailureInfo::RETRY_BUDGET_EXCEEDED.to_string(),
                )
                .await;
            }
        }
    }

    async fn fail_task(&self, task: &Task, code: WireErrorCode, reason: String) {
        // The machine reaches `failed` from `dispatched` directly or
        // through `running`; from `running` only via `complete_task`.
        let expected = task.status;
        let completion = CompletionRecord {
            outcome: TaskOutcome::default(),
            resources_used: task.resources_used.clone().unwrap_or_default(),
            services_touched: task.services_touched.clone(),
            failure: Some(steward_core::FailureInfo::from_code(code, reason)),
        };
        let completed = match self
            .store
            .complete_task(task.id, expected, TaskStatus::Failed, completion)
            .await
        {
            Ok(task) => task,
            Err(StoreError::StatusConflict { .. }) | Err(StoreError::ImmutabilityViolation { .. }) => {
                debug!(
                    target: "steward.supervisor",
                    task_id = %task.id,
                    "terminal race while failing task, discarding"
                );
                return;
            }
            Err(e) => {
                warn!(
                    target: "steward.supervisor",
                    task_id = %task.id,
                    error = %e,
                    "could not mark task failed"
                );
                return;
            }
        };
        self.deadlines.disarm(completed.id);
        self.assemblers.lock().await.remove(&completed.id);
        info!(
            target: "steward.supervisor",
            task_id = %completed.id,
            code = %code,
            "task failed terminally"
        );
        self.finalize(&completed).await;
    }

    /// Re-publish the work request after the backoff delay, unless the
    /// task reached a terminal status in the meantime.
    fn schedule_redispatch(&self, task: &Task, delay: Duration) {
        let store = std::sync::Arc::clone(&self.store);
        let bus = std::sync::Arc::clone(&self.bus);
        let registry = std::sync::Arc::clone(&self.registry);
        let deadlines = self.deadlines.clone();
        let default_deadline = self.config.default_task_deadline_seconds;
        let task_id = task.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let task = match store.get_task(task_id).await {
                Ok(task) => task,
                Err(_) => return,
            };
            if !matches!(task.status, TaskStatus::Dispatched | TaskStatus::Running) {
                return;
            }
            let agent_type = task
                .agent_id
                .as_deref()
                .and_then(|id| registry.agent_type(id))
                .unwrap_or_else(|| task.work_type.as_str().to_string());
            if let Some(agent_id) = &task.agent_id {
                let _ = registry.record_dispatch(agent_id);
            }
            let envelope = Envelope::to_agent(
                &agent_type,
                task.idempotency_key,
                MessageBody::WorkRequest(steward_proto::WorkRequest {
                    task_id: task.id,
                    work_type: task.work_type,
                    parameters: task.parameters.clone(),
                    hints: task.hints.clone(),
                }),
            );
            deadlines.arm(
                task.id,
                Duration::from_secs(task.effective_deadline_seconds(default_deadline)),
            );
            if let Err(e) = bus.publish(&Topology::agent_queue(&agent_type), &envelope).await {
                warn!(
                    target: "steward.supervisor",
                    %task_id,
                    error = %e,
                    "re-dispatch publish failed, deadline will fire"
                );
            } else {
                info!(
                    target: "steward.supervisor",
                    %task_id,
                    queue = %Topology::agent_queue(&agent_type),
                    "task re-dispatched after backoff"
                );
            }
        });
    }

    async fn notify_error(&self, agent_type: &str, request_id: Uuid, detail: ErrorDetail) {
        let envelope = Envelope::to_agent(agent_type, request_id, MessageBody::Error(detail));
        if let Err(e) = self
            .bus
            .publish(&Topology::agent_queue(agent_type), &envelope)
            .await
        {
            debug!(
                target: "steward.supervisor",
                agent_type,
                error = %e,
                "error notification not delivered"
            );
        }
    }
}

/// Services a terminal task touched: the agent's explicit list when
/// provided, else derived from the task parameters.
fn services_touched(envelope: &Envelope, task: &Task) -> Vec<String> {
    if let Some(explicit) = envelope
        .extensions
        .get("services_touched")
        .and_then(|v| v.as_array())
    {
        let services: Vec<String> = explicit
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        if !services.is_empty() {
            return services;
        }
    }
    task.parameters
        .get("service")
        .and_then(|v| v.as_str())
        .map(|s| vec![s.to_string()])
        .unwrap_or_default()
}
