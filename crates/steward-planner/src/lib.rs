// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-planner
#![deny(unsafe_code)]

pub mod catalog;
pub mod schema;

pub use catalog::{PlaybookCatalog, PlaybookEntry};
pub use schema::{RawPlan, RawTask, risk_from_complexity, validate_raw_plan};

use std::sync::Arc;
use steward_core::cancel::CancelToken;
use steward_core::{ChangeRequest, Plan, SchedulingHints, Task, WorkType};
use steward_llm::{ChatMessage, CompletionParams, CompletionRequest, Gateway, LlmError};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from planning.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The gateway could not produce a completion.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The model's plan failed validation.
    #[error("invalid plan: {reason}")]
    InvalidPlan {
        /// The first violation found.
        reason: String,
    },

    /// A `deploy_service` task named a service no playbook covers.
    #[error("no playbook matches service `{service}`")]
    UnresolvedService {
        /// The unmatched service name.
        service: String,
    },
}

impl PlanError {
    /// Stable machine-readable reason recorded on a failed request.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Llm(_) => "planner_llm_unavailable",
            Self::InvalidPlan { .. } => "planner_invalid_plan",
            Self::UnresolvedService { .. } => "planner_unresolved_service",
        }
    }
}

/// Derives plans from change requests.
pub struct Planner {
    gateway: Arc<Gateway>,
    catalog: PlaybookCatalog,
}

impl Planner {
    /// Build a planner over a gateway and playbook catalog.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, catalog: PlaybookCatalog) -> Self {
        Self { gateway, catalog }
    }

    /// The catalog backing `deploy_service` resolution.
    #[must_use]
    pub fn catalog(&self) -> &PlaybookCatalog {
        &self.catalog
    }

    /// Derive a plan for a request.
    ///
    /// Returns the plan together with the parsed intent document to be
    /// stored on the request.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] when the gateway fails, the plan does not
    /// validate, or a service cannot be resolved to a playbook.
    pub async fn plan(
        &self,
        request: &ChangeRequest,
        cancel: &CancelToken,
    ) -> Result<(Plan, serde_json::Value), PlanError> {
        let completion = self
            .gateway
            .complete(
                &CompletionRequest {
                    model: String::new(),
                    messages: vec![
                        ChatMessage::system(self.system_prompt()),
                        ChatMessage::user(request.text.clone()),
                    ],
                    params: CompletionParams {
                        temperature: Some(0.2),
                        max_tokens: Some(2048),
                        json_mode: true,
                    },
                },
                cancel,
            )
            .await?;

        let value = parse_json_lenient(&completion.content)?;
        let raw = validate_raw_plan(&value)?;
        debug!(
            target: "steward.planner",
            request_id = %request.id,
            tasks = raw.tasks.len(),
            complexity = raw.complexity_level,
            "raw plan validated"
        );

        let plan_id = uuid::Uuid::new_v4();
        let mut tasks = Vec::with_capacity(raw.tasks.len());
        for (ordinal, raw_task) in raw.tasks.iter().enumerate() {
            let work_type =
                WorkType::parse(&raw_task.work_type).ok_or_else(|| PlanError::InvalidPlan {
                    reason: format!("unknown work_type `{}`", raw_task.work_type),
                })?;
            let (work_type, parameters) = self
                .materialize(work_type, raw_task.parameters.clone())
                .await?;
            let mut task = Task::new(plan_id, ordinal as u32, work_type, parameters);
            task.hints = SchedulingHints {
                max_duration_seconds: raw_task.max_duration_seconds,
                max_memory_mb: raw_task.max_memory_mb,
            };
            tasks.push(task);
        }

        let plan = Plan {
            id: plan_id,
            request_id: request.id,
            summary: raw.summary.clone(),
            risk: risk_from_complexity(raw.complexity_level),
            estimated_duration_seconds: raw.estimated_duration_seconds,
            budget: Default::default(),
            approval: steward_core::ApprovalStatus::Pending,
            approver: None,
            decided_at: None,
            tasks,
        };
        info!(
            target: "steward.planner",
            request_id = %request.id,
            plan_id = %plan.id,
            risk = ?plan.risk,
            tasks = plan.tasks.len(),
            "plan derived"
        );
        Ok((plan, value))
    }

    /// Rewrite `deploy_service` into a concrete `run_playbook`; other
    /// work types pass through.
    async fn materialize(
        &self,
        work_type: WorkType,
        parameters: serde_json::Value,
    ) -> Result<(WorkType, serde_json::Value), PlanError> {
        if work_type != WorkType::DeployService {
            return Ok((work_type, parameters));
        }
        let service = parameters
            .get("service")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PlanError::InvalidPlan {
                reason: "deploy_service without a service parameter".into(),
            })?
            .to_string();
        let playbook = self.catalog.resolve(&service, &self.gateway).await?;
        let mut rewritten = parameters;
        rewritten["playbook"] = serde_json::json!(playbook.name);
        rewritten["service"] = serde_json::json!(service);
        Ok((WorkType::RunPlaybook, rewritten))
    }

    fn system_prompt(&self) -> String {
        let playbooks: Vec<String> = self
            .catalog
            .entries()
            .iter()
            .map(|e| format!("- {} — {}", e.name, e.description))
            .collect();
        format!(
            "You are the planning engine of a homelab infrastructure \
             orchestrator. Turn the operator's request into a JSON plan \
             with this exact shape:\n\
             {{\"summary\": string, \"complexity_level\": 1-5, \
             \"estimated_duration_seconds\": integer, \"tasks\": \
             [{{\"work_type\": string, \"parameters\": object, \
             \"max_duration_seconds\": integer?}}]}}\n\
             Valid work types: run_playbook (parameters.playbook), \
             deploy_service (parameters.service), discover_playbooks, \
             restart_service (parameters.service).\n\
             Known playbooks:\n{}\n\
             Answer with the JSON document only.",
            playbooks.join("\n")
        )
    }
}

/// Parse model output as JSON, tolerating a fenced code block.
fn parse_json_lenient(content: &str) -> Result<serde_json::Value, PlanError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| PlanError::InvalidPlan {
        reason: format!("model output is not valid JSON: {e}"),
    })
}
