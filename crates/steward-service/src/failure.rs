// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured failure views for the request boundary.
//!
//! Every failure the adapter surfaces carries a stable machine code, a
//! human message, and machine-readable context; the UI maps codes to
//! display text.

use serde::{Deserialize, Serialize};

use crate::ServiceError;
use steward_planner::PlanError;
use steward_store::StoreError;

/// What the UI sees when an operation fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureView {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable context.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl FailureView {
    /// Build the view for a service error.
    #[must_use]
    pub fn from_error(error: &ServiceError) -> Self {
        let (code, context) = classify(error);
        Self {
            code: code.to_string(),
            message: error.to_string(),
            context,
        }
    }
}

fn classify(error: &ServiceError) -> (&'static str, serde_json::Value) {
    match error {
        ServiceError::Store(StoreError::NotFound { entity, id }) => (
            "not_found",
            serde_json::json!({ "entity": entity, "id": id }),
        ),
        ServiceError::Store(StoreError::StatusConflict {
            task_id,
            expected,
            found,
        }) => (
            "status_conflict",
            serde_json::json!({
                "task_id": task_id,
                "expected": expected.to_string(),
                "found": found.to_string(),
            }),
        ),
        ServiceError::Store(StoreError::PlanDecided { plan_id, status }) => (
            "plan_already_decided",
            serde_json::json!({ "plan_id": plan_id, "status": format!("{status:?}") }),
        ),
        ServiceError::Store(StoreError::ImmutabilityViolation { task_id }) => (
            "task_terminal",
            serde_json::json!({ "task_id": task_id }),
        ),
        ServiceError::Store(_) => ("store_error", serde_json::Value::Null),
        ServiceError::Plan(e @ PlanError::UnresolvedService { service }) => (
            e.reason_code(),
            serde_json::json!({ "service": service }),
        ),
        ServiceError::Plan(e) => (e.reason_code(), serde_json::Value::Null),
        ServiceError::Scheduler(_) => ("scheduler_error", serde_json::Value::Null),
        ServiceError::Supervisor(_) => ("supervisor_error", serde_json::Value::Null),
        ServiceError::Registry(_) => ("registry_error", serde_json::Value::Null),
        ServiceError::InvalidState(_) => ("invalid_state", serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn not_found_maps_to_stable_code() {
        let err = ServiceError::Store(StoreError::NotFound {
            entity: "plan",
            id: Uuid::nil().to_string(),
        });
        let view = FailureView::from_error(&err);
        assert_eq!(view.code, "not_found");
        assert_eq!(view.context["entity"], "plan");
    }

    #[test]
    fn double_decision_maps_to_plan_already_decided() {
        let err = ServiceError::Store(StoreError::PlanDecided {
            plan_id: Uuid::nil(),
            status: steward_core::ApprovalStatus::Approved,
        });
        let view = FailureView::from_error(&err);
        assert_eq!(view.code, "plan_already_decided");
    }

    #[test]
    fn planner_failures_keep_their_reason_codes() {
        let err = ServiceError::Plan(PlanError::UnresolvedService {
            service: "mystery".into(),
        });
        let view = FailureView::from_error(&err);
        assert_eq!(view.code, "planner_unresolved_service");
        assert_eq!(view.context["service"], "mystery");
    }
}
