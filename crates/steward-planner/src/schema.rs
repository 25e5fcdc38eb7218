// SPDX-License-Identifier: MIT OR Apache-2.0
//! The model-facing plan shape and its validation.
//!
//! The LLM answers with a `RawPlan`; it is validated structurally
//! against a generated JSON schema, then semantically per work type,
//! before anything becomes a real [`steward_core::Plan`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use steward_core::WorkType;

use crate::PlanError;

/// Hard cap on tasks in one plan.
pub const MAX_TASKS: usize = 16;

/// Hard cap on the canonical size of one task's parameters.
pub const MAX_PARAM_BYTES: usize = 64 * 1024;

/// The plan document the model is asked to produce.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RawPlan {
    /// One-sentence summary of the change.
    pub summary: String,
    /// Model's complexity estimate, 1 (trivial) to 5 (risky).
    pub complexity_level: u8,
    /// Estimated wall-clock duration in seconds.
    pub estimated_duration_seconds: u64,
    /// The tasks, in execution order.
    pub tasks: Vec<RawTask>,
}

/// One task as produced by the model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RawTask {
    /// Work type name from the catalog.
    pub work_type: String,
    /// Work-type specific parameters.
    pub parameters: serde_json::Value,
    /// Optional per-task deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
    /// Optional memory hint in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
}

/// Validate a parsed plan document structurally and semantically.
///
/// # Errors
///
/// Returns [`PlanError::InvalidPlan`] naming the first violation.
pub fn validate_raw_plan(value: &serde_json::Value) -> Result<RawPlan, PlanError> {
    let schema = schemars::schema_for!(RawPlan);
    let schema_value = serde_json::to_value(&schema).map_err(|e| PlanError::InvalidPlan {
        reason: format!("schema generation failed: {e}"),
    })?;
    let validator =
        jsonschema::validator_for(&schema_value).map_err(|e| PlanError::InvalidPlan {
            reason: format!("schema compilation failed: {e}"),
        })?;
    if let Err(error) = validator.validate(value) {
        return Err(PlanError::InvalidPlan {
            reason: format!("plan does not match schema: {error}"),
        });
    }

    let plan: RawPlan = serde_json::from_value(value.clone()).map_err(|e| {
        PlanError::InvalidPlan {
            reason: format!("plan deserialization failed: {e}"),
        }
    })?;

    if plan.tasks.is_empty() {
        return Err(PlanError::InvalidPlan {
            reason: "plan contains no tasks".into(),
        });
    }
    if plan.tasks.len() > MAX_TASKS {
        return Err(PlanError::InvalidPlan {
            reason: format!("plan has {} tasks, maximum is {MAX_TASKS}", plan.tasks.len()),
        });
    }
    if !(1..=5).contains(&plan.complexity_level) {
        return Err(PlanError::InvalidPlan {
            reason: format!("complexity_level {} is outside 1..=5", plan.complexity_level),
        });
    }

    for (idx, task) in plan.tasks.iter().enumerate() {
        let work_type = WorkType::parse(&task.work_type).ok_or_else(|| PlanError::InvalidPlan {
            reason: format!("task {idx}: unknown work_type `{}`", task.work_type),
        })?;
        validate_parameters(idx, work_type, &task.parameters)?;
    }
    Ok(plan)
}

fn validate_parameters(
    idx: usize,
    work_type: WorkType,
    parameters: &serde_json::Value,
) -> Result<(), PlanError> {
    if !parameters.is_object() {
        return Err(PlanError::InvalidPlan {
            reason: format!("task {idx}: parameters must be an object"),
        });
    }
    let canonical = steward_core::canonical_json(parameters).map_err(|e| {
        PlanError::InvalidPlan {
            reason: format!("task {idx}: parameters not serializable: {e}"),
        }
    })?;
    if canonical.len() > MAX_PARAM_BYTES {
        return Err(PlanError::InvalidPlan {
            reason: format!(
                "task {idx}: parameters are {} bytes, maximum is {MAX_PARAM_BYTES}",
                canonical.len()
            ),
        });
    }

    let required: &[&str] = match work_type {
        WorkType::RunPlaybook => &["playbook"],
        WorkType::DeployService | WorkType::RestartService => &["service"],
        WorkType::DiscoverPlaybooks => &[],
    };
    for key in required {
        let present = parameters
            .get(*key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        if !present {
            return Err(PlanError::InvalidPlan {
                reason: format!(
                    "task {idx}: {} requires a non-empty `{key}` parameter",
                    work_type.as_str()
                ),
            });
        }
    }
    Ok(())
}

/// Map the model's complexity estimate onto operator-facing risk.
///
/// The rule used across the UI projection: 1–2 → low, 3 → medium,
/// 4–5 → high.
#[must_use]
pub fn risk_from_complexity(complexity_level: u8) -> steward_core::RiskLevel {
    match complexity_level {
        0..=2 => steward_core::RiskLevel::Low,
        3 => steward_core::RiskLevel::Medium,
        _ => steward_core::RiskLevel::High,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::RiskLevel;

    fn valid_plan() -> serde_json::Value {
        serde_json::json!({
            "summary": "Deploy Uptime Kuma",
            "complexity_level": 2,
            "estimated_duration_seconds": 120,
            "tasks": [
                {"work_type": "run_playbook", "parameters": {"playbook": "uptime-kuma.yml"}},
                {"work_type": "restart_service", "parameters": {"service": "caddy"},
                 "max_duration_seconds": 60}
            ]
        })
    }

    #[test]
    fn valid_plan_passes() {
        let plan = validate_raw_plan(&valid_plan()).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].max_duration_seconds, Some(60));
    }

    #[test]
    fn empty_task_list_is_rejected() {
        let mut value = valid_plan();
        value["tasks"] = serde_json::json!([]);
        let err = validate_raw_plan(&value).unwrap_err();
        assert!(err.to_string().contains("no tasks"));
    }

    #[test]
    fn unknown_work_type_is_rejected() {
        let mut value = valid_plan();
        value["tasks"][0]["work_type"] = serde_json::json!("format_disk");
        let err = validate_raw_plan(&value).unwrap_err();
        assert!(err.to_string().contains("unknown work_type"));
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let mut value = valid_plan();
        value["tasks"][0]["parameters"] = serde_json::json!({});
        let err = validate_raw_plan(&value).unwrap_err();
        assert!(err.to_string().contains("playbook"));
    }

    #[test]
    fn unexpected_top_level_field_is_rejected() {
        let mut value = valid_plan();
        value["rm_rf"] = serde_json::json!(true);
        assert!(validate_raw_plan(&value).is_err());
    }

    #[test]
    fn oversized_parameters_are_rejected() {
        let mut value = valid_plan();
        value["tasks"][0]["parameters"] = serde_json::json!({
            "playbook": "x.yml",
            "blob": "a".repeat(MAX_PARAM_BYTES + 1),
        });
        let err = validate_raw_plan(&value).unwrap_err();
        assert!(err.to_string().contains("bytes"));
    }

    #[test]
    fn complexity_out_of_band_is_rejected() {
        let mut value = valid_plan();
        value["complexity_level"] = serde_json::json!(9);
        assert!(validate_raw_plan(&value).is_err());
    }

    #[test]
    fn complexity_maps_to_risk() {
        assert_eq!(risk_from_complexity(1), RiskLevel::Low);
        assert_eq!(risk_from_complexity(2), RiskLevel::Low);
        assert_eq!(risk_from_complexity(3), RiskLevel::Medium);
        assert_eq!(risk_from_complexity(4), RiskLevel::High);
        assert_eq!(risk_from_complexity(5), RiskLevel::High);
    }
}
