// SPDX-License-Identifier: MIT OR Apache-2.0
//! Planner end-to-end against a scripted gateway.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use steward_core::cancel::CancelToken;
use steward_core::config::LlmProviderConfig;
use steward_core::{ChangeRequest, RiskLevel, TaskStatus, WorkType};
use steward_llm::{
    Completion, CompletionProvider, CompletionRequest, Gateway, LlmError, TokenUsage,
};
use steward_planner::{PlanError, Planner, PlaybookCatalog, PlaybookEntry};

/// Provider that answers chat completions with a fixed document and
/// embeds texts by keyword overlap, so similarity is deterministic.
struct FixtureProvider {
    plan_json: String,
}

#[async_trait]
impl CompletionProvider for FixtureProvider {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
        _cancel: &CancelToken,
    ) -> Result<Completion, LlmError> {
        Ok(Completion {
            content: self.plan_json.clone(),
            model: "fixture".into(),
            provider: "fixture".into(),
            usage: TokenUsage::default(),
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        // Two dimensions: "monitoring-ness" and "media-ness".
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                let monitoring = ["kuma", "monitor", "uptime", "status"]
                    .iter()
                    .filter(|k| t.contains(**k))
                    .count() as f32;
                let media = ["jellyfin", "media", "stream"]
                    .iter()
                    .filter(|k| t.contains(**k))
                    .count() as f32;
                vec![monitoring + 0.01, media + 0.01]
            })
            .collect())
    }
}

fn gateway(plan_json: &str) -> Arc<Gateway> {
    let provider: Arc<dyn CompletionProvider> = Arc::new(FixtureProvider {
        plan_json: plan_json.to_string(),
    });
    Arc::new(Gateway::new(
        vec![provider],
        &[LlmProviderConfig {
            name: "fixture".into(),
            base_url: "http://unused".into(),
            api_key_env: None,
            model: "fixture".into(),
            monthly_spend_cap_usd: None,
            usd_per_million_tokens: None,
        }],
        80.0,
        Duration::from_secs(3600),
        16,
    ))
}

fn catalog() -> PlaybookCatalog {
    PlaybookCatalog::new(vec![
        PlaybookEntry {
            name: "uptime-kuma.yml".into(),
            description: "Deploy the Uptime Kuma status monitor".into(),
            services: vec!["uptime-kuma".into()],
        },
        PlaybookEntry {
            name: "jellyfin.yml".into(),
            description: "Deploy the Jellyfin media streaming server".into(),
            services: vec!["jellyfin".into()],
        },
    ])
}

#[tokio::test]
async fn plan_maps_tasks_and_risk() {
    let plan_json = serde_json::json!({
        "summary": "Deploy Kuma monitoring",
        "complexity_level": 3,
        "estimated_duration_seconds": 300,
        "tasks": [
            {"work_type": "run_playbook", "parameters": {"playbook": "uptime-kuma.yml"},
             "max_duration_seconds": 120},
            {"work_type": "restart_service", "parameters": {"service": "caddy"}}
        ]
    })
    .to_string();
    let planner = Planner::new(gateway(&plan_json), catalog());
    let request = ChangeRequest::new("sam", "Deploy Kuma monitoring");

    let (plan, intent) = planner.plan(&request, &CancelToken::new()).await.unwrap();
    assert_eq!(plan.request_id, request.id);
    assert_eq!(plan.risk, RiskLevel::Medium);
    assert_eq!(plan.tasks.len(), 2);
    assert_eq!(plan.tasks[0].ordinal, 0);
    assert_eq!(plan.tasks[0].status, TaskStatus::Received);
    assert_eq!(
        plan.tasks[0].hints.max_duration_seconds,
        Some(120),
        "model-provided deadline must survive"
    );
    assert_eq!(intent["summary"], "Deploy Kuma monitoring");
}

#[tokio::test]
async fn deploy_service_rewrites_to_run_playbook_via_alias() {
    let plan_json = serde_json::json!({
        "summary": "Deploy Jellyfin",
        "complexity_level": 1,
        "estimated_duration_seconds": 60,
        "tasks": [
            {"work_type": "deploy_service", "parameters": {"service": "jellyfin"}}
        ]
    })
    .to_string();
    let planner = Planner::new(gateway(&plan_json), catalog());
    let request = ChangeRequest::new("sam", "Get jellyfin running");

    let (plan, _) = planner.plan(&request, &CancelToken::new()).await.unwrap();
    let task = &plan.tasks[0];
    assert_eq!(task.work_type, WorkType::RunPlaybook);
    assert_eq!(task.parameters["playbook"], "jellyfin.yml");
    assert_eq!(task.parameters["service"], "jellyfin");
}

#[tokio::test]
async fn deploy_service_resolves_semantically() {
    let plan_json = serde_json::json!({
        "summary": "Monitoring",
        "complexity_level": 2,
        "estimated_duration_seconds": 60,
        "tasks": [
            {"work_type": "deploy_service", "parameters": {"service": "status monitor"}}
        ]
    })
    .to_string();
    let planner = Planner::new(gateway(&plan_json), catalog());
    let request = ChangeRequest::new("sam", "I want a status monitor");

    let (plan, _) = planner.plan(&request, &CancelToken::new()).await.unwrap();
    assert_eq!(plan.tasks[0].parameters["playbook"], "uptime-kuma.yml");
}

#[tokio::test]
async fn unresolvable_service_fails_with_planner_reason() {
    let plan_json = serde_json::json!({
        "summary": "Mystery",
        "complexity_level": 2,
        "estimated_duration_seconds": 60,
        "tasks": [
            {"work_type": "deploy_service", "parameters": {"service": "quantum-defragmenter"}}
        ]
    })
    .to_string();
    // An empty catalog cannot resolve anything.
    let planner = Planner::new(gateway(&plan_json), PlaybookCatalog::new(vec![]));
    let request = ChangeRequest::new("sam", "deploy the quantum defragmenter");

    let err = planner.plan(&request, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, PlanError::UnresolvedService { .. }));
    assert_eq!(err.reason_code(), "planner_unresolved_service");
}

#[tokio::test]
async fn invalid_model_output_fails_validation() {
    let planner = Planner::new(gateway("{\"summary\": \"broken\"}"), catalog());
    let request = ChangeRequest::new("sam", "do something");

    let err = planner.plan(&request, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, PlanError::InvalidPlan { .. }));
    assert_eq!(err.reason_code(), "planner_invalid_plan");
}
