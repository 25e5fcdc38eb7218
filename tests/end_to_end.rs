// SPDX-License-Identifier: MIT OR Apache-2.0
//! Whole-orchestrator flows over in-memory infrastructure: a scripted
//! LLM, the memory bus, the memory store, and a simulated agent.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use steward_audit::AuditLog;
use steward_bus::{MemoryBus, MessageBus, Topology};
use steward_core::cancel::CancelToken;
use steward_core::config::{LlmProviderConfig, OrchestratorConfig};
use steward_core::{RequestState, ResourcesUsed, TaskStatus};
use steward_events::{EventKey, EventKind, SubscriberId};
use steward_llm::{
    Completion, CompletionProvider, CompletionRequest, Gateway, LlmError, TokenUsage,
};
use steward_planner::{PlaybookCatalog, PlaybookEntry};
use steward_proto::{
    Envelope, MessageBody, StepReport, WorkResult, WorkResultKind, WorkStatus, WorkStatusKind,
};
use steward_registry::HeartbeatMetrics;
use steward_service::OrchestratorService;
use steward_store::{MemoryStore, StateStore};

struct ScriptedPlanner {
    plan_json: String,
}

#[async_trait]
impl CompletionProvider for ScriptedPlanner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
        _cancel: &CancelToken,
    ) -> Result<Completion, LlmError> {
        Ok(Completion {
            content: self.plan_json.clone(),
            model: "scripted".into(),
            provider: "scripted".into(),
            usage: TokenUsage::default(),
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|_| vec![1.0]).collect())
    }
}

fn scripted_gateway(plan_json: serde_json::Value) -> Arc<Gateway> {
    let provider: Arc<dyn CompletionProvider> = Arc::new(ScriptedPlanner {
        plan_json: plan_json.to_string(),
    });
    Arc::new(Gateway::new(
        vec![provider],
        &[LlmProviderConfig {
            name: "scripted".into(),
            base_url: "http://unused".into(),
            api_key_env: None,
            model: "scripted".into(),
            monthly_spend_cap_usd: None,
            usd_per_million_tokens: None,
        }],
        80.0,
        Duration::from_secs(3600),
        16,
    ))
}

fn catalog() -> PlaybookCatalog {
    PlaybookCatalog::new(vec![PlaybookEntry {
        name: "uptime-kuma.yml".into(),
        description: "Deploy Uptime Kuma monitoring".into(),
        services: vec!["uptime-kuma".into()],
    }])
}

fn kuma_plan() -> serde_json::Value {
    serde_json::json!({
        "summary": "Deploy Kuma monitoring",
        "complexity_level": 2,
        "estimated_duration_seconds": 300,
        "tasks": [
            {"work_type": "run_playbook",
             "parameters": {"playbook": "uptime-kuma.yml", "service": "uptime-kuma", "step": "pull_image"}},
            {"work_type": "run_playbook",
             "parameters": {"playbook": "uptime-kuma.yml", "service": "uptime-kuma", "step": "render_config"}},
            {"work_type": "run_playbook",
             "parameters": {"playbook": "uptime-kuma.yml", "service": "uptime-kuma", "step": "start_service"}}
        ]
    })
}

/// Simulated worker: consumes its queue, reports one step, succeeds.
fn spawn_agent(bus: Arc<MemoryBus>, agent_id: String, token: String) {
    tokio::spawn(async move {
        let mut sub = bus.subscribe(&Topology::agent_queue("ansible")).await.unwrap();
        while let Some(delivery) = sub.recv().await {
            let envelope = delivery.envelope.clone();
            let _ = delivery.ack().await;
            let MessageBody::WorkRequest(request) = &envelope.body else {
                continue;
            };
            let step_name = request
                .parameters
                .get("step")
                .and_then(|v| v.as_str())
                .unwrap_or("apply")
                .to_string();

            let status = Envelope::to_orchestrator(
                "ansible",
                envelope.request_id,
                MessageBody::WorkStatus(WorkStatus {
                    task_id: request.task_id,
                    status: WorkStatusKind::StepCompleted,
                    progress_percent: Some(100.0),
                    step: Some(StepReport {
                        number: 1,
                        name: step_name,
                        output: Some("ok".into()),
                        output_chunk: None,
                        duration_ms: Some(25),
                    }),
                }),
            )
            .with_identity(&agent_id, &token);
            bus.publish(Topology::STATUS, &status).await.unwrap();

            let result = Envelope::to_orchestrator(
                "ansible",
                envelope.request_id,
                MessageBody::WorkResult(WorkResult {
                    task_id: request.task_id,
                    status: WorkResultKind::Success,
                    exit_code: 0,
                    output: "changed=1".into(),
                    resources_used: ResourcesUsed {
                        duration_seconds: 0.5,
                        gpu_vram_mb: None,
                        cpu_time_ms: Some(40),
                    },
                }),
            )
            .with_identity(&agent_id, &token);
            bus.publish(Topology::RESULTS, &result).await.unwrap();
        }
    });
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn happy_path_deploys_and_audits() {
    let tempdir = tempfile::tempdir().unwrap();
    let audit_root = tempdir.path().join(".audit/tasks");
    let store = MemoryStore::new();
    let bus = Arc::new(MemoryBus::new());
    let mut config = OrchestratorConfig::default();
    config.pause_resume_interval_seconds = 1;

    let service = OrchestratorService::start(
        Arc::new(store.clone()),
        bus.clone(),
        scripted_gateway(kuma_plan()),
        catalog(),
        AuditLog::new(&audit_root),
        config,
    )
    .await
    .unwrap();

    let token = service
        .register_agent("ansible-1", "ansible", vec!["run_playbook".into()], 4)
        .await
        .unwrap();
    spawn_agent(bus.clone(), "ansible-1".into(), token);

    let request_id = service.submit("Deploy Kuma monitoring", "sam").await.unwrap();
    wait_for("planning to finish", || async {
        store.get_request(request_id).await.unwrap().state == RequestState::PendingApproval
    })
    .await;

    let plans = service.request_history(request_id).await.unwrap();
    assert_eq!(plans.len(), 1);
    let plan = &plans[0];
    assert_eq!(plan.tasks.len(), 3);

    // Watch the request-level event stream.
    let subscriber = SubscriberId::random();
    let mut events = service.fanout().attach(subscriber.clone());
    service
        .fanout()
        .subscribe(&subscriber, EventKey::Request(request_id));

    let dispatch_started = service.approve(plan.id, "sam").await.unwrap();
    assert!(dispatch_started);

    wait_for("request to complete", || async {
        store.get_request(request_id).await.unwrap().state == RequestState::Complete
    })
    .await;

    // Every task is terminal success with its audit artifact.
    let audit = AuditLog::new(&audit_root);
    let plan = service.get_plan(plan.id).await.unwrap();
    for task in &plan.tasks {
        assert_eq!(task.status, TaskStatus::Success);
        let artifact = audit.load(task.id).unwrap().expect("artifact exists");
        assert_eq!(artifact.status, TaskStatus::Success);
    }
    assert_eq!(audit.commits().unwrap().len(), 3);
    assert!(audit.verify_chain().unwrap().is_valid);

    // plan_approved first, exactly one terminal rollup event.
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.event_type);
    }
    assert_eq!(kinds.first(), Some(&EventKind::PlanApproved));
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::ExecutionDone)
            .count(),
        1
    );

    // Approving the same plan twice is a conflict, state unchanged.
    let err = service.approve(plan.id, "sam").await.unwrap_err();
    let view = steward_service::FailureView::from_error(&err);
    assert_eq!(view.code, "plan_already_decided");

    service.shutdown().await;
}

#[tokio::test]
async fn capacity_pressure_pauses_then_resumes() {
    let tempdir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let bus = Arc::new(MemoryBus::new());
    let mut config = OrchestratorConfig::default();
    config.pause_resume_interval_seconds = 1;

    let single_task_plan = serde_json::json!({
        "summary": "Deploy Kuma",
        "complexity_level": 1,
        "estimated_duration_seconds": 60,
        "tasks": [
            {"work_type": "run_playbook",
             "parameters": {"playbook": "uptime-kuma.yml", "service": "uptime-kuma"}}
        ]
    });
    let service = OrchestratorService::start(
        Arc::new(store.clone()),
        bus.clone(),
        scripted_gateway(single_task_plan),
        catalog(),
        AuditLog::new(tempdir.path().join(".audit/tasks")),
        config,
    )
    .await
    .unwrap();

    let token = service
        .register_agent("ansible-1", "ansible", vec!["run_playbook".into()], 4)
        .await
        .unwrap();
    // The agent reports 10% free against the 20% threshold.
    service
        .agent_heartbeat(
            "ansible-1",
            HeartbeatMetrics {
                free_capacity_percent: 10.0,
                active_tasks: 3,
            },
        )
        .unwrap();
    spawn_agent(bus.clone(), "ansible-1".into(), token);

    let request_id = service.submit("Deploy Kuma", "sam").await.unwrap();
    wait_for("planning to finish", || async {
        store.get_request(request_id).await.unwrap().state == RequestState::PendingApproval
    })
    .await;
    let plan = service.request_history(request_id).await.unwrap()[0].clone();
    let task_id = plan.tasks[0].id;

    let subscriber = SubscriberId::random();
    let mut events = service.fanout().attach(subscriber.clone());
    service
        .fanout()
        .subscribe(&subscriber, EventKey::Execution(task_id));

    let dispatch_started = service.approve(plan.id, "sam").await.unwrap();
    assert!(!dispatch_started, "task should park, not dispatch");

    let paused = store.get_task(task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    let entries = store.list_paused(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_id, task_id);
    // The captured dispatch payload round-trips through the codec.
    let bytes = serde_json::to_vec(&entries[0].payload).unwrap();
    let envelope = steward_proto::Codec::decode(&bytes).unwrap();
    assert!(matches!(envelope.body, MessageBody::WorkRequest(_)));

    // Capacity recovers; the resume tick picks the task up.
    service
        .agent_heartbeat(
            "ansible-1",
            HeartbeatMetrics {
                free_capacity_percent: 50.0,
                active_tasks: 1,
            },
        )
        .unwrap();

    wait_for("task to finish after resume", || async {
        store.get_task(task_id).await.unwrap().status == TaskStatus::Success
    })
    .await;
    assert!(store.list_paused(10).await.unwrap().is_empty());

    // paused precedes resumed in the event stream.
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.event_type);
    }
    let paused_at = kinds.iter().position(|k| *k == EventKind::Paused);
    let resumed_at = kinds.iter().position(|k| *k == EventKind::Resumed);
    assert!(paused_at.is_some(), "saw {kinds:?}");
    assert!(resumed_at.is_some(), "saw {kinds:?}");
    assert!(paused_at < resumed_at);

    service.shutdown().await;
}
