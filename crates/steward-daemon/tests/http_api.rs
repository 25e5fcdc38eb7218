// SPDX-License-Identifier: MIT OR Apache-2.0
//! Router behaviour over in-memory infrastructure.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use steward_audit::AuditLog;
use steward_bus::MemoryBus;
use steward_core::config::OrchestratorConfig;
use steward_daemon::build_app;
use steward_llm::Gateway;
use steward_planner::PlaybookCatalog;
use steward_service::OrchestratorService;
use steward_store::{MemoryStore, StateStore};
use tower::ServiceExt;
use uuid::Uuid;

async fn test_app() -> (axum::Router, tempfile::TempDir) {
    let tempdir = tempfile::tempdir().unwrap();
    let service = OrchestratorService::start(
        Arc::new(MemoryStore::new()) as Arc<dyn StateStore>,
        Arc::new(MemoryBus::new()),
        Arc::new(Gateway::new(
            vec![],
            &[],
            80.0,
            Duration::from_secs(60),
            8,
        )),
        PlaybookCatalog::new(vec![]),
        AuditLog::new(tempdir.path().join(".audit/tasks")),
        OrchestratorConfig::default(),
    )
    .await
    .unwrap();
    (build_app(Arc::new(service)), tempdir)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_snapshot() {
    let (app, _dir) = test_app().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["paused_tasks"], 0);
    assert!(json["agents"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn submit_returns_request_id() {
    let (app, _dir) = test_app().await;
    let response = app
        .oneshot(
            Request::post("/requests")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"text": "deploy kuma", "user": "sam"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(Uuid::parse_str(json["request_id"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn unknown_plan_is_404_with_failure_view() {
    let (app, _dir) = test_app().await;
    let response = app
        .oneshot(
            Request::get(format!("/plans/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "not_found");
}

#[tokio::test]
async fn audit_query_validates_status() {
    let (app, _dir) = test_app().await;
    let response = app
        .clone()
        .oneshot(
            Request::get("/audit/tasks?status=definitely_not_a_status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::get("/audit/tasks?status=success&limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 0);
}

#[tokio::test]
async fn agent_registration_issues_token() {
    let (app, _dir) = test_app().await;
    let response = app
        .clone()
        .oneshot(
            Request::post("/agents")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "id": "ansible-1",
                        "agent_type": "ansible",
                        "capabilities": ["run_playbook"],
                        "declared_capacity": 4
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(!json["token"].as_str().unwrap().is_empty());

    let response = app
        .oneshot(
            Request::post("/agents/ansible-1/heartbeat")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"free_capacity_percent": 55.0, "active_tasks": 1})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
