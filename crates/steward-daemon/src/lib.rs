// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-daemon
#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use steward_core::TaskStatus;
use steward_registry::HeartbeatMetrics;
use steward_service::{FailureView, OrchestratorService, ServiceError};
use steward_store::TaskFilter;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

/// Shared handler state.
pub type AppState = Arc<OrchestratorService>;

/// Build the HTTP router over an assembled orchestrator.
pub fn build_app(service: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/requests", post(submit))
        .route("/requests/{id}", get(get_request))
        .route("/requests/{id}/plans", get(request_history))
        .route("/requests/{id}/cancel", post(cancel_request))
        .route("/plans/{id}", get(get_plan))
        .route("/plans/{id}/approve", post(approve))
        .route("/plans/{id}/reject", post(reject))
        .route("/plans/{id}/modify", post(modify))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/audit/tasks", get(query_audit))
        .route("/agents", post(register_agent))
        .route("/agents/{id}/heartbeat", post(agent_heartbeat))
        .route("/agents/{id}", delete(forget_agent))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// API error: a [`FailureView`] with an HTTP status.
pub struct ApiError {
    status: StatusCode,
    view: FailureView,
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        let view = FailureView::from_error(&error);
        let status = match view.code.as_str() {
            "not_found" => StatusCode::NOT_FOUND,
            "plan_already_decided" | "status_conflict" | "task_terminal" => StatusCode::CONFLICT,
            code if code.starts_with("planner_") => StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_state" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, view }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.view)).into_response()
    }
}

// -- Request/response bodies -------------------------------------------------

#[derive(Deserialize)]
struct SubmitBody {
    text: String,
    user: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    request_id: Uuid,
}

#[derive(Deserialize)]
struct DecisionBody {
    approver: String,
}

#[derive(Serialize)]
struct ApproveResponse {
    dispatch_started: bool,
}

#[derive(Deserialize)]
struct ModifyBody {
    request_text: String,
}

#[derive(Serialize)]
struct ModifyResponse {
    plan_id: Uuid,
}

#[derive(Deserialize)]
struct RegisterBody {
    id: String,
    agent_type: String,
    #[serde(default)]
    capabilities: Vec<String>,
    declared_capacity: u32,
}

#[derive(Serialize)]
struct RegisterResponse {
    token: String,
}

#[derive(Deserialize)]
struct AuditQuery {
    status: Option<String>,
    service: Option<String>,
    agent_id: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Serialize)]
struct AuditPage {
    items: Vec<steward_core::Task>,
    total: u64,
    offset: usize,
    limit: usize,
}

// -- Handlers ----------------------------------------------------------------

async fn health(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.snapshot().await)
}

async fn submit(
    State(service): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let request_id = service.submit(body.text, body.user).await?;
    Ok(Json(SubmitResponse { request_id }))
}

async fn get_request(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<steward_core::ChangeRequest>, ApiError> {
    Ok(Json(service.get_request(id).await?))
}

async fn request_history(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<steward_core::Plan>>, ApiError> {
    Ok(Json(service.request_history(id).await?))
}

async fn get_plan(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<steward_core::Plan>, ApiError> {
    Ok(Json(service.get_plan(id).await?))
}

async fn approve(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<ApproveResponse>, ApiError> {
    let dispatch_started = service.approve(id, body.approver).await?;
    Ok(Json(ApproveResponse { dispatch_started }))
}

async fn reject(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> Result<StatusCode, ApiError> {
    service.reject(id, body.approver).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn modify(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ModifyBody>,
) -> Result<Json<ModifyResponse>, ApiError> {
    let plan_id = service.modify(id, body.request_text).await?;
    Ok(Json(ModifyResponse { plan_id }))
}

async fn cancel_task(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    service.cancel_task(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_request(
    State(service): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    service.cancel_request(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn query_audit(
    State(service): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditPage>, ApiError> {
    let status = match &query.status {
        Some(text) => Some(parse_status(text)?),
        None => None,
    };
    let filter = TaskFilter {
        status,
        service: query.service,
        agent_id: query.agent_id,
        since: query.since,
        until: query.until,
        limit: query.limit,
        offset: query.offset,
    };
    let page = service.query_audit(&filter).await?;
    Ok(Json(AuditPage {
        items: page.items,
        total: page.total,
        offset: page.offset,
        limit: page.limit,
    }))
}

fn parse_status(text: &str) -> Result<TaskStatus, ApiError> {
    serde_json::from_value(serde_json::Value::String(text.to_string())).map_err(|_| ApiError {
        status: StatusCode::BAD_REQUEST,
        view: FailureView {
            code: "invalid_status".into(),
            message: format!("`{text}` is not a task status"),
            context: serde_json::Value::Null,
        },
    })
}

async fn register_agent(
    State(service): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let token = service
        .register_agent(
            body.id,
            body.agent_type,
            body.capabilities,
            body.declared_capacity,
        )
        .await?;
    Ok(Json(RegisterResponse { token }))
}

async fn agent_heartbeat(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Json(metrics): Json<HeartbeatMetrics>,
) -> Result<StatusCode, ApiError> {
    service.agent_heartbeat(&id, metrics)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn forget_agent(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    service.forget_agent(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
