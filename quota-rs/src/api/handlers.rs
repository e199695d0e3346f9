//! API request handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::admission::{AdmissionCheck, AdmissionRequest, DenialReason, ReconcileOutcome, TokenUsage};
use crate::allocation::Role;
use crate::engine::{QuotaEngine, TenantUsage, UsageSummary};
use crate::error::QuotaError;

/// Shared application state
pub struct AppState {
    pub engine: Arc<QuotaEngine>,
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(msg: &str) -> Self {
        Self {
            error: msg.to_string(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn error_response(e: QuotaError) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        QuotaError::TenantNotFound(_)
        | QuotaError::ReservationNotFound(_)
        | QuotaError::TicketNotFound(_) => StatusCode::NOT_FOUND,
        QuotaError::TicketExpired(_) => StatusCode::GONE,
        QuotaError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        QuotaError::Unadmittable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        QuotaError::Config(_) | QuotaError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => {
            warn!("Internal error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ApiError::new(&e.to_string())))
}

/// Query for GET /tokens/remaining
#[derive(Debug, Deserialize)]
pub struct RemainingQuery {
    pub tenant_id: String,
    pub member_id: String,
    pub role: Role,
    #[serde(default = "default_active_members")]
    pub active_members_in_role: u32,
}

fn default_active_members() -> u32 {
    1
}

/// Body for POST /tokens/reservations/:id/reconcile
///
/// Either `actual_tokens` or the `input_tokens`/`output_tokens` split;
/// when both are sent the total must match.
#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    pub actual_tokens: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl ReconcileRequest {
    fn split(&self) -> Option<TokenUsage> {
        if self.input_tokens.is_none() && self.output_tokens.is_none() {
            return None;
        }
        Some(TokenUsage::new(
            self.input_tokens.unwrap_or(0),
            self.output_tokens.unwrap_or(0),
        ))
    }
}

/// Body for POST /tokens/queue
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(flatten)]
    pub request: AdmissionRequest,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Queue ticket status
#[derive(Debug, Serialize, Deserialize)]
pub struct TicketResponse {
    pub ticket_id: Uuid,
    pub position: usize,
    pub estimated_wait_secs: u64,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub tenants: usize,
    pub timestamp: String,
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tenants = state.engine.ledger().tenant_ids().await.len();
    Json(HealthResponse {
        status: "healthy".to_string(),
        tenants,
        timestamp: state.engine.clock().now().to_rfc3339(),
    })
}

/// GET /tokens/remaining - Remaining budget for a member
pub async fn remaining(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RemainingQuery>,
) -> ApiResult<UsageSummary> {
    state
        .engine
        .remaining(
            &query.tenant_id,
            &query.member_id,
            query.role,
            query.active_members_in_role,
        )
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /tokens/validate - Dry-run admission
pub async fn validate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AdmissionRequest>,
) -> Json<AdmissionCheck> {
    Json(state.engine.validate(&request).await)
}

/// POST /tokens/reservations - Reserve tokens
pub async fn reserve(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AdmissionRequest>,
) -> Response {
    match state.engine.reserve_with_retry(&request).await {
        Ok(reservation) => (StatusCode::CREATED, Json(reservation)).into_response(),
        Err(denied) => {
            let status = match denied.reason {
                DenialReason::ConcurrentReservationLost => StatusCode::CONFLICT,
                DenialReason::UnknownTenant => StatusCode::NOT_FOUND,
                _ => StatusCode::TOO_MANY_REQUESTS,
            };
            (status, Json(denied)).into_response()
        }
    }
}

/// POST /tokens/reservations/:id/reconcile - Record actual usage
pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    Path(reservation_id): Path<Uuid>,
    Json(body): Json<ReconcileRequest>,
) -> ApiResult<ReconcileOutcome> {
    let engine = &state.engine;
    let result = match (body.split(), body.actual_tokens) {
        (Some(usage), None) => engine.reconcile_usage(reservation_id, usage).await,
        (Some(usage), Some(actual)) if usage.total() == actual => {
            engine.reconcile_usage(reservation_id, usage).await
        }
        (None, Some(actual)) => engine.reconcile(reservation_id, actual).await,
        (Some(_), Some(_)) => Err(QuotaError::InvalidRequest(
            "actual_tokens does not match input_tokens + output_tokens".into(),
        )),
        (None, None) => Err(QuotaError::InvalidRequest(
            "actual_tokens or input_tokens/output_tokens required".into(),
        )),
    };
    result.map(Json).map_err(error_response)
}

/// GET /tokens/tenants/:tenant_id/usage - Pool and today's member usage
pub async fn tenant_usage(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<TenantUsage> {
    state
        .engine
        .tenant_usage(&tenant_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn ticket_status(engine: &QuotaEngine, ticket_id: Uuid) -> Result<TicketResponse, QuotaError> {
    let position = engine.queue_position(ticket_id).await?;
    let wait = engine.estimate_wait(ticket_id).await?;
    Ok(TicketResponse {
        ticket_id,
        position,
        estimated_wait_secs: wait.as_secs(),
    })
}

/// POST /tokens/queue - Queue a request until budget frees up
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<TicketResponse>), (StatusCode, Json<ApiError>)> {
    let ticket_id = state
        .engine
        .enqueue_overflow(&body.request, body.payload)
        .await
        .map_err(error_response)?;
    let status = ticket_status(&state.engine, ticket_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

/// GET /tokens/queue/:ticket_id - Position and estimated wait
pub async fn queue_status(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<Uuid>,
) -> ApiResult<TicketResponse> {
    ticket_status(&state.engine, ticket_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// DELETE /tokens/queue/:ticket_id - Withdraw a queued request
pub async fn cancel_ticket(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .engine
        .remove_ticket(ticket_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}
