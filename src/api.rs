//! HTTP boundary. Validates nothing itself beyond JSON shape; the engine owns
//! field validation and every business outcome.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::engine::{FieldError, ReservationEngine, ReservationError};
use crate::model::{ClaimOutcome, ClaimRequest, Reservation, now_ms, to_utc};
use crate::observability::ErrorReason;

/// Latency label for `POST /reservations`.
pub const ROUTE_RESERVE: &str = "scheduling_reserve";
pub const ROUTE_LIST_RESERVATIONS: &str = "reservations_list";
pub const ROUTE_SLOT_HOLD: &str = "slot_hold";

pub const CONFLICT_REASON: &str = "slot_conflict";
pub const ESCALATE_TO_HUMAN: &str = "escalate_to_human";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReservationEngine>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/reservations", post(reserve))
        .route("/reservations/{slot_id}", get(list_reservations))
        .route("/slots/{slot_id}/hold", get(slot_hold))
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

// ── Wire types ───────────────────────────────────────────

/// Fields are optional so a missing one becomes a field error, not a
/// deserialization failure.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    #[serde(default)]
    pub slot_id: Option<String>,
    #[serde(default)]
    pub candidate_id: Option<String>,
    #[serde(default)]
    pub alternatives: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservedResponse {
    pub success: bool,
    pub reservation_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub success: bool,
    pub reason: String,
    pub conflicted_with: String,
    pub alternatives: Vec<String>,
    pub suggested_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationView {
    pub reservation_id: String,
    pub candidate_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// False once expired; the row stays until reconciliation removes it.
    pub live: bool,
}

impl ReservationView {
    fn from_row(row: &Reservation, now: i64) -> Self {
        Self {
            reservation_id: row.reservation_id(),
            candidate_id: row.key.candidate_id.clone(),
            created_at: to_utc(row.created_at),
            expires_at: to_utc(row.expires_at),
            live: row.is_live(now),
        }
    }
}

fn outcome_response(outcome: ClaimOutcome) -> Response {
    match outcome {
        ClaimOutcome::Reserved(r) => Json(ReservedResponse {
            success: true,
            reservation_id: r.reservation_id(),
            expires_at: to_utc(r.expires_at),
        })
        .into_response(),
        // Always escalate: an empty list must not read as "no options, done".
        ClaimOutcome::Conflict(c) => Json(ConflictResponse {
            success: false,
            reason: CONFLICT_REASON.to_string(),
            conflicted_with: c.holder,
            alternatives: c.alternatives,
            suggested_action: ESCALATE_TO_HUMAN.to_string(),
        })
        .into_response(),
    }
}

impl IntoResponse for ReservationError {
    fn into_response(self) -> Response {
        match self {
            ReservationError::Invalid(errors) => {
                tracing::info!("rejected claim: {}", ReservationError::Invalid(errors.clone()));
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Invalid payload", "details": errors })),
                )
                    .into_response()
            }
            ReservationError::OutcomeUnknown { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({
                    "error": "Reservation outcome unknown",
                    "details": "Retry the identical request",
                    "retryable": true,
                })),
            )
                .into_response(),
            // Store and ledger detail was logged by the engine; never echo it.
            ReservationError::Store(_) | ReservationError::Ledger(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Internal server error",
                    "details": "Reservation system unavailable",
                })),
            )
                .into_response(),
        }
    }
}

// ── Handlers ─────────────────────────────────────────────

async fn reserve(State(state): State<AppState>, payload: Result<Json<ReserveRequest>, JsonRejection>) -> Response {
    let started = Instant::now();
    let response = match payload {
        Ok(Json(body)) => {
            let req = ClaimRequest {
                slot_id: body.slot_id.unwrap_or_default(),
                candidate_id: body.candidate_id.unwrap_or_default(),
                ttl_secs: state.engine.config().hold_ttl_secs,
                alternatives: body.alternatives.unwrap_or_default(),
            };
            match state.engine.claim(req).await {
                Ok(outcome) => outcome_response(outcome),
                Err(e) => e.into_response(),
            }
        }
        Err(rejection) => {
            state.engine.metrics().reservation_error(ErrorReason::InvalidPayload);
            ReservationError::Invalid(vec![FieldError::new("body", rejection.body_text())]).into_response()
        }
    };
    state
        .engine
        .metrics()
        .request_completed(ROUTE_RESERVE, response.status().as_u16(), started.elapsed());
    response
}

async fn list_reservations(State(state): State<AppState>, Path(slot_id): Path<String>) -> Response {
    let started = Instant::now();
    let now = now_ms();
    let reservations: Vec<ReservationView> = state
        .engine
        .reservations_for_slot(&slot_id)
        .iter()
        .map(|row| ReservationView::from_row(row, now))
        .collect();
    let response = Json(json!({ "slotId": slot_id, "reservations": reservations })).into_response();
    state
        .engine
        .metrics()
        .request_completed(ROUTE_LIST_RESERVATIONS, response.status().as_u16(), started.elapsed());
    response
}

async fn slot_hold(State(state): State<AppState>, Path(slot_id): Path<String>) -> Response {
    let started = Instant::now();
    let response = match state.engine.current_holder(&slot_id).await {
        Ok(holder) => Json(json!({ "slotId": slot_id, "holder": holder })).into_response(),
        Err(e) => {
            tracing::error!(%slot_id, "hold lookup failed: {e}");
            e.into_response()
        }
    };
    state
        .engine
        .metrics()
        .request_completed(ROUTE_SLOT_HOLD, response.status().as_u16(), started.elapsed());
    response
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "ledgerRows": state.engine.ledger().len() }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
