use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::application::actors::department_actor::DepartmentHandle;
use crate::application::services::orchestrator::DepartmentStatus;
use crate::domain::entities::position::{Position, PositionStatus};
use crate::domain::services::position_ledger::PositionLedger;
use crate::domain::services::position_reconciliation::ReconciliationReport;
use crate::persistence::reconciliation_audit::ReconciliationRepository;

/// Shared state for the read-only HTTP surface
#[derive(Clone)]
pub struct AppState {
    pub portfolio: DepartmentHandle,
    pub ledger: Arc<PositionLedger>,
    pub audit: Option<Arc<dyn ReconciliationRepository>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: String,
}

/// Query parameters for the positions endpoint
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PositionsQuery {
    /// PENDING, OPEN, CLOSED or REJECTED
    pub status: Option<String>,
}

/// Single position in API response
#[derive(Debug, Serialize, Deserialize)]
pub struct PositionResponse {
    pub position_id: String,
    pub ticker: String,
    pub sector: Option<String>,
    pub status: String,
    pub intended_shares: i64,
    pub intended_entry_price: f64,
    pub actual_shares: Option<i64>,
    pub actual_entry_price: Option<f64>,
    pub fill_kind: Option<String>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub realized_pnl: Option<f64>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Position> for PositionResponse {
    fn from(p: &Position) -> Self {
        Self {
            position_id: p.position_id.clone(),
            ticker: p.ticker.clone(),
            sector: p.sector.clone(),
            status: p.status.as_str().to_string(),
            intended_shares: p.intended_shares.value(),
            intended_entry_price: p.intended_entry_price.value(),
            actual_shares: p.actual_shares.map(|s| s.value()),
            actual_entry_price: p.actual_entry_price.map(|v| v.value()),
            fill_kind: p.fill_kind.map(|k| k.as_str().to_string()),
            exit_price: p.exit_price.map(|v| v.value()),
            exit_reason: p.exit_reason.map(|r| r.as_str().to_string()),
            realized_pnl: p.realized_pnl.map(|v| v.value()),
            rejection_reason: p.rejection_reason.clone(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PositionsResponse {
    pub positions: Vec<PositionResponse>,
    pub total: usize,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "atrium".to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Counters and ledger summary for the Portfolio department
pub async fn get_status(State(state): State<AppState>) -> Result<Json<DepartmentStatus>, ApiError> {
    state.portfolio.status().await.map(Json).map_err(|e| {
        error!("Status request failed: {}", e);
        api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })
}

/// Positions in insertion order, optionally filtered by status
pub async fn list_positions(
    State(state): State<AppState>,
    Query(params): Query<PositionsQuery>,
) -> Result<Json<PositionsResponse>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(|s| PositionStatus::from_str(&s.to_ascii_uppercase()))
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let positions = state.ledger.positions(status).await.map_err(|e| {
        error!("Failed to list positions: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let positions: Vec<PositionResponse> = positions.iter().map(PositionResponse::from).collect();
    Ok(Json(PositionsResponse {
        total: positions.len(),
        positions,
    }))
}

/// Most recent persisted reconciliation report
pub async fn last_reconciliation(
    State(state): State<AppState>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    let Some(audit) = &state.audit else {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "Reconciliation audit is not enabled",
        ));
    };

    match audit.get_last_reconciliation().await {
        Ok(Some(report)) => Ok(Json(report)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "No reconciliation has run yet")),
        Err(e) => {
            error!("Failed to load reconciliation: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/positions", get(list_positions))
        .route("/reconciliation", get(last_reconciliation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
