//! Request Handlers
//!
//! Thin adapters from HTTP to the casino engine. All balance and game logic
//! lives in the engine; handlers only convert inputs and map errors.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::{errors::ApiError, middleware::RequestId, models::*};
use crate::{
    casino::Casino,
    common::types::{Points, UserId},
    fairness::PublicPeriod,
    sessions::StepAction,
};

/// Shared application state
pub struct AppState {
    pub casino: Arc<Casino>,
    pub version: String,
}

fn parse_session_id(request_id: &RequestId, id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id)
        .map_err(|_| ApiError::bad_request(request_id.0.clone(), format!("Invalid session id: {}", id)))
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
    })
}

/// GET /users/:id/balance
pub async fn balance_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state
        .casino
        .ledger
        .ensure_exists(&UserId::new(user))
        .await
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(BalanceResponse::from(&account)))
}

/// PUT /users/:id/client-seed
pub async fn client_seed_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    Json(body): Json<ClientSeedRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state
        .casino
        .ledger
        .set_client_seed(&UserId::new(user), &body.client_seed)
        .await
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(BalanceResponse::from(&account)))
}

/// GET /users/:id/wagers?limit={n}
pub async fn history_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    if query.limit == 0 || query.limit > 100 {
        return Err(ApiError::bad_request(
            request_id.0,
            "limit must be between 1 and 100".to_string(),
        ));
    }

    let records = state
        .casino
        .wagers
        .user_history(&UserId::new(user), query.limit)
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(HistoryResponse {
        wagers: records.iter().map(WagerView::from).collect(),
    }))
}

/// POST /users/:id/levels/claim
pub async fn claim_levels_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Json<LevelClaimResponse>, ApiError> {
    let claim = state
        .casino
        .levels
        .claim_level_rewards(&UserId::new(user))
        .await
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(claim.into()))
}

/// POST /users/:id/daily
pub async fn daily_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Json<DailyClaimResponse>, ApiError> {
    let claim = state
        .casino
        .levels
        .claim_daily(&UserId::new(user))
        .await
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(claim.into()))
}

/// POST /wagers
pub async fn wager_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<WagerRequest>,
) -> Result<Json<WagerResponse>, ApiError> {
    let (user, stake, params) = body
        .into_parts()
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;

    let settled = state
        .casino
        .settlement
        .settle(&user, stake, params)
        .await
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(settled.into()))
}

/// POST /sessions
pub async fn open_session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<OpenSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let stake =
        Points::from_f64(body.stake).map_err(|e| ApiError::from_casino(&request_id.0, e))?;

    let update = state
        .casino
        .sessions
        .open(&body.user_id, stake, body.params)
        .await
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok((StatusCode::CREATED, Json(update.into())))
}

/// POST /sessions/:id/step
pub async fn step_session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(action): Json<StepAction>,
) -> Result<Json<SessionResponse>, ApiError> {
    let id = parse_session_id(&request_id, &id)?;
    let update = state
        .casino
        .sessions
        .step(&id, action)
        .await
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(update.into()))
}

/// POST /sessions/:id/close
pub async fn close_session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<CloseSessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let id = parse_session_id(&request_id, &id)?;
    let update = state
        .casino
        .sessions
        .close(&id, body.action)
        .await
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(update.into()))
}

/// GET /sessions/:id
pub async fn get_session_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let id = parse_session_id(&request_id, &id)?;
    let session = state
        .casino
        .sessions
        .get(&id)
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(SessionView::from(&session)))
}

/// GET /fairness/active
pub async fn active_period_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<PublicPeriod>, ApiError> {
    let casino = &state.casino;
    let period = casino
        .registry
        .ensure_active_period(casino.clock.now())
        .await
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(period.public()))
}

/// GET /fairness/periods?limit={n}
pub async fn periods_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<PeriodsResponse>, ApiError> {
    let periods = state
        .casino
        .registry
        .reveal_history(query.limit.clamp(1, 100))
        .map_err(|e| ApiError::from_casino(&request_id.0, e))?;
    Ok(Json(PeriodsResponse {
        periods: periods.iter().map(|p| p.public()).collect(),
    }))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.casino.metrics.render(),
    )
}
