//! Route Definitions

use super::handlers::*;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Accounts
        .route("/users/:id/balance", get(balance_handler))
        .route("/users/:id/client-seed", put(client_seed_handler))
        .route("/users/:id/wagers", get(history_handler))
        .route("/users/:id/levels/claim", post(claim_levels_handler))
        .route("/users/:id/daily", post(daily_handler))
        // One-shot games
        .route("/wagers", post(wager_handler))
        // Multi-step games
        .route("/sessions", post(open_session_handler))
        .route("/sessions/:id", get(get_session_handler))
        .route("/sessions/:id/step", post(step_session_handler))
        .route("/sessions/:id/close", post(close_session_handler))
        // Provably fair
        .route("/fairness/active", get(active_period_handler))
        .route("/fairness/periods", get(periods_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
