//! API Error Handling
//!
//! Structured error responses with HTTP status codes and request tracking.
//! Engine errors map onto a stable `code` string the chat front end switches on.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::CasinoError;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// INSUFFICIENT_FUNDS, SESSION_ALREADY_ACTIVE, NOT_FOUND, ...
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    NotFound(String),
    BadRequest(String),
    /// Request conflicts with current state; carries the engine error code
    Conflict {
        code: &'static str,
        message: String,
        details: Option<serde_json::Value>,
    },
    InternalError(String),
    ServiceUnavailable {
        message: String,
        details: Option<serde_json::Value>,
    },
}

impl ApiError {
    pub fn not_found(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message),
            request_id,
        }
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    pub fn internal_error(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::InternalError(message),
            request_id,
        }
    }

    fn conflict(request_id: String, code: &'static str, err: &CasinoError) -> Self {
        Self {
            kind: ApiErrorKind::Conflict {
                code,
                message: err.to_string(),
                details: None,
            },
            request_id,
        }
    }

    /// Map an engine error onto an HTTP error
    pub fn from_casino(request_id: &str, err: CasinoError) -> Self {
        let request_id = request_id.to_string();
        match &err {
            CasinoError::InvalidStake(_)
            | CasinoError::InvalidParams(_)
            | CasinoError::InvalidAction(_)
            | CasinoError::TileAlreadyRevealed(_) => ApiError::bad_request(request_id, err.to_string()),
            CasinoError::SessionNotFound(_) | CasinoError::PeriodNotFound(_) => {
                ApiError::not_found(request_id, err.to_string())
            }
            CasinoError::InsufficientFunds { needed, available } => Self {
                kind: ApiErrorKind::Conflict {
                    code: "INSUFFICIENT_FUNDS",
                    message: err.to_string(),
                    details: Some(serde_json::json!({
                        "needed": needed.as_f64(),
                        "available": available.as_f64(),
                    })),
                },
                request_id,
            },
            CasinoError::SessionAlreadyActive { .. } => {
                ApiError::conflict(request_id, "SESSION_ALREADY_ACTIVE", &err)
            }
            CasinoError::SessionNotActive(_) => ApiError::conflict(request_id, "SESSION_NOT_ACTIVE", &err),
            CasinoError::ActionInProgress => ApiError::conflict(request_id, "ACTION_IN_PROGRESS", &err),
            CasinoError::PeriodClosed(_) => ApiError::conflict(request_id, "PERIOD_CLOSED", &err),
            CasinoError::DailyCooldown { next_claim } => Self {
                kind: ApiErrorKind::Conflict {
                    code: "DAILY_COOLDOWN",
                    message: err.to_string(),
                    details: Some(serde_json::json!({ "next_claim_at": next_claim })),
                },
                request_id,
            },
            CasinoError::EarlyReveal { .. } => ApiError::conflict(request_id, "EARLY_REVEAL", &err),
            CasinoError::DuplicatePeriod(_) => ApiError::conflict(request_id, "DUPLICATE_PERIOD", &err),
            CasinoError::DuplicateDeposit(_) => ApiError::conflict(request_id, "DUPLICATE_DEPOSIT", &err),
            CasinoError::AwaitingConfirmations { .. } => {
                ApiError::conflict(request_id, "AWAITING_CONFIRMATIONS", &err)
            }
            CasinoError::SettlementInfraFailure { refunded, .. } => {
                tracing::error!(request_id = %request_id, "Settlement failure: {}", err);
                Self {
                    kind: ApiErrorKind::ServiceUnavailable {
                        message: "Settlement could not be completed".to_string(),
                        details: Some(serde_json::json!({ "refunded": refunded })),
                    },
                    request_id,
                }
            }
            CasinoError::Gateway(_) => Self {
                kind: ApiErrorKind::ServiceUnavailable {
                    message: err.to_string(),
                    details: None,
                },
                request_id,
            },
            CasinoError::PayTableGap(_) | CasinoError::Storage(_) | CasinoError::Configuration(_) => {
                tracing::error!(request_id = %request_id, "Internal error: {}", err);
                ApiError::internal_error(request_id, "Internal error".to_string())
            }
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::NotFound(msg) => write!(f, "[{}] Not Found: {}", self.request_id, msg),
            ApiErrorKind::BadRequest(msg) => write!(f, "[{}] Bad Request: {}", self.request_id, msg),
            ApiErrorKind::Conflict { code, message, .. } => {
                write!(f, "[{}] {}: {}", self.request_id, code, message)
            }
            ApiErrorKind::InternalError(msg) => write!(f, "[{}] Internal Error: {}", self.request_id, msg),
            ApiErrorKind::ServiceUnavailable { message, .. } => {
                write!(f, "[{}] Service Unavailable: {}", self.request_id, message)
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self.kind {
            ApiErrorKind::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
            ApiErrorKind::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None),
            ApiErrorKind::Conflict {
                code,
                message,
                details,
            } => (StatusCode::CONFLICT, code, message, details),
            ApiErrorKind::InternalError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg, None)
            }
            ApiErrorKind::ServiceUnavailable { message, details } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                message,
                details,
            ),
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id,
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        });

        (status, body).into_response()
    }
}
