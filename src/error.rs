use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("missing or invalid credentials")]
    Unauthenticated,

    #[error("bid rejected: {0}")]
    BidRejected(BidRejection),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Why a driver's bid was refused. Each variant maps to a stable code the
/// driver UI switches on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BidRejection {
    Duplicate,
    Unverified,
    OverCapacity {
        required_weight: f64,
        required_volume: f64,
        max_weight: f64,
        max_volume: f64,
    },
    OrderNotOpen,
    OwnOrder,
}

impl BidRejection {
    pub fn code(&self) -> &'static str {
        match self {
            BidRejection::Duplicate => "duplicate",
            BidRejection::Unverified => "unverified",
            BidRejection::OverCapacity { .. } => "over_capacity",
            BidRejection::OrderNotOpen => "order_not_open",
            BidRejection::OwnOrder => "own_order",
        }
    }
}

impl std::fmt::Display for BidRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BidRejection::Duplicate => write!(f, "you already have an active bid on this order"),
            BidRejection::Unverified => write!(f, "driver profile is not verified"),
            BidRejection::OverCapacity {
                required_weight,
                required_volume,
                max_weight,
                max_volume,
            } => write!(
                f,
                "vehicle cannot carry this cargo: requires {required_weight} t / {required_volume} m3, \
                 capacity is {max_weight} t / {max_volume} m3"
            ),
            BidRejection::OrderNotOpen => write!(f, "order is not open for bidding"),
            BidRejection::OwnOrder => write!(f, "cannot bid on your own order"),
        }
    }
}

/// Errors raised by a `DomainStore` implementation.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Duplicate(what) => AppError::InvalidState(format!("duplicate {what}")),
            StoreError::Conflict(what) => AppError::InvalidState(what),
        }
    }
}

/// Transport-level delivery failure. Recovered inside the connection
/// registry; never returned to a broadcaster.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("outbound queue is full")]
    Backpressure,

    #[error("connection is closed")]
    Closed,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::BidRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            AppError::BidRejected(rejection) => Json(json!({
                "error": rejection.to_string(),
                "reason": rejection.code(),
            })),
            other => Json(json!({
                "error": other.to_string()
            })),
        };

        (status, body).into_response()
    }
}
