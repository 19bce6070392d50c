use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::models::format_cents;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("storage fault: {0}")]
    Storage(String),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid session transition from `{from}` to `{to}`")]
    InvalidTransition { from: String, to: String },
    #[error("insufficient balance: have {current_balance} cents, need {required_minimum} cents")]
    InsufficientBalance {
        current_balance: i64,
        required_minimum: i64,
    },
}

impl AppError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        AppError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// True for faults of the record store or ledger rather than of the request.
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, AppError::Db(_) | AppError::Storage(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": "not_found" })),
            AppError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "bad_request", "detail": detail }),
            ),
            AppError::InvalidTransition { from, to } => (
                StatusCode::CONFLICT,
                json!({ "error": "invalid_transition", "from": from, "to": to }),
            ),
            AppError::InsufficientBalance {
                current_balance,
                required_minimum,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                json!({
                    "error": "insufficient_balance",
                    "current_balance": format_cents(*current_balance),
                    "current_balance_cents": current_balance,
                    "required_minimum": format_cents(*required_minimum),
                    "required_minimum_cents": required_minimum,
                }),
            ),
            AppError::Db(_) | AppError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "storage_fault" }),
            ),
        };
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
