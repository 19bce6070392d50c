use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::finalization::FinalizeOutcome;
use super::models::WalletBalance;
use super::reconciliation::ReconciliationJob;
use crate::error::{AppError, AppResult};
use crate::sessions::SessionView;
use crate::state::AppState;

/// key: billing-api -> wallet and reconciliation endpoints
pub async fn get_wallet_balance(
    Extension(state): Extension<AppState>,
    Path(owner_id): Path<i32>,
) -> AppResult<Json<WalletBalance>> {
    let balance = state.ledger.balance(owner_id).await?;
    Ok(Json(WalletBalance::new(owner_id, balance)))
}

pub async fn reconcile_session(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<ReconcileResponse>> {
    let outcome = state.coordinator.reconcile(session_id, Utc::now()).await?;
    let session = state
        .sessions
        .get(session_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(ReconcileResponse {
        outcome,
        session: session.view(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileQuery {
    pub session_id: Option<Uuid>,
}

/// Queues reconciliation of one session when `session_id` is given, otherwise
/// of every unpaid session.
pub async fn queue_reconciliation(
    Extension(state): Extension<AppState>,
    Query(query): Query<ReconcileQuery>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let job = match query.session_id {
        Some(session_id) => {
            state
                .sessions
                .get(session_id)
                .await?
                .ok_or(AppError::NotFound)?;
            ReconciliationJob::Session { session_id }
        }
        None => ReconciliationJob::AllUnpaid,
    };
    state
        .reconciliation
        .dispatch(job)
        .await
        .map_err(|err| AppError::Storage(err.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))))
}

#[derive(Debug, serde::Serialize)]
pub struct ReconcileResponse {
    pub outcome: FinalizeOutcome,
    pub session: SessionView,
}
