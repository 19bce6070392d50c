use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use uuid::Uuid;

use super::models::{NewSession, SessionView, TerminationReceipt};
use crate::billing::CostEstimate;
use crate::error::AppResult;
use crate::state::AppState;

/// key: sessions-api -> lifecycle endpoints
pub async fn create_session(
    Extension(state): Extension<AppState>,
    Json(payload): Json<NewSession>,
) -> AppResult<(StatusCode, Json<SessionView>)> {
    let session = state.machine.create(payload, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(session.view())))
}

pub async fn get_session(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<SessionView>> {
    let session = state.machine.get(session_id).await?;
    Ok(Json(session.view()))
}

pub async fn record_activity(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<SessionView>> {
    let session = state.machine.record_activity(session_id, Utc::now()).await?;
    Ok(Json(session.view()))
}

pub async fn end_session(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<TerminationReceipt>> {
    let receipt = state.machine.end(session_id, Utc::now()).await?;
    Ok(Json(receipt))
}

pub async fn cancel_session(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<TerminationReceipt>> {
    let receipt = state.machine.cancel(session_id, Utc::now()).await?;
    Ok(Json(receipt))
}

pub async fn estimate_session(
    Extension(state): Extension<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<CostEstimate>> {
    let estimate = state.machine.estimate(session_id, Utc::now()).await?;
    Ok(Json(estimate))
}
