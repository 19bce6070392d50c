use axum::{
    routing::{get, post},
    Router,
};

use crate::{billing, sessions};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/sessions", post(sessions::sessions_create))
        .route("/api/sessions/:id", get(sessions::sessions_get))
        .route(
            "/api/sessions/:id/activity",
            post(sessions::sessions_record_activity),
        )
        .route("/api/sessions/:id/end", post(sessions::sessions_end))
        .route("/api/sessions/:id/cancel", post(sessions::sessions_cancel))
        .route("/api/sessions/:id/estimate", get(sessions::sessions_estimate))
        .route(
            "/api/wallets/:owner_id",
            get(billing::billing_get_wallet_balance),
        )
        .route(
            "/api/billing/reconcile",
            post(billing::billing_queue_reconciliation),
        )
        .route(
            "/api/billing/reconcile/:id",
            post(billing::billing_reconcile_session),
        )
}
