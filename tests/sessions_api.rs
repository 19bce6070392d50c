use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use serde_json::{json, Value};
use session_billing::billing::MemoryWalletLedger;
use session_billing::routes::api_routes;
use session_billing::sessions::MemorySessionStore;
use session_billing::{AppState, BillingConfig};
use tower::ServiceExt; // for `oneshot`

async fn app_with_balance(owner_id: i32, balance_cents: i64) -> Router {
    let ledger = Arc::new(MemoryWalletLedger::new());
    ledger.open_account(owner_id, balance_cents).await;
    let state = AppState::new(
        Arc::new(MemorySessionStore::new()),
        ledger,
        BillingConfig::default(),
    );
    api_routes().layer(Extension(state))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn create_is_rejected_without_balance() {
    let app = app_with_balance(1, 0).await;

    let (status, body) = send(&app, "POST", "/api/sessions", Some(json!({ "owner_id": 1 }))).await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "insufficient_balance");
    assert_eq!(body["current_balance"], "0.00");
    assert_eq!(body["required_minimum"], "1.00");
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let app = app_with_balance(7, 10_000).await;

    let (status, created) = send(
        &app,
        "POST",
        "/api/sessions",
        Some(json!({ "owner_id": 7, "counsellor_id": 11 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "queued");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, active) = send(&app, "POST", &format!("/api/sessions/{id}/activity"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active["status"], "active");
    assert!(active["started_at"].is_string());

    let (status, estimate) = send(&app, "GET", &format!("/api/sessions/{id}/estimate"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(estimate["is_active"], true);
    assert_eq!(estimate["is_billed"], false);

    let (status, receipt) = send(&app, "POST", &format!("/api/sessions/{id}/end"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["outcome"], "applied");
    assert_eq!(receipt["billed_minutes"], 1);
    assert_eq!(receipt["billed_amount"], "1.00");
    assert_eq!(receipt["session"]["status"], "completed");
    assert_eq!(receipt["session"]["is_billed"], true);

    let (status, again) = send(&app, "POST", &format!("/api/sessions/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(again.get("outcome").is_none());
    assert_eq!(again["session"]["status"], "completed");

    let (status, wallet) = send(&app, "GET", "/api/wallets/7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(wallet["balance"], "99.00");

    let (status, view) = send(&app, "GET", &format!("/api/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["billed_amount"], "1.00");
    assert!(view["billing_processed_at"].is_string());
}

#[tokio::test]
async fn ending_a_queued_session_is_a_conflict() {
    let app = app_with_balance(3, 500).await;

    let (_, created) = send(&app, "POST", "/api/sessions", Some(json!({ "owner_id": 3 }))).await;
    let id = created["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "POST", &format!("/api/sessions/{id}/end"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
    assert_eq!(body["from"], "queued");
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let app = app_with_balance(1, 500).await;
    let (status, _) = send(
        &app,
        "GET",
        "/api/sessions/00000000-0000-0000-0000-000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reconcile_all_is_accepted() {
    let app = app_with_balance(1, 500).await;
    let (status, body) = send(&app, "POST", "/api/billing/reconcile", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
}

#[tokio::test]
async fn reconcile_single_session_is_queued() {
    let app = app_with_balance(4, 500).await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/billing/reconcile?session_id=00000000-0000-0000-0000-000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, created) = send(&app, "POST", "/api/sessions", Some(json!({ "owner_id": 4 }))).await;
    let id = created["id"].as_str().unwrap().to_string();
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/billing/reconcile?session_id={id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
}

#[tokio::test]
async fn metrics_returns_ok() {
    let (layer, handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .merge(app_with_balance(1, 500).await)
        .layer(layer);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
