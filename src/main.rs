use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use session_billing::billing::{MemoryWalletLedger, PgWalletLedger, WalletLedger};
use session_billing::config::{self, BillingConfig, StoreBackend};
use session_billing::routes::api_routes;
use session_billing::sessions::{self, MemorySessionStore, PgSessionStore, SessionStore};
use session_billing::AppState;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Session Billing API"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let billing_config = BillingConfig::from_env();

    let (sessions_store, ledger): (Arc<dyn SessionStore>, Arc<dyn WalletLedger>) =
        match *config::SESSION_STORE {
            StoreBackend::Memory => {
                tracing::warn!("using in-memory session and wallet stores; state is not durable");
                (
                    Arc::new(MemorySessionStore::new()),
                    Arc::new(MemoryWalletLedger::new()),
                )
            }
            StoreBackend::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(config::DATABASE_URL.as_str())
                    .await?;

                if let Err(error) = sqlx::migrate!().run(&pool).await {
                    if *config::ALLOW_MIGRATION_FAILURE {
                        tracing::warn!(
                            ?error,
                            "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                        );
                    } else {
                        return Err(error.into());
                    }
                }

                (
                    Arc::new(PgSessionStore::new(pool.clone())),
                    Arc::new(PgWalletLedger::new(pool)),
                )
            }
        };

    let state = AppState::new(sessions_store.clone(), ledger, billing_config);
    sessions::spawn_idle_sweep(
        state.machine.clone(),
        sessions_store,
        *config::SESSION_IDLE_SWEEP_INTERVAL_SECS,
        state.config.idle_timeout,
    );

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(state));

    let addr: SocketAddr =
        format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT).parse()?;
    tracing::info!(
        %addr,
        rate_cents_per_minute = billing_config.rate_cents_per_minute,
        min_balance_cents = billing_config.min_balance_cents,
        idle_timeout_secs = billing_config.idle_timeout.num_seconds(),
        "Listening for incoming connections"
    );
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
