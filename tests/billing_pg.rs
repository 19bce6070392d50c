use std::sync::Arc;

use chrono::{Duration, Utc};
use session_billing::billing::{
    BillingOutcome, DeductOutcome, PgWalletLedger, WalletLedger,
};
use session_billing::sessions::{NewSession, PgSessionStore, SessionStatus, SessionStore};
use session_billing::{AppState, BillingConfig};
use sqlx::PgPool;
use uuid::Uuid;

// key: billing-pg-tests -> row-locked ledger, durable lease

async fn seed_wallet(pool: &PgPool, owner_id: i32, balance_cents: i64) {
    sqlx::query("INSERT INTO wallet_accounts (owner_id, balance_cents) VALUES ($1, $2)")
        .bind(owner_id)
        .bind(balance_cents)
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pg_ledger_serializes_same_owner_deductions(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_wallet(&pool, 1, 1_000).await;

    let ledger = Arc::new(PgWalletLedger::new(pool.clone()));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.deduct(1, 300, Uuid::new_v4()).await.unwrap()
        }));
    }

    let mut applied = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), DeductOutcome::Applied { .. }) {
            applied += 1;
        }
    }

    assert_eq!(applied, 3);
    assert_eq!(ledger.balance(1).await.unwrap(), 100);

    let journalled: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wallet_transactions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(journalled, 3);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pg_ledger_replay_is_not_charged(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_wallet(&pool, 2, 1_000).await;

    let ledger = PgWalletLedger::new(pool.clone());
    let reference = Uuid::new_v4();
    assert!(matches!(
        ledger.deduct(2, 400, reference).await.unwrap(),
        DeductOutcome::Applied { balance_after: 600 }
    ));
    assert_eq!(
        ledger.deduct(2, 400, reference).await.unwrap(),
        DeductOutcome::AlreadyApplied
    );
    assert_eq!(ledger.balance(2).await.unwrap(), 600);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pg_session_flow_charges_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_wallet(&pool, 3, 10_000).await;

    let sessions = Arc::new(PgSessionStore::new(pool.clone()));
    let ledger = Arc::new(PgWalletLedger::new(pool.clone()));
    let state = AppState::new(sessions.clone(), ledger.clone(), BillingConfig::default());

    let now = Utc::now();
    let session = state
        .machine
        .create(NewSession { owner_id: 3, counsellor_id: Some(4) }, now)
        .await
        .unwrap();
    let started = now + Duration::seconds(5);
    state.machine.record_activity(session.id, started).await.unwrap();

    let ended = started + Duration::seconds(15 * 60 + 30);
    let receipt = state.machine.end(session.id, ended).await.unwrap();
    assert_eq!(receipt.outcome, Some(BillingOutcome::Applied));
    assert_eq!(receipt.billed_minutes, 16);

    let duplicate = state.machine.cancel(session.id, ended).await.unwrap();
    assert_eq!(duplicate.outcome, None);

    let stored = sessions.get(session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
    assert!(stored.is_billed);
    assert!(stored.finalizing_until.is_none());
    assert_eq!(ledger.balance(3).await.unwrap(), 8_400);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pg_creation_gate_blocks_empty_wallet(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let sessions = Arc::new(PgSessionStore::new(pool.clone()));
    let ledger = Arc::new(PgWalletLedger::new(pool.clone()));
    let state = AppState::new(sessions, ledger, BillingConfig::default());

    let result = state
        .machine
        .create(NewSession { owner_id: 5, counsellor_id: None }, Utc::now())
        .await;
    assert!(result.is_err());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_sessions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}
