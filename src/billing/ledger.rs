use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// key: wallet-deduction -> result of one check-and-deduct
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeductOutcome {
    Applied { balance_after: i64 },
    /// The same session reference was already charged; nothing moved.
    AlreadyApplied,
    InsufficientFunds { balance: i64 },
}

/// key: wallet-ledger -> owner scoped balances with atomic deduction
///
/// `deduct` is the only authority for spending. Calls for the same owner are
/// serialized; calls for different owners never wait on each other. Every
/// successful deduction is journalled against `reference` (the session id),
/// and a replay of the same reference reports `AlreadyApplied`.
#[async_trait]
pub trait WalletLedger: Send + Sync {
    async fn deduct(
        &self,
        owner_id: i32,
        amount_cents: i64,
        reference: Uuid,
    ) -> AppResult<DeductOutcome>;

    /// Advisory read. Owners without an account report zero.
    async fn balance(&self, owner_id: i32) -> AppResult<i64>;
}

fn ensure_non_negative(amount_cents: i64) -> AppResult<()> {
    if amount_cents < 0 {
        return Err(AppError::BadRequest(
            "deduction amount must be non-negative".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct WalletSlot {
    balance_cents: i64,
    references: HashSet<Uuid>,
}

/// In-process ledger: one async mutex per owner behind a sharded map.
#[derive(Default)]
pub struct MemoryWalletLedger {
    accounts: DashMap<i32, Arc<Mutex<WalletSlot>>>,
}

impl MemoryWalletLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces the account balance. Funding itself lives elsewhere.
    pub async fn open_account(&self, owner_id: i32, balance_cents: i64) {
        let slot = self.slot(owner_id);
        let mut wallet = slot.lock().await;
        wallet.balance_cents = balance_cents.max(0);
    }

    fn slot(&self, owner_id: i32) -> Arc<Mutex<WalletSlot>> {
        // Clone the Arc out so the shard lock is released before awaiting.
        self.accounts
            .entry(owner_id)
            .or_insert_with(|| Arc::new(Mutex::new(WalletSlot::default())))
            .clone()
    }
}

#[async_trait]
impl WalletLedger for MemoryWalletLedger {
    async fn deduct(
        &self,
        owner_id: i32,
        amount_cents: i64,
        reference: Uuid,
    ) -> AppResult<DeductOutcome> {
        ensure_non_negative(amount_cents)?;
        let slot = self.slot(owner_id);
        let mut wallet = slot.lock().await;

        if wallet.references.contains(&reference) {
            debug!(owner_id, %reference, "deduction already journalled");
            return Ok(DeductOutcome::AlreadyApplied);
        }

        if wallet.balance_cents < amount_cents {
            warn!(
                owner_id,
                %reference,
                amount_cents,
                balance_cents = wallet.balance_cents,
                "insufficient wallet balance for deduction"
            );
            return Ok(DeductOutcome::InsufficientFunds {
                balance: wallet.balance_cents,
            });
        }

        let before = wallet.balance_cents;
        wallet.balance_cents -= amount_cents;
        wallet.references.insert(reference);
        info!(
            owner_id,
            %reference,
            amount_cents,
            balance_before = before,
            balance_after = wallet.balance_cents,
            "wallet deduction applied"
        );
        Ok(DeductOutcome::Applied {
            balance_after: wallet.balance_cents,
        })
    }

    async fn balance(&self, owner_id: i32) -> AppResult<i64> {
        let Some(slot) = self.accounts.get(&owner_id).map(|entry| entry.clone()) else {
            return Ok(0);
        };
        let wallet = slot.lock().await;
        Ok(wallet.balance_cents)
    }
}

/// Postgres ledger: the wallet row lock taken by `SELECT ... FOR UPDATE`
/// serializes deductions for one owner inside a transaction.
#[derive(Clone)]
pub struct PgWalletLedger {
    pool: PgPool,
}

impl PgWalletLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WalletLedger for PgWalletLedger {
    async fn deduct(
        &self,
        owner_id: i32,
        amount_cents: i64,
        reference: Uuid,
    ) -> AppResult<DeductOutcome> {
        ensure_non_negative(amount_cents)?;
        let mut tx = self.pool.begin().await?;

        let balance: Option<i64> = sqlx::query_scalar(
            "SELECT balance_cents FROM wallet_accounts WHERE owner_id = $1 FOR UPDATE",
        )
        .bind(owner_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance) = balance else {
            warn!(owner_id, %reference, "deduction against missing wallet account");
            return Ok(DeductOutcome::InsufficientFunds { balance: 0 });
        };

        let journalled: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM wallet_transactions WHERE session_id = $1")
                .bind(reference)
                .fetch_optional(&mut *tx)
                .await?;
        if journalled.is_some() {
            debug!(owner_id, %reference, "deduction already journalled");
            return Ok(DeductOutcome::AlreadyApplied);
        }

        if balance < amount_cents {
            warn!(
                owner_id,
                %reference,
                amount_cents,
                balance_cents = balance,
                "insufficient wallet balance for deduction"
            );
            return Ok(DeductOutcome::InsufficientFunds { balance });
        }

        let balance_after: i64 = sqlx::query_scalar(
            r#"
            UPDATE wallet_accounts
            SET balance_cents = balance_cents - $2,
                updated_at = NOW()
            WHERE owner_id = $1
            RETURNING balance_cents
            "#,
        )
        .bind(owner_id)
        .bind(amount_cents)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO wallet_transactions (
                id,
                owner_id,
                session_id,
                amount_cents,
                balance_after_cents
            ) VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(reference)
        .bind(amount_cents)
        .bind(balance_after)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            owner_id,
            %reference,
            amount_cents,
            balance_before = balance,
            balance_after,
            "wallet deduction applied"
        );
        Ok(DeductOutcome::Applied { balance_after })
    }

    async fn balance(&self, owner_id: i32) -> AppResult<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance_cents FROM wallet_accounts WHERE owner_id = $1")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deduct_is_all_or_nothing() {
        let ledger = MemoryWalletLedger::new();
        ledger.open_account(1, 500).await;

        let outcome = ledger.deduct(1, 1600, Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, DeductOutcome::InsufficientFunds { balance: 500 });
        assert_eq!(ledger.balance(1).await.unwrap(), 500);

        let outcome = ledger.deduct(1, 500, Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, DeductOutcome::Applied { balance_after: 0 });
    }

    #[tokio::test]
    async fn replayed_reference_is_not_charged_twice() {
        let ledger = MemoryWalletLedger::new();
        ledger.open_account(3, 1000).await;
        let reference = Uuid::new_v4();

        ledger.deduct(3, 300, reference).await.unwrap();
        let replay = ledger.deduct(3, 300, reference).await.unwrap();

        assert_eq!(replay, DeductOutcome::AlreadyApplied);
        assert_eq!(ledger.balance(3).await.unwrap(), 700);
    }

    #[tokio::test]
    async fn unknown_owner_has_no_funds() {
        let ledger = MemoryWalletLedger::new();
        assert_eq!(ledger.balance(99).await.unwrap(), 0);
        let outcome = ledger.deduct(99, 100, Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, DeductOutcome::InsufficientFunds { balance: 0 });
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected() {
        let ledger = MemoryWalletLedger::new();
        ledger.open_account(4, 100).await;
        let err = ledger.deduct(4, -1, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deductions_never_overdraw() {
        let ledger = Arc::new(MemoryWalletLedger::new());
        ledger.open_account(5, 1000).await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.deduct(5, 300, Uuid::new_v4()).await.unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), DeductOutcome::Applied { .. }) {
                applied += 1;
            }
        }

        assert_eq!(applied, 3);
        assert_eq!(ledger.balance(5).await.unwrap(), 100);
    }
}
