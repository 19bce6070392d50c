use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::duration;
use super::ledger::{DeductOutcome, WalletLedger};
use super::models::{format_cents, BillingOutcome, BillingRecord, CostEstimate};
use crate::error::AppResult;
use crate::sessions::models::{Session, SessionStatus};
use crate::sessions::store::SessionStore;

/// Result of one billing application together with the stored session.
#[derive(Clone, Debug)]
pub struct BillingReceipt {
    pub outcome: BillingOutcome,
    pub session: Session,
}

/// key: billing-service -> duration and rate into a one-time charge
#[derive(Clone)]
pub struct BillingService {
    sessions: Arc<dyn SessionStore>,
    ledger: Arc<dyn WalletLedger>,
    rate_cents_per_minute: i64,
}

/// Whole minutes times the flat rate. No fractional minutes are billed.
pub fn compute_amount(minutes: i64, rate_cents_per_minute: i64) -> i64 {
    minutes.max(0).saturating_mul(rate_cents_per_minute.max(0))
}

impl BillingService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        ledger: Arc<dyn WalletLedger>,
        rate_cents_per_minute: i64,
    ) -> Self {
        Self {
            sessions,
            ledger,
            rate_cents_per_minute,
        }
    }

    pub fn compute_amount(&self, minutes: i64) -> i64 {
        compute_amount(minutes, self.rate_cents_per_minute)
    }

    /// Charges the session once. Callers must hold the session's finalizing
    /// lease; storage and ledger faults are returned with the session left
    /// unbilled.
    pub async fn compute_and_apply(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> AppResult<BillingReceipt> {
        if session.is_billed {
            debug!(session_id = %session.id, "session already billed, skipping");
            return Ok(BillingReceipt {
                outcome: BillingOutcome::AlreadyBilled,
                session: session.clone(),
            });
        }

        let billable = duration::compute(session.started_at, session.ended_at);
        if billable.clock_skew {
            warn!(
                session_id = %session.id,
                started_at = ?session.started_at,
                ended_at = ?session.ended_at,
                "session ended before it started; billing zero minutes"
            );
        }

        if billable.minutes == 0 {
            let record = BillingRecord {
                amount_cents: 0,
                minutes: 0,
                is_billed: true,
                processed_at: now,
            };
            let stored = self.sessions.record_billing(session.id, &record).await?;
            info!(
                session_id = %session.id,
                owner_id = session.owner_id,
                "session has no billable duration"
            );
            return Ok(BillingReceipt {
                outcome: BillingOutcome::SkippedNoDuration,
                session: stored,
            });
        }

        let amount_cents = self.compute_amount(billable.minutes);
        info!(
            session_id = %session.id,
            owner_id = session.owner_id,
            minutes = billable.minutes,
            amount_cents,
            started_at = ?session.started_at,
            ended_at = ?session.ended_at,
            "applying session charge"
        );

        let deduction = self
            .ledger
            .deduct(session.owner_id, amount_cents, session.id)
            .await?;

        let (outcome, is_billed) = match deduction {
            DeductOutcome::Applied { .. } | DeductOutcome::AlreadyApplied => {
                (BillingOutcome::Applied, true)
            }
            DeductOutcome::InsufficientFunds { balance } => {
                warn!(
                    session_id = %session.id,
                    owner_id = session.owner_id,
                    amount = %format_cents(amount_cents),
                    balance = %format_cents(balance),
                    "insufficient funds at finalization; recording unpaid charge"
                );
                (BillingOutcome::InsufficientFunds, false)
            }
        };

        let record = BillingRecord {
            amount_cents,
            minutes: billable.minutes,
            is_billed,
            processed_at: now,
        };
        let stored = self.sessions.record_billing(session.id, &record).await?;

        Ok(BillingReceipt {
            outcome,
            session: stored,
        })
    }

    /// Live, non-mutating estimate. Terminal sessions are measured to their end.
    pub fn estimate(&self, session: &Session, now: DateTime<Utc>) -> CostEstimate {
        let until = session.ended_at.unwrap_or(now);
        let minutes = duration::compute(session.started_at, Some(until)).minutes;
        let amount_cents = self.compute_amount(minutes);
        CostEstimate {
            elapsed_minutes_so_far: minutes,
            estimated_amount: format_cents(amount_cents),
            estimated_amount_cents: amount_cents,
            is_active: session.status == SessionStatus::Active,
            is_billed: session.is_billed,
        }
    }

    pub async fn balance(&self, owner_id: i32) -> AppResult<i64> {
        self.ledger.balance(owner_id).await
    }
}
