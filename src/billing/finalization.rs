use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::models::BillingOutcome;
use super::service::BillingService;
use crate::error::{AppError, AppResult};
use crate::sessions::store::{LeaseScope, SessionStore};

/// key: finalization-outcome -> what a finalize call did
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    /// This call held the lease and ran billing.
    Billed(BillingOutcome),
    /// Billing already ran (or was attempted) for the session.
    AlreadyFinalized,
    /// Another caller holds the finalizing lease.
    InProgress,
}

impl FinalizeOutcome {
    pub fn billing_outcome(&self) -> Option<BillingOutcome> {
        match self {
            FinalizeOutcome::Billed(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub examined: usize,
    pub applied: usize,
    pub still_unpaid: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// key: finalization-coordinator -> at most one billing side effect per session
///
/// The guard is the session's finalizing lease held in the session store, so
/// it holds across processes; a crashed holder's lease simply expires.
#[derive(Clone)]
pub struct FinalizationCoordinator {
    sessions: Arc<dyn SessionStore>,
    billing: BillingService,
    lease: Duration,
}

impl FinalizationCoordinator {
    pub fn new(sessions: Arc<dyn SessionStore>, billing: BillingService, lease: Duration) -> Self {
        Self {
            sessions,
            billing,
            lease,
        }
    }

    pub fn billing(&self) -> &BillingService {
        &self.billing
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Runs billing once for a terminated session. Losing the race for the
    /// lease, or finding the session already billed or attempted, is a no-op.
    pub async fn finalize(&self, session_id: Uuid, now: DateTime<Utc>) -> AppResult<FinalizeOutcome> {
        self.run(session_id, now, LeaseScope::Initial).await
    }

    /// Explicit retry for a terminal session left unpaid by insufficient
    /// funds or a fault. The ledger journal keeps a replay from charging twice.
    pub async fn reconcile(&self, session_id: Uuid, now: DateTime<Utc>) -> AppResult<FinalizeOutcome> {
        self.run(session_id, now, LeaseScope::Reconcile).await
    }

    pub async fn reconcile_unpaid(&self, now: DateTime<Utc>) -> AppResult<ReconciliationReport> {
        let candidates = self.sessions.unpaid_sessions().await?;
        let mut report = ReconciliationReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for session in candidates {
            match self.reconcile(session.id, now).await {
                Ok(FinalizeOutcome::Billed(
                    BillingOutcome::Applied | BillingOutcome::SkippedNoDuration,
                )) => report.applied += 1,
                Ok(FinalizeOutcome::Billed(BillingOutcome::InsufficientFunds)) => {
                    report.still_unpaid += 1
                }
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    error!(?err, session_id = %session.id, "reconciliation attempt failed");
                }
            }
        }

        info!(
            examined = report.examined,
            applied = report.applied,
            still_unpaid = report.still_unpaid,
            skipped = report.skipped,
            failed = report.failed,
            "reconciliation pass finished"
        );
        Ok(report)
    }

    async fn run(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        scope: LeaseScope,
    ) -> AppResult<FinalizeOutcome> {
        let lease_until = now + self.lease;
        let Some(session) = self
            .sessions
            .acquire_finalization(session_id, now, lease_until, scope)
            .await?
        else {
            return self.explain_refusal(session_id, now).await;
        };

        let result = self.billing.compute_and_apply(&session, now).await;

        // A fault still counts as an attempt, so only reconciliation re-enters.
        if result.is_err() {
            if let Err(mark_err) = self.sessions.mark_billing_attempted(session_id, now).await {
                warn!(
                    ?mark_err,
                    %session_id,
                    "failed to stamp billing attempt after fault"
                );
            }
        }

        // The lease is dropped whatever billing did.
        if let Err(release_err) = self.sessions.release_finalization(session_id).await {
            warn!(
                ?release_err,
                %session_id,
                "failed to release finalizing lease; it will expire"
            );
        }

        match result {
            Ok(receipt) => {
                info!(
                    %session_id,
                    outcome = receipt.outcome.as_str(),
                    billed_minutes = receipt.session.billed_minutes,
                    billed_amount_cents = receipt.session.billed_amount_cents,
                    is_billed = receipt.session.is_billed,
                    "session finalized"
                );
                Ok(FinalizeOutcome::Billed(receipt.outcome))
            }
            Err(err) => {
                error!(?err, %session_id, "session finalization aborted; left unbilled");
                Err(err)
            }
        }
    }

    async fn explain_refusal(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<FinalizeOutcome> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if !session.status.is_terminal() {
            return Err(AppError::invalid_transition(session.status, "finalized"));
        }
        if session.is_finalizing(now) {
            debug!(%session_id, "finalization already in progress");
            return Ok(FinalizeOutcome::InProgress);
        }
        debug!(
            %session_id,
            is_billed = session.is_billed,
            "session already finalized"
        );
        Ok(FinalizeOutcome::AlreadyFinalized)
    }
}
