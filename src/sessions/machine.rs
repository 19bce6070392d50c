use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::{NewSession, Session, SessionStatus, TerminationReceipt};
use super::store::{EndedAt, SessionStore};
use crate::billing::finalization::{FinalizationCoordinator, FinalizeOutcome};
use crate::billing::gate::BalanceGate;
use crate::billing::models::CostEstimate;
use crate::error::{AppError, AppResult};

/// Conditional writes can lose to a concurrent writer; re-read and retry this often.
const MAX_TRANSITION_ATTEMPTS: usize = 3;

const LEASE_POLL_INITIAL: StdDuration = StdDuration::from_millis(10);
const LEASE_POLL_MAX: StdDuration = StdDuration::from_millis(250);

/// key: session-state-machine -> lifecycle owner, finalizes on every terminal transition
#[derive(Clone)]
pub struct SessionStateMachine {
    sessions: Arc<dyn SessionStore>,
    gate: BalanceGate,
    coordinator: Arc<FinalizationCoordinator>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Termination {
    End,
    Cancel,
    Idle { idle_cutoff: DateTime<Utc> },
}

impl Termination {
    fn target(&self) -> SessionStatus {
        match self {
            Termination::End => SessionStatus::Completed,
            Termination::Cancel => SessionStatus::Cancelled,
            Termination::Idle { .. } => SessionStatus::Inactive,
        }
    }

    fn ended_at(&self, now: DateTime<Utc>) -> EndedAt {
        match self {
            Termination::Idle { idle_cutoff } => EndedAt::LastActivity {
                idle_cutoff: *idle_cutoff,
            },
            _ => EndedAt::At(now),
        }
    }
}

impl SessionStateMachine {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        gate: BalanceGate,
        coordinator: Arc<FinalizationCoordinator>,
    ) -> Self {
        Self {
            sessions,
            gate,
            coordinator,
        }
    }

    pub async fn get(&self, session_id: Uuid) -> AppResult<Session> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Creates a queued session after the blocking balance gate passes.
    pub async fn create(&self, request: NewSession, now: DateTime<Utc>) -> AppResult<Session> {
        let balance = self
            .gate
            .check_minimum(request.owner_id, self.gate.minimum_cents())
            .await
            .map_err(|err| {
                if let AppError::InsufficientBalance {
                    current_balance,
                    required_minimum,
                } = &err
                {
                    info!(
                        owner_id = request.owner_id,
                        current_balance,
                        required_minimum,
                        "session creation blocked by balance gate"
                    );
                }
                err
            })?;

        let session = Session::queued(request.owner_id, request.counsellor_id, now);
        self.sessions.insert(&session).await?;
        info!(
            session_id = %session.id,
            owner_id = session.owner_id,
            counsellor_id = ?session.counsellor_id,
            balance_cents = balance,
            "session queued"
        );
        Ok(session)
    }

    /// Qualifying activity. The first one activates a queued session; later
    /// ones refresh the idle clock. Terminal sessions reject activity.
    pub async fn record_activity(&self, session_id: Uuid, now: DateTime<Utc>) -> AppResult<Session> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let session = self.get(session_id).await?;
            match session.status {
                SessionStatus::Queued => {
                    let soft = self.gate.check_soft(session.owner_id).await;
                    if let Some(active) = self.sessions.activate(session_id, now).await? {
                        info!(
                            %session_id,
                            owner_id = active.owner_id,
                            started_at = ?active.started_at,
                            balance_ok = soft.sufficient,
                            "session activated"
                        );
                        return Ok(active);
                    }
                }
                SessionStatus::Active => {
                    if let Some(active) = self.sessions.touch_activity(session_id, now).await? {
                        return Ok(active);
                    }
                }
                status => {
                    return Err(AppError::invalid_transition(status, SessionStatus::Active));
                }
            }
            debug!(%session_id, "session changed during activity update; retrying");
        }
        Err(AppError::Storage(format!(
            "session {session_id} kept changing during activity update"
        )))
    }

    /// active -> completed. Finalization completes before this returns.
    pub async fn end(&self, session_id: Uuid, now: DateTime<Utc>) -> AppResult<TerminationReceipt> {
        self.terminate(session_id, Termination::End, now)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// queued|active -> cancelled. Finalization completes before this returns.
    pub async fn cancel(&self, session_id: Uuid, now: DateTime<Utc>) -> AppResult<TerminationReceipt> {
        self.terminate(session_id, Termination::Cancel, now)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// active -> inactive for the idle sweep. `ended_at` is the last observed
    /// activity. Returns `None` when fresh activity arrived after the scan or
    /// the session was already terminated by another path.
    pub async fn expire_idle(
        &self,
        session_id: Uuid,
        idle_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Option<TerminationReceipt>> {
        self.terminate(session_id, Termination::Idle { idle_cutoff }, now)
            .await
    }

    pub async fn estimate(&self, session_id: Uuid, now: DateTime<Utc>) -> AppResult<CostEstimate> {
        let session = self.get(session_id).await?;
        Ok(self.coordinator.billing().estimate(&session, now))
    }

    async fn terminate(
        &self,
        session_id: Uuid,
        termination: Termination,
        now: DateTime<Utc>,
    ) -> AppResult<Option<TerminationReceipt>> {
        let target = termination.target();

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let session = self.get(session_id).await?;

            if session.status.is_terminal() {
                if let Termination::Idle { .. } = termination {
                    debug!(
                        %session_id,
                        status = %session.status,
                        "session terminated since idle scan; leaving it"
                    );
                    return Ok(None);
                }
                return self.duplicate_termination(session, target, now).await.map(Some);
            }

            if !session.status.can_transition_to(target) {
                return Err(AppError::invalid_transition(session.status, target));
            }

            if let EndedAt::At(at) = termination.ended_at(now) {
                if session.started_at.map(|started| started > at).unwrap_or(false) {
                    warn!(
                        %session_id,
                        started_at = ?session.started_at,
                        requested_end = %at,
                        "termination requested before session start; clamping"
                    );
                }
            }

            let Some(terminated) = self
                .sessions
                .terminate(session_id, session.status, target, termination.ended_at(now))
                .await?
            else {
                if let Termination::Idle { .. } = termination {
                    let current = self.get(session_id).await?;
                    if current.status == SessionStatus::Active {
                        debug!(%session_id, "session saw activity since idle scan; leaving active");
                        return Ok(None);
                    }
                }
                debug!(%session_id, "session changed during termination; retrying");
                continue;
            };

            info!(
                %session_id,
                owner_id = terminated.owner_id,
                from = %session.status,
                to = %terminated.status,
                ended_at = ?terminated.ended_at,
                "session terminated"
            );

            let outcome = self.finalize_settled(session_id, now).await?;
            let finalized = self.get(session_id).await?;
            return Ok(Some(TerminationReceipt::new(
                &finalized,
                outcome.billing_outcome(),
            )));
        }

        Err(AppError::Storage(format!(
            "session {session_id} kept changing during termination"
        )))
    }

    /// A termination request for a session that is already terminal: no new
    /// transition or timestamp, only finalize's idempotency check.
    async fn duplicate_termination(
        &self,
        session: Session,
        requested: SessionStatus,
        now: DateTime<Utc>,
    ) -> AppResult<TerminationReceipt> {
        debug!(
            session_id = %session.id,
            status = %session.status,
            requested = %requested,
            "duplicate termination request"
        );
        let outcome = self.finalize_settled(session.id, now).await?;
        let current = self.get(session.id).await?;
        Ok(TerminationReceipt::new(&current, outcome.billing_outcome()))
    }

    /// Finalizes, waiting out another caller's lease so the caller only ever
    /// sees settled billing columns. The clock advances with the wait, so a
    /// holder that died is taken over once its lease lapses.
    async fn finalize_settled(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<FinalizeOutcome> {
        let give_up_after = self.coordinator.lease() * 2;
        let waiting_since = Instant::now();
        let mut backoff = LEASE_POLL_INITIAL;

        loop {
            let waited = Duration::from_std(waiting_since.elapsed())
                .unwrap_or_else(|_| Duration::zero());
            let outcome = self.coordinator.finalize(session_id, now + waited).await?;
            if outcome != FinalizeOutcome::InProgress {
                return Ok(outcome);
            }
            if waited > give_up_after {
                return Err(AppError::Storage(format!(
                    "finalization of session {session_id} did not settle"
                )));
            }
            debug!(%session_id, ?backoff, "waiting on finalizing lease");
            sleep(backoff).await;
            backoff = (backoff * 2).min(LEASE_POLL_MAX);
        }
    }
}
