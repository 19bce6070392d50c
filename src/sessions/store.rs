use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{Session, SessionRow, SessionStatus};
use crate::billing::models::BillingRecord;
use crate::error::{AppError, AppResult};

/// Where a terminal transition takes its `ended_at` from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndedAt {
    /// Wall-clock instant of the request, never earlier than `started_at`.
    At(DateTime<Utc>),
    /// The last observed activity. Applies only while that activity is older
    /// than `idle_cutoff`, so a session that just woke up is left alone.
    LastActivity { idle_cutoff: DateTime<Utc> },
}

/// Which finalizations a lease may be granted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseScope {
    /// First billing attempt: refused once a billing attempt was recorded.
    Initial,
    /// Explicit reconciliation of an unpaid session.
    Reconcile,
}

/// key: session-store -> transactional session records
///
/// Every mutating method is a conditional write: it returns `None` when the
/// precondition no longer holds instead of overwriting a concurrent change.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &Session) -> AppResult<()>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Session>>;

    /// queued -> active, stamping `started_at` and `last_activity_at`.
    async fn activate(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<Option<Session>>;

    /// Bumps `last_activity_at` on an active session.
    async fn touch_activity(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<Option<Session>>;

    /// Moves `from` to the terminal status `to` and stamps `ended_at`.
    async fn terminate(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        ended_at: EndedAt,
    ) -> AppResult<Option<Session>>;

    /// Test-and-set of the finalizing lease. Granted only on terminal,
    /// unbilled sessions without a live lease.
    async fn acquire_finalization(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        scope: LeaseScope,
    ) -> AppResult<Option<Session>>;

    async fn release_finalization(&self, id: Uuid) -> AppResult<()>;

    /// Stamps `billing_processed_at` on an unbilled session whose billing
    /// faulted, leaving the amount columns untouched.
    async fn mark_billing_attempted(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    /// Writes billing columns. `is_billed` never reverts and a billed
    /// session is never rewritten.
    async fn record_billing(&self, id: Uuid, record: &BillingRecord) -> AppResult<Session>;

    /// Active sessions whose last activity is older than `cutoff`.
    async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Session>>;

    /// Terminal sessions that still owe a charge or never finished billing.
    async fn unpaid_sessions(&self) -> AppResult<Vec<Session>>;
}

/// `Initial` refuses any session with a recorded billing attempt, faulted
/// ones included; those re-enter only through `Reconcile`.
fn lease_available(
    session: &Session,
    now: DateTime<Utc>,
    scope: LeaseScope,
) -> bool {
    if !session.status.is_terminal() || session.is_billed || session.is_finalizing(now) {
        return false;
    }
    match scope {
        LeaseScope::Initial => session.billing_processed_at.is_none(),
        LeaseScope::Reconcile => true,
    }
}

/// In-process store. Each conditional write runs under the map's entry lock.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<Uuid, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &Session) -> AppResult<()> {
        if self.sessions.contains_key(&session.id) {
            return Err(AppError::BadRequest(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Session>> {
        Ok(self.sessions.get(&id).map(|entry| entry.value().clone()))
    }

    async fn activate(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<Option<Session>> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.status != SessionStatus::Queued {
            return Ok(None);
        }
        session.status = SessionStatus::Active;
        session.started_at = Some(at);
        session.last_activity_at = Some(at);
        session.updated_at = at;
        Ok(Some(session.clone()))
    }

    async fn touch_activity(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<Option<Session>> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.status != SessionStatus::Active {
            return Ok(None);
        }
        session.last_activity_at = Some(session.last_activity_at.map_or(at, |prev| prev.max(at)));
        session.updated_at = at;
        Ok(Some(session.clone()))
    }

    async fn terminate(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        ended_at: EndedAt,
    ) -> AppResult<Option<Session>> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if session.status != from || !to.is_terminal() {
            return Ok(None);
        }
        let ended = match ended_at {
            EndedAt::At(at) => match session.started_at {
                Some(started) if started > at => started,
                _ => at,
            },
            EndedAt::LastActivity { idle_cutoff } => {
                match session.last_activity_at.or(session.started_at) {
                    Some(last) if last < idle_cutoff => last,
                    _ => return Ok(None),
                }
            }
        };
        session.status = to;
        session.ended_at = Some(ended);
        session.updated_at = Utc::now();
        Ok(Some(session.clone()))
    }

    async fn acquire_finalization(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        scope: LeaseScope,
    ) -> AppResult<Option<Session>> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(None);
        };
        if !lease_available(&session, now, scope) {
            return Ok(None);
        }
        session.finalizing_until = Some(lease_until);
        Ok(Some(session.clone()))
    }

    async fn release_finalization(&self, id: Uuid) -> AppResult<()> {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.finalizing_until = None;
        }
        Ok(())
    }

    async fn mark_billing_attempted(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            if !session.is_billed && session.billing_processed_at.is_none() {
                session.billing_processed_at = Some(at);
                session.updated_at = at;
            }
        }
        Ok(())
    }

    async fn record_billing(&self, id: Uuid, record: &BillingRecord) -> AppResult<Session> {
        let mut session = self.sessions.get_mut(&id).ok_or(AppError::NotFound)?;
        if !session.is_billed {
            session.billed_amount_cents = record.amount_cents;
            session.billed_minutes = record.minutes;
            session.is_billed = record.is_billed;
            session.billing_processed_at = Some(record.processed_at);
            session.updated_at = record.processed_at;
        }
        Ok(session.clone())
    }

    async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Session>> {
        Ok(self
            .sessions
            .iter()
            .filter(|entry| {
                entry.status == SessionStatus::Active
                    && entry
                        .last_activity_at
                        .map(|last| last < cutoff)
                        .unwrap_or(false)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn unpaid_sessions(&self) -> AppResult<Vec<Session>> {
        Ok(self
            .sessions
            .iter()
            .filter(|entry| entry.is_unpaid())
            .map(|entry| entry.value().clone())
            .collect())
    }
}

/// key: session-store-postgres -> `chat_sessions` table
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_session(row: Option<SessionRow>) -> AppResult<Option<Session>> {
    row.map(Session::try_from).transpose()
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &Session) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_sessions (
                id,
                owner_id,
                counsellor_id,
                status,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $5)
            "#,
        )
        .bind(session.id)
        .bind(session.owner_id)
        .bind(session.counsellor_id)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM chat_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        into_session(row)
    }

    async fn activate(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE chat_sessions
            SET status = 'active',
                started_at = $2,
                last_activity_at = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        into_session(row)
    }

    async fn touch_activity(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE chat_sessions
            SET last_activity_at = GREATEST(COALESCE(last_activity_at, $2), $2),
                updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        into_session(row)
    }

    async fn terminate(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        ended_at: EndedAt,
    ) -> AppResult<Option<Session>> {
        if !to.is_terminal() {
            return Ok(None);
        }
        let row = match ended_at {
            EndedAt::At(at) => {
                sqlx::query_as::<_, SessionRow>(
                    r#"
                    UPDATE chat_sessions
                    SET status = $3,
                        ended_at = GREATEST($4, COALESCE(started_at, $4)),
                        updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(from.as_str())
                .bind(to.as_str())
                .bind(at)
                .fetch_optional(&self.pool)
                .await?
            }
            EndedAt::LastActivity { idle_cutoff } => {
                sqlx::query_as::<_, SessionRow>(
                    r#"
                    UPDATE chat_sessions
                    SET status = $3,
                        ended_at = COALESCE(last_activity_at, started_at),
                        updated_at = NOW()
                    WHERE id = $1
                      AND status = $2
                      AND COALESCE(last_activity_at, started_at) < $4
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(from.as_str())
                .bind(to.as_str())
                .bind(idle_cutoff)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        into_session(row)
    }

    async fn acquire_finalization(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        scope: LeaseScope,
    ) -> AppResult<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE chat_sessions
            SET finalizing_until = $3
            WHERE id = $1
              AND status IN ('completed', 'cancelled', 'inactive')
              AND is_billed = FALSE
              AND (finalizing_until IS NULL OR finalizing_until <= $2)
              AND ($4 OR billing_processed_at IS NULL)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(lease_until)
        .bind(scope == LeaseScope::Reconcile)
        .fetch_optional(&self.pool)
        .await?;
        into_session(row)
    }

    async fn release_finalization(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE chat_sessions SET finalizing_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_billing_attempted(&self, id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE chat_sessions
            SET billing_processed_at = $2,
                updated_at = NOW()
            WHERE id = $1 AND is_billed = FALSE AND billing_processed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_billing(&self, id: Uuid, record: &BillingRecord) -> AppResult<Session> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE chat_sessions
            SET billed_amount_cents = $2,
                billed_minutes = $3,
                is_billed = $4,
                billing_processed_at = $5,
                updated_at = NOW()
            WHERE id = $1 AND is_billed = FALSE
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(record.amount_cents)
        .bind(record.minutes)
        .bind(record.is_billed)
        .bind(record.processed_at)
        .fetch_optional(&self.pool)
        .await?;

        match into_session(row)? {
            Some(session) => Ok(session),
            None => self.get(id).await?.ok_or(AppError::NotFound),
        }
    }

    async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM chat_sessions
            WHERE status = 'active'
              AND last_activity_at IS NOT NULL
              AND last_activity_at < $1
            ORDER BY last_activity_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Session::try_from).collect()
    }

    async fn unpaid_sessions(&self) -> AppResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM chat_sessions
            WHERE is_billed = FALSE
              AND status IN ('completed', 'cancelled', 'inactive')
            ORDER BY ended_at ASC NULLS LAST
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Session::try_from).collect()
    }
}
