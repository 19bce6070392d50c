use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::billing::models::{format_cents, BillingOutcome};
use crate::error::AppError;

/// key: session-status -> closed lifecycle enumeration
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Active,
    Completed,
    Cancelled,
    Inactive,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Inactive => "inactive",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Inactive
        )
    }

    /// Transition table. Anything not listed here is rejected.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Queued, SessionStatus::Active)
                | (SessionStatus::Queued, SessionStatus::Cancelled)
                | (SessionStatus::Active, SessionStatus::Completed)
                | (SessionStatus::Active, SessionStatus::Cancelled)
                | (SessionStatus::Active, SessionStatus::Inactive)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(SessionStatus::Queued),
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "inactive" => Ok(SessionStatus::Inactive),
            other => Err(AppError::Storage(format!(
                "unknown session status `{other}`"
            ))),
        }
    }
}

/// key: session-model -> conversation instance billed by active duration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub owner_id: i32,
    pub counsellor_id: Option<i32>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub billed_amount_cents: i64,
    pub billed_minutes: i64,
    pub is_billed: bool,
    pub billing_processed_at: Option<DateTime<Utc>>,
    pub finalizing_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn queued(owner_id: i32, counsellor_id: Option<i32>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            counsellor_id,
            status: SessionStatus::Queued,
            created_at: now,
            started_at: None,
            ended_at: None,
            last_activity_at: None,
            billed_amount_cents: 0,
            billed_minutes: 0,
            is_billed: false,
            billing_processed_at: None,
            finalizing_until: None,
            updated_at: now,
        }
    }

    /// A terminal session whose charge was computed but never collected.
    pub fn is_unpaid(&self) -> bool {
        self.status.is_terminal() && !self.is_billed
    }

    pub fn is_finalizing(&self, now: DateTime<Utc>) -> bool {
        self.finalizing_until.map(|until| until > now).unwrap_or(false)
    }

    pub fn view(&self) -> SessionView {
        SessionView::from(self)
    }
}

/// Raw `chat_sessions` row; status is validated on the way out.
#[derive(Debug, FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub owner_id: i32,
    pub counsellor_id: Option<i32>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub billed_amount_cents: i64,
    pub billed_minutes: i64,
    pub is_billed: bool,
    pub billing_processed_at: Option<DateTime<Utc>>,
    pub finalizing_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            id: row.id,
            owner_id: row.owner_id,
            counsellor_id: row.counsellor_id,
            status: row.status.parse()?,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            last_activity_at: row.last_activity_at,
            billed_amount_cents: row.billed_amount_cents,
            billed_minutes: row.billed_minutes,
            is_billed: row.is_billed,
            billing_processed_at: row.billing_processed_at,
            finalizing_until: row.finalizing_until,
            updated_at: row.updated_at,
        })
    }
}

/// key: session-view -> persisted shape exposed to reporting collaborators
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionView {
    pub id: Uuid,
    pub owner_id: i32,
    pub counsellor_id: Option<i32>,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub billed_amount: String,
    pub billed_amount_cents: i64,
    pub billed_minutes: i64,
    pub is_billed: bool,
    pub billing_processed_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        SessionView {
            id: session.id,
            owner_id: session.owner_id,
            counsellor_id: session.counsellor_id,
            status: session.status,
            started_at: session.started_at,
            ended_at: session.ended_at,
            billed_amount: format_cents(session.billed_amount_cents),
            billed_amount_cents: session.billed_amount_cents,
            billed_minutes: session.billed_minutes,
            is_billed: session.is_billed,
            billing_processed_at: session.billing_processed_at,
        }
    }
}

/// Response for an end/cancel/expire request, produced after finalization ran.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminationReceipt {
    pub session: SessionView,
    /// `None` when the request hit an already-terminal session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<BillingOutcome>,
    pub billed_amount: String,
    pub billed_minutes: i64,
}

impl TerminationReceipt {
    pub fn new(session: &Session, outcome: Option<BillingOutcome>) -> Self {
        TerminationReceipt {
            session: session.view(),
            outcome,
            billed_amount: format_cents(session.billed_amount_cents),
            billed_minutes: session.billed_minutes,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct NewSession {
    pub owner_id: i32,
    #[serde(default)]
    pub counsellor_id: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transitions() {
        let all = [
            SessionStatus::Queued,
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Inactive,
        ];
        for from in all.iter().filter(|status| status.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn queued_sessions_cannot_complete_or_go_idle() {
        assert!(SessionStatus::Queued.can_transition_to(SessionStatus::Active));
        assert!(SessionStatus::Queued.can_transition_to(SessionStatus::Cancelled));
        assert!(!SessionStatus::Queued.can_transition_to(SessionStatus::Completed));
        assert!(!SessionStatus::Queued.can_transition_to(SessionStatus::Inactive));
        assert!(!SessionStatus::Active.can_transition_to(SessionStatus::Queued));
    }

    #[test]
    fn status_round_trips_through_storage_strings() {
        for status in [
            SessionStatus::Queued,
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Inactive,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("archived".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn view_renders_two_decimal_amount() {
        let mut session = Session::queued(7, None, Utc::now());
        session.billed_amount_cents = 1600;
        session.billed_minutes = 16;
        let view = session.view();
        assert_eq!(view.billed_amount, "16.00");
        assert_eq!(view.billed_minutes, 16);
    }
}
