use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use super::machine::SessionStateMachine;
use super::store::SessionStore;
use crate::error::AppResult;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub terminated: usize,
    pub failed: usize,
    pub dry_run: bool,
}

/// key: idle-sweep -> periodic inactivity termination
pub fn spawn(
    machine: Arc<SessionStateMachine>,
    sessions: Arc<dyn SessionStore>,
    interval_secs: u64,
    idle_timeout: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(TokioDuration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            if let Err(err) =
                process_tick(&machine, sessions.as_ref(), Utc::now(), idle_timeout, false).await
            {
                warn!(?err, "idle session sweep tick failed");
            }
        }
    });
}

/// key: idle-sweep -> tick handler
///
/// Sessions idle past `idle_timeout` are moved to `inactive` through the same
/// termination path as an explicit end, billed up to their last activity.
pub async fn process_tick(
    machine: &SessionStateMachine,
    sessions: &dyn SessionStore,
    now: DateTime<Utc>,
    idle_timeout: Duration,
    dry_run: bool,
) -> AppResult<SweepReport> {
    let idle_cutoff = now - idle_timeout;
    let candidates = sessions.idle_sessions(idle_cutoff).await?;
    let mut report = SweepReport {
        examined: candidates.len(),
        dry_run,
        ..Default::default()
    };

    for session in candidates {
        let idle_minutes = session
            .last_activity_at
            .map(|last| (now - last).num_seconds() as f64 / 60.0)
            .unwrap_or_default();

        if dry_run {
            info!(
                session_id = %session.id,
                owner_id = session.owner_id,
                last_activity_at = ?session.last_activity_at,
                idle_minutes,
                "[dry run] would mark session inactive"
            );
            report.terminated += 1;
            continue;
        }

        match machine.expire_idle(session.id, idle_cutoff, now).await {
            Ok(Some(receipt)) => {
                info!(
                    session_id = %session.id,
                    owner_id = session.owner_id,
                    idle_minutes,
                    billed_minutes = receipt.billed_minutes,
                    outcome = ?receipt.outcome,
                    "marked idle session inactive"
                );
                report.terminated += 1;
            }
            Ok(None) => {
                debug!(session_id = %session.id, "session resumed before sweep applied");
            }
            Err(err) => {
                report.failed += 1;
                warn!(?err, session_id = %session.id, "failed to mark idle session inactive");
            }
        }
    }

    if report.examined > 0 {
        info!(
            examined = report.examined,
            terminated = report.terminated,
            failed = report.failed,
            dry_run,
            "idle session sweep finished"
        );
    }

    Ok(report)
}
