use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::mpsc::{channel, Sender};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::finalization::{FinalizationCoordinator, FinalizeOutcome};

/// key: billing-reconciliation -> background worker for unpaid sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationJob {
    Session { session_id: Uuid },
    AllUnpaid,
}

/// key: billing-reconciliation-handle -> enqueue interface
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, job: ReconciliationJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue billing reconciliation job: {err}"))
    }
}

pub fn start_reconciliation_worker(coordinator: Arc<FinalizationCoordinator>) -> ReconciliationHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                ReconciliationJob::Session { session_id } => {
                    match coordinator.reconcile(session_id, Utc::now()).await {
                        Ok(FinalizeOutcome::Billed(outcome)) => info!(
                            %session_id,
                            outcome = outcome.as_str(),
                            "session reconciled"
                        ),
                        Ok(other) => warn!(
                            %session_id,
                            ?other,
                            "reconciliation skipped session"
                        ),
                        Err(err) => error!(?err, %session_id, "failed to reconcile session"),
                    }
                }
                ReconciliationJob::AllUnpaid => {
                    if let Err(err) = coordinator.reconcile_unpaid(Utc::now()).await {
                        error!(?err, "failed to list unpaid sessions for reconciliation");
                    }
                }
            }
        }
    });

    ReconciliationHandle { sender: tx }
}
