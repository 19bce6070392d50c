use std::sync::Arc;

use crate::billing::{
    start_reconciliation_worker, BalanceGate, BillingService, FinalizationCoordinator,
    ReconciliationHandle, WalletLedger,
};
use crate::config::BillingConfig;
use crate::sessions::{SessionStateMachine, SessionStore};

/// Shared handles passed to HTTP handlers through an `Extension` layer.
/// Must be built inside a tokio runtime: it starts the reconciliation worker.
#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<SessionStateMachine>,
    pub coordinator: Arc<FinalizationCoordinator>,
    pub sessions: Arc<dyn SessionStore>,
    pub ledger: Arc<dyn WalletLedger>,
    pub reconciliation: ReconciliationHandle,
    pub config: BillingConfig,
}

impl AppState {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        ledger: Arc<dyn WalletLedger>,
        config: BillingConfig,
    ) -> Self {
        let billing =
            BillingService::new(sessions.clone(), ledger.clone(), config.rate_cents_per_minute);
        let coordinator = Arc::new(FinalizationCoordinator::new(
            sessions.clone(),
            billing,
            config.finalize_lease,
        ));
        let gate = BalanceGate::new(ledger.clone(), config.min_balance_cents);
        let machine = Arc::new(SessionStateMachine::new(
            sessions.clone(),
            gate,
            coordinator.clone(),
        ));
        let reconciliation = start_reconciliation_worker(coordinator.clone());

        Self {
            machine,
            coordinator,
            sessions,
            ledger,
            reconciliation,
            config,
        }
    }
}
