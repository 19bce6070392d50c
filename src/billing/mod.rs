pub mod api;
pub mod duration;
pub mod finalization;
pub mod gate;
pub mod ledger;
pub mod models;
pub mod reconciliation;
pub mod service;

pub use api::{
    get_wallet_balance as billing_get_wallet_balance,
    reconcile_session as billing_reconcile_session,
    queue_reconciliation as billing_queue_reconciliation, ReconcileQuery, ReconcileResponse,
};
pub use duration::BillableDuration;
pub use finalization::{FinalizationCoordinator, FinalizeOutcome, ReconciliationReport};
pub use gate::{BalanceGate, SoftBalanceCheck};
pub use ledger::{DeductOutcome, MemoryWalletLedger, PgWalletLedger, WalletLedger};
pub use models::{format_cents, BillingOutcome, BillingRecord, CostEstimate, WalletBalance};
pub use reconciliation::{start_reconciliation_worker, ReconciliationHandle, ReconciliationJob};
pub use service::{compute_amount, BillingReceipt, BillingService};
