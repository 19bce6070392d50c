use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::ledger::WalletLedger;
use crate::error::{AppError, AppResult};

/// Advisory signal produced at activation time.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct SoftBalanceCheck {
    pub sufficient: bool,
    /// `None` when the balance could not be read.
    pub balance_cents: Option<i64>,
}

/// key: balance-gate -> pre-flight and advisory balance checks
#[derive(Clone)]
pub struct BalanceGate {
    ledger: Arc<dyn WalletLedger>,
    minimum_cents: i64,
}

impl BalanceGate {
    pub fn new(ledger: Arc<dyn WalletLedger>, minimum_cents: i64) -> Self {
        Self {
            ledger,
            minimum_cents,
        }
    }

    pub fn minimum_cents(&self) -> i64 {
        self.minimum_cents
    }

    /// Blocking check used before a session exists. Returns the current balance.
    pub async fn check_minimum(&self, owner_id: i32, required_minimum: i64) -> AppResult<i64> {
        let current_balance = self.ledger.balance(owner_id).await?;
        if current_balance < required_minimum {
            return Err(AppError::InsufficientBalance {
                current_balance,
                required_minimum,
            });
        }
        Ok(current_balance)
    }

    /// Never blocks: low balances and read failures only produce a warning.
    pub async fn check_soft(&self, owner_id: i32) -> SoftBalanceCheck {
        match self.ledger.balance(owner_id).await {
            Ok(balance) if balance >= self.minimum_cents => SoftBalanceCheck {
                sufficient: true,
                balance_cents: Some(balance),
            },
            Ok(balance) => {
                warn!(
                    owner_id,
                    balance_cents = balance,
                    minimum_cents = self.minimum_cents,
                    "activating session with low wallet balance"
                );
                SoftBalanceCheck {
                    sufficient: false,
                    balance_cents: Some(balance),
                }
            }
            Err(err) => {
                warn!(?err, owner_id, "soft balance check failed");
                SoftBalanceCheck {
                    sufficient: false,
                    balance_cents: None,
                }
            }
        }
    }
}
