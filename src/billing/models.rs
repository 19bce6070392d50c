use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// key: billing-outcome -> result of one billing application
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingOutcome {
    Applied,
    InsufficientFunds,
    AlreadyBilled,
    SkippedNoDuration,
}

impl BillingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingOutcome::Applied => "applied",
            BillingOutcome::InsufficientFunds => "insufficient_funds",
            BillingOutcome::AlreadyBilled => "already_billed",
            BillingOutcome::SkippedNoDuration => "skipped_no_duration",
        }
    }
}

/// Billing columns written back onto a session after an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BillingRecord {
    pub amount_cents: i64,
    pub minutes: i64,
    pub is_billed: bool,
    pub processed_at: DateTime<Utc>,
}

/// key: billing-estimate -> read-only live cost
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CostEstimate {
    pub elapsed_minutes_so_far: i64,
    pub estimated_amount: String,
    pub estimated_amount_cents: i64,
    pub is_active: bool,
    pub is_billed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletBalance {
    pub owner_id: i32,
    pub balance: String,
    pub balance_cents: i64,
}

impl WalletBalance {
    pub fn new(owner_id: i32, balance_cents: i64) -> Self {
        Self {
            owner_id,
            balance: format_cents(balance_cents),
            balance_cents,
        }
    }
}

/// Renders minor units as a fixed two-decimal string (`1600` -> `"16.00"`).
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::format_cents;

    #[test]
    fn formats_minor_units() {
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(1600), "16.00");
        assert_eq!(format_cents(8450), "84.50");
        assert_eq!(format_cents(-250), "-2.50");
    }
}
