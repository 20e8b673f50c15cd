//! Credit accounting for exchanges.
//!
//! Every completed exchange is priced from the tools it used and debited from
//! the owner's balance. Balances are integers. A pre-flight check refuses an
//! exchange the owner cannot afford before any engine call is made.
//!
//! # Example
//!
//! ```rust
//! use kler_core::cost::{CreditLedger, PricingTable, TurnRecord};
//!
//! # tokio_test_block(async {
//! let ledger = CreditLedger::new(50);
//! let cost = PricingTable::default().price(&TurnRecord::default());
//! ledger.preflight("alice", cost).await.unwrap();
//! let outcome = ledger.debit("alice", cost, "s1/q1-r").await;
//! assert_eq!(outcome.new_balance, 45);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f);
//! # }
//! ```

pub mod allowance;
pub mod pricing;

pub use allowance::{AllowancePolicy, AllowanceState};
pub use pricing::{PricingTable, ToolClass, TurnRecord};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::AllowanceConfig;
use crate::error::{KlerError, KlerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Debit,
    Credit,
}

/// One balance movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLedgerEntry {
    pub kind: LedgerEntryKind,
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of a debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitOutcome {
    /// False when the debit left the balance negative.
    pub allowed: bool,
    pub new_balance: i64,
    /// True when the exchange key had already been charged.
    pub replayed: bool,
}

/// Totals for one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub balance: i64,
    pub total_debited: i64,
    pub total_credited: i64,
    pub exchanges: u64,
}

#[derive(Debug, Clone)]
struct Account {
    balance: i64,
    entries: Vec<CostLedgerEntry>,
    charged: HashSet<String>,
    allowance: AllowanceState,
}

/// Owner balances behind one async lock.
#[derive(Clone)]
pub struct CreditLedger {
    inner: Arc<RwLock<HashMap<String, Account>>>,
    initial_balance: i64,
    allowance: AllowancePolicy,
}

impl CreditLedger {
    pub fn new(initial_balance: i64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            initial_balance,
            allowance: AllowancePolicy::disabled(),
        }
    }

    pub fn from_config(config: &AllowanceConfig) -> Self {
        Self::new(config.initial_balance).with_allowance(AllowancePolicy::new(config))
    }

    pub fn with_allowance(mut self, policy: AllowancePolicy) -> Self {
        self.allowance = policy;
        self
    }

    /// Fail with `InsufficientBalance` unless `owner` holds at least `needed`.
    /// Applies any due allowance first.
    pub async fn preflight(&self, owner: &str, needed: i64) -> KlerResult<i64> {
        self.preflight_on(owner, needed, Utc::now().date_naive()).await
    }

    pub async fn preflight_on(&self, owner: &str, needed: i64, today: NaiveDate) -> KlerResult<i64> {
        let mut accounts = self.inner.write().await;
        let account = self.account(&mut accounts, owner, today);
        let grant = self.allowance.top_up(&mut account.allowance, account.balance, today);
        if grant > 0 {
            push_credit(account, grant, "daily allowance");
            tracing::debug!(owner, grant, balance = account.balance, "allowance granted");
        }
        if account.balance < needed {
            return Err(KlerError::InsufficientBalance {
                needed,
                balance: account.balance,
            });
        }
        Ok(account.balance)
    }

    /// Charge `cost` once per `exchange_key`. A repeated key returns the
    /// current balance without charging again.
    pub async fn debit(&self, owner: &str, cost: i64, exchange_key: &str) -> DebitOutcome {
        let mut accounts = self.inner.write().await;
        let account = self.account(&mut accounts, owner, Utc::now().date_naive());
        if !account.charged.insert(exchange_key.to_string()) {
            tracing::debug!(owner, exchange_key, "debit already applied");
            return DebitOutcome {
                allowed: account.balance >= 0,
                new_balance: account.balance,
                replayed: true,
            };
        }
        account.balance -= cost;
        account.entries.push(CostLedgerEntry {
            kind: LedgerEntryKind::Debit,
            amount: cost,
            balance_after: account.balance,
            description: exchange_key.to_string(),
            timestamp: Utc::now(),
        });
        tracing::info!(owner, cost, balance = account.balance, "exchange debited");
        DebitOutcome {
            allowed: account.balance >= 0,
            new_balance: account.balance,
            replayed: false,
        }
    }

    pub async fn credit(&self, owner: &str, amount: i64, description: &str) -> i64 {
        let mut accounts = self.inner.write().await;
        let account = self.account(&mut accounts, owner, Utc::now().date_naive());
        push_credit(account, amount, description);
        account.balance
    }

    pub async fn balance(&self, owner: &str) -> i64 {
        self.inner
            .read()
            .await
            .get(owner)
            .map(|a| a.balance)
            .unwrap_or(self.initial_balance)
    }

    pub async fn history(&self, owner: &str) -> Vec<CostLedgerEntry> {
        self.inner
            .read()
            .await
            .get(owner)
            .map(|a| a.entries.clone())
            .unwrap_or_default()
    }

    pub async fn usage(&self, owner: &str) -> UsageSummary {
        let accounts = self.inner.read().await;
        let Some(account) = accounts.get(owner) else {
            return UsageSummary {
                balance: self.initial_balance,
                ..UsageSummary::default()
            };
        };
        let mut summary = UsageSummary {
            balance: account.balance,
            ..UsageSummary::default()
        };
        for entry in &account.entries {
            match entry.kind {
                LedgerEntryKind::Debit => {
                    summary.total_debited += entry.amount;
                    summary.exchanges += 1;
                }
                LedgerEntryKind::Credit => summary.total_credited += entry.amount,
            }
        }
        summary
    }

    fn account<'a>(
        &self,
        accounts: &'a mut HashMap<String, Account>,
        owner: &str,
        today: NaiveDate,
    ) -> &'a mut Account {
        accounts.entry(owner.to_string()).or_insert_with(|| Account {
            balance: self.initial_balance,
            entries: Vec::new(),
            charged: HashSet::new(),
            // the opening balance stands in for the first day's allowance
            allowance: AllowanceState {
                last_grant_day: Some(today),
                ..AllowanceState::default()
            },
        })
    }
}

fn push_credit(account: &mut Account, amount: i64, description: &str) {
    account.balance += amount;
    account.entries.push(CostLedgerEntry {
        kind: LedgerEntryKind::Credit,
        amount,
        balance_after: account.balance,
        description: description.to_string(),
        timestamp: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, d).unwrap()
    }

    #[tokio::test]
    async fn preflight_refuses_short_balance() {
        let ledger = CreditLedger::new(4);
        let err = ledger.preflight("alice", 5).await.unwrap_err();
        assert!(matches!(err, KlerError::InsufficientBalance { needed: 5, balance: 4 }));
        assert_eq!(ledger.preflight("bob", 4).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn debit_is_idempotent_per_exchange() {
        let ledger = CreditLedger::new(50);
        let first = ledger.debit("alice", 16, "s1/q1-r").await;
        assert_eq!(first.new_balance, 34);
        assert!(first.allowed);
        assert!(!first.replayed);

        let again = ledger.debit("alice", 16, "s1/q1-r").await;
        assert_eq!(again.new_balance, 34);
        assert!(again.replayed);
        assert_eq!(ledger.history("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn debit_may_go_negative() {
        let ledger = CreditLedger::new(5);
        let outcome = ledger.debit("alice", 16, "s1/q1-r").await;
        assert_eq!(outcome.new_balance, -11);
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn credits_and_usage() {
        let ledger = CreditLedger::new(10);
        ledger.debit("alice", 5, "s1/q1-r").await;
        ledger.debit("alice", 7, "s1/q2-r").await;
        assert_eq!(ledger.credit("alice", 20, "purchase").await, 18);

        let usage = ledger.usage("alice").await;
        assert_eq!(usage.balance, 18);
        assert_eq!(usage.total_debited, 12);
        assert_eq!(usage.total_credited, 20);
        assert_eq!(usage.exchanges, 2);
        assert_eq!(ledger.usage("nobody").await.balance, 10);
    }

    #[tokio::test]
    async fn allowance_applies_on_new_day() {
        let config = AllowanceConfig {
            initial_balance: 50,
            daily_allowance: 50,
            monthly_cap: None,
        };
        let ledger = CreditLedger::from_config(&config);
        ledger.preflight_on("alice", 5, day(1)).await.unwrap();
        ledger.debit("alice", 48, "s1/q1-r").await;
        assert!(ledger.preflight_on("alice", 5, day(1)).await.is_err());

        assert_eq!(ledger.preflight_on("alice", 5, day(2)).await.unwrap(), 50);
        let history = ledger.history("alice").await;
        assert_eq!(history.last().unwrap().kind, LedgerEntryKind::Credit);
        assert_eq!(history.last().unwrap().amount, 48);
    }
}
