use fincon_core::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::text::{account_base, fold};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Account numbers owned by the household, with or without `/bankcode`.
    pub own_accounts: Vec<String>,
    /// Phrases in the description or counterparty name that mark a transfer.
    pub keywords: Vec<String>,
    /// Counterparty names that are never transfers, even to an own account.
    pub exclude_counterparties: Vec<String>,
    /// Transaction types that are never transfers.
    pub exclude_types: Vec<String>,
    /// Pair same-day opposite amounts on different accounts within a batch.
    pub same_day_pairing: bool,
}

/// Internal-transfer detection. Text comparisons are folded once at construction.
#[derive(Debug, Clone)]
pub struct TransferDetector {
    own_accounts: Vec<String>,
    keywords: Vec<String>,
    exclude_counterparties: Vec<String>,
    exclude_types: Vec<String>,
    same_day_pairing: bool,
}

impl TransferDetector {
    pub fn new(config: &TransferConfig) -> Self {
        let folded = |list: &[String]| -> Vec<String> {
            list.iter().map(|s| fold(s)).filter(|s| !s.is_empty()).collect()
        };
        Self {
            own_accounts: config
                .own_accounts
                .iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            keywords: folded(&config.keywords),
            exclude_counterparties: folded(&config.exclude_counterparties),
            exclude_types: folded(&config.exclude_types),
            same_day_pairing: config.same_day_pairing,
        }
    }

    pub fn is_excluded(&self, tx: &Transaction) -> bool {
        let hits = |value: Option<&str>, list: &[String]| {
            value.is_some_and(|v| {
                let v = fold(v);
                list.iter().any(|needle| v.contains(needle.as_str()))
            })
        };
        hits(tx.counterparty.name.as_deref(), &self.exclude_counterparties)
            || hits(tx.transaction_type.as_deref(), &self.exclude_types)
    }

    /// Single-transaction checks. Batch pairing is [`pair_same_day`](Self::pair_same_day).
    pub fn is_transfer(&self, tx: &Transaction) -> bool {
        if self.is_excluded(tx) {
            return false;
        }

        if let Some(theirs) = tx.counterparty.account.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            if self.is_own_account(theirs) {
                return true;
            }
            if let Some(ours) = tx.account.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
                if same_account(theirs, ours) {
                    return true;
                }
            }
        }

        if self.keywords.is_empty() {
            return false;
        }
        let description = fold(&tx.description);
        let name = tx.counterparty.name.as_deref().map(fold).unwrap_or_default();
        self.keywords
            .iter()
            .any(|k| description.contains(k.as_str()) || name.contains(k.as_str()))
    }

    pub fn is_own_account(&self, account: &str) -> bool {
        self.own_accounts.iter().any(|own| same_account(own, account))
    }

    /// Indices of transactions that have a same-day opposite-sign partner of equal
    /// absolute amount on a different non-empty account. Each transaction pairs at
    /// most once, with the first unused partner in batch order.
    pub fn pair_same_day(&self, batch: &[Transaction]) -> HashSet<usize> {
        let mut paired = HashSet::new();
        if !self.same_day_pairing {
            return paired;
        }

        for i in 0..batch.len() {
            if paired.contains(&i) {
                continue;
            }
            let a = &batch[i];
            let Some(account_a) = nonempty_account(a) else { continue };
            if a.amount.is_zero() || self.is_excluded(a) {
                continue;
            }

            let partner = (i + 1..batch.len()).find(|&j| {
                let b = &batch[j];
                !paired.contains(&j)
                    && b.date == a.date
                    && b.amount == -a.amount
                    && nonempty_account(b).is_some_and(|account_b| !same_account(account_a, account_b))
                    && !self.is_excluded(b)
            });
            if let Some(j) = partner {
                paired.insert(i);
                paired.insert(j);
            }
        }
        paired
    }
}

fn nonempty_account(tx: &Transaction) -> Option<&str> {
    tx.account.as_deref().map(str::trim).filter(|a| !a.is_empty())
}

/// Exact match, or equal base numbers when either side omits the bank code.
fn same_account(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    if a == b {
        return true;
    }
    (!a.contains('/') || !b.contains('/')) && account_base(a) == account_base(b)
}
