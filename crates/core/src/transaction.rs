use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::category::CategoryPath;
use super::money::CurrencyCode;

/// Content-hash identifier, the sole deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Hashes the invariant parts of a transaction. The amount is normalized
    /// so `-1000.00` and `-1000` produce the same identifier.
    pub fn from_content(
        date: NaiveDate,
        amount: Decimal,
        description: &str,
        account: &str,
        institution: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        for part in [
            date.format("%Y-%m-%d").to_string(),
            amount.normalize().to_string(),
            description.trim().to_string(),
            account.trim().to_string(),
            institution.trim().to_string(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        let digest: [u8; 32] = hasher.finalize().into();
        let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        TransactionId(format!("TXN_{}_{}", date.format("%Y%m%d"), hex))
    }

    /// Wraps an identifier read back from storage.
    pub fn from_stored(raw: String) -> Self {
        TransactionId(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which decision tier assigned a transaction's category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    InternalTransfer,
    ManualRule,
    Ai,
    Learned,
    Uncategorized,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::InternalTransfer => "internal_transfer",
            Provenance::ManualRule => "manual_rule",
            Provenance::Ai => "ai",
            Provenance::Learned => "learned",
            Provenance::Uncategorized => "uncategorized",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal_transfer" => Ok(Provenance::InternalTransfer),
            "manual_rule" => Ok(Provenance::ManualRule),
            "ai" => Ok(Provenance::Ai),
            "learned" => Ok(Provenance::Learned),
            "uncategorized" => Ok(Provenance::Uncategorized),
            other => Err(format!("Unknown provenance: '{other}'")),
        }
    }
}

/// Where the base-currency rate of a transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    /// Transaction already in the base currency.
    Identity,
    Live,
    Fallback,
}

impl RateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RateSource::Identity => "identity",
            RateSource::Live => "live",
            RateSource::Fallback => "fallback",
        }
    }
}

/// Payment reference fields some institutions export. Passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankingSymbols {
    pub variable_symbol: Option<String>,
    pub constant_symbol: Option<String>,
    pub specific_symbol: Option<String>,
    pub reference: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    pub name: Option<String>,
    pub account: Option<String>,
    pub bank_code: Option<String>,
}

/// Canonical transaction record shared by every institution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub amount_base: Decimal,
    pub exchange_rate: Decimal,
    pub rate_source: RateSource,
    pub description: String,
    pub counterparty: Counterparty,
    pub institution: String,
    pub account: Option<String>,
    pub owner: Option<String>,
    pub transaction_type: Option<String>,
    pub category: Option<CategoryPath>,
    pub provenance: Provenance,
    /// 0-100, only set for AI-assigned categories.
    pub confidence: Option<u8>,
    pub is_internal_transfer: bool,
    pub symbols: BankingSymbols,
    pub source_file: String,
    pub processed_at: DateTime<Utc>,
}

impl Transaction {
    /// Records a categorization decision.
    pub fn assign(&mut self, category: CategoryPath, provenance: Provenance, confidence: Option<u8>) {
        self.is_internal_transfer = provenance == Provenance::InternalTransfer;
        self.category = Some(category);
        self.provenance = provenance;
        self.confidence = confidence;
    }

    pub fn account_str(&self) -> &str {
        self.account.as_deref().unwrap_or("")
    }
}
