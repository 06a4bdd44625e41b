use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target of a column mapping. Every institution maps its own headers onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Date,
    Amount,
    Currency,
    Description,
    CounterpartyName,
    CounterpartyAccount,
    CounterpartyBankCode,
    Account,
    Owner,
    TransactionType,
    /// Raw direction marker (`OUT`, `Odchozí`, ...) interpreted by the amount format.
    Direction,
    VariableSymbol,
    ConstantSymbol,
    SpecificSymbol,
    Reference,
    Note,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 16] = [
        CanonicalField::Date,
        CanonicalField::Amount,
        CanonicalField::Currency,
        CanonicalField::Description,
        CanonicalField::CounterpartyName,
        CanonicalField::CounterpartyAccount,
        CanonicalField::CounterpartyBankCode,
        CanonicalField::Account,
        CanonicalField::Owner,
        CanonicalField::TransactionType,
        CanonicalField::Direction,
        CanonicalField::VariableSymbol,
        CanonicalField::ConstantSymbol,
        CanonicalField::SpecificSymbol,
        CanonicalField::Reference,
        CanonicalField::Note,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalField::Date => "date",
            CanonicalField::Amount => "amount",
            CanonicalField::Currency => "currency",
            CanonicalField::Description => "description",
            CanonicalField::CounterpartyName => "counterparty_name",
            CanonicalField::CounterpartyAccount => "counterparty_account",
            CanonicalField::CounterpartyBankCode => "counterparty_bank_code",
            CanonicalField::Account => "account",
            CanonicalField::Owner => "owner",
            CanonicalField::TransactionType => "transaction_type",
            CanonicalField::Direction => "direction",
            CanonicalField::VariableSymbol => "variable_symbol",
            CanonicalField::ConstantSymbol => "constant_symbol",
            CanonicalField::SpecificSymbol => "specific_symbol",
            CanonicalField::Reference => "reference",
            CanonicalField::Note => "note",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("Unknown canonical field: '{s}'"))
    }
}

/// A source column, by zero-based position or by header name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Index(i) => write!(f, "#{i}"),
            ColumnRef::Name(n) => write!(f, "'{n}'"),
        }
    }
}
