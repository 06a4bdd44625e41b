use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rounds a monetary amount to minor units (two decimal places), half away from zero.
pub fn round_minor(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// ISO-4217 style currency code, upper-cased with common aliases folded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Normalizes a raw currency cell. Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if code.is_empty() {
            return None;
        }
        let upper = code.to_uppercase();
        let folded = match upper.as_str() {
            "KC" | "KČ" | "KORUNA" => "CZK",
            "EURO" | "€" => "EUR",
            "DOLLAR" | "$" | "US$" => "USD",
            "£" => "GBP",
            other => other,
        };
        Some(CurrencyCode(folded.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn round_minor_half_away_from_zero() {
        assert_eq!(round_minor(Decimal::from_str("1.005").unwrap()), Decimal::from_str("1.01").unwrap());
        assert_eq!(round_minor(Decimal::from_str("-1.005").unwrap()), Decimal::from_str("-1.01").unwrap());
        assert_eq!(round_minor(Decimal::from_str("27.95").unwrap()), Decimal::from_str("27.95").unwrap());
    }

    #[test]
    fn currency_aliases_fold() {
        assert_eq!(CurrencyCode::parse("Kč").unwrap().as_str(), "CZK");
        assert_eq!(CurrencyCode::parse(" euro ").unwrap().as_str(), "EUR");
        assert_eq!(CurrencyCode::parse("\"usd\"").unwrap().as_str(), "USD");
        assert_eq!(CurrencyCode::parse("chf").unwrap().as_str(), "CHF");
    }

    #[test]
    fn currency_blank_is_none() {
        assert!(CurrencyCode::parse("").is_none());
        assert!(CurrencyCode::parse("  \"\" ").is_none());
    }
}
