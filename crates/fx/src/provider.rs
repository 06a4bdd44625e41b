use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::FxError;

pub const CNB_DAILY_URL: &str = "https://www.cnb.cz/en/financial-markets/foreign-exchange-market/central-bank-exchange-rate-fixing/central-bank-exchange-rate-fixing/daily.txt";

/// One published fixing: per-unit rates against the provider's home currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRates {
    pub published: NaiveDate,
    pub fetched_at: DateTime<Utc>,
    pub rates: BTreeMap<String, Decimal>,
}

impl DailyRates {
    /// Cross rate converting one unit of `currency` into `base`.
    /// The provider's home currency is implicitly 1.
    pub fn rate_between(&self, currency: &str, base: &str, home: &str) -> Option<Decimal> {
        let lookup = |code: &str| {
            if code == home {
                Some(Decimal::ONE)
            } else {
                self.rates.get(code).copied()
            }
        };
        let from = lookup(currency)?;
        let to = lookup(base)?;
        if to.is_zero() {
            return None;
        }
        Some(from / to)
    }
}

/// Source of published exchange rates.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Currency every published rate is quoted against.
    fn home_currency(&self) -> &str;

    /// Fixing valid for `date`. `Err(FxError::NoData)` means the provider answered
    /// but had nothing for that day; `Err(FxError::Unreachable)` means it did not answer.
    async fn daily_rates(&self, date: NaiveDate) -> Result<DailyRates, FxError>;
}

/// Czech National Bank daily fixing (`daily.txt?date=DD.MM.YYYY`).
pub struct CnbRateProvider {
    client: reqwest::Client,
    url: String,
}

impl CnbRateProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FxError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FxError::Unreachable(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl RateProvider for CnbRateProvider {
    fn home_currency(&self) -> &str {
        "CZK"
    }

    async fn daily_rates(&self, date: NaiveDate) -> Result<DailyRates, FxError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("date", date.format("%d.%m.%Y").to_string())])
            .send()
            .await
            .map_err(|e| FxError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(if status.is_server_error() {
                FxError::Unreachable(format!("HTTP {status}"))
            } else {
                FxError::NoData(format!("HTTP {status} for {date}"))
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| FxError::Unreachable(e.to_string()))?;
        parse_cnb_daily(&body, Utc::now())
    }
}

/// Parses the CNB fixing text format:
///
/// ```text
/// 31 Oct 2025 #211
/// Country|Currency|Amount|Code|Rate
/// EMU|euro|1|EUR|24.330
/// Japan|yen|100|JPY|13.654
/// ```
///
/// Rates quoted per `Amount` units are divided down to a per-unit rate.
/// Both the English (`31 Oct 2025`, `24.330`) and Czech (`31.10.2025`, `24,330`)
/// variants are accepted.
pub fn parse_cnb_daily(body: &str, fetched_at: DateTime<Utc>) -> Result<DailyRates, FxError> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());

    let header = lines
        .next()
        .ok_or_else(|| FxError::NoData("empty response".into()))?;
    let date_part = header.split('#').next().unwrap_or("").trim();
    let published = NaiveDate::parse_from_str(date_part, "%d %b %Y")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%d.%m.%Y"))
        .map_err(|_| FxError::Malformed(format!("bad header line '{header}'")))?;

    // Column titles.
    lines.next();

    let mut rates = BTreeMap::new();
    for line in lines {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 5 {
            return Err(FxError::Malformed(format!("short line '{line}'")));
        }
        let units = Decimal::from_str(fields[2].trim())
            .map_err(|_| FxError::Malformed(format!("bad amount in '{line}'")))?;
        let rate = Decimal::from_str(&fields[4].trim().replace(',', "."))
            .map_err(|_| FxError::Malformed(format!("bad rate in '{line}'")))?;
        if units.is_zero() {
            return Err(FxError::Malformed(format!("zero amount in '{line}'")));
        }
        rates.insert(fields[3].trim().to_uppercase(), rate / units);
    }

    if rates.is_empty() {
        return Err(FxError::NoData(format!("no rates published for {published}")));
    }
    Ok(DailyRates { published, fetched_at, rates })
}
