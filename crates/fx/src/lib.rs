pub mod cache;
pub mod converter;
pub mod provider;

pub use cache::{is_fresh, DiskCache};
pub use converter::{CurrencyConverter, RateQuote};
pub use provider::{parse_cnb_daily, CnbRateProvider, DailyRates, RateProvider, CNB_DAILY_URL};

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Rate lookup failures. Never surfaced past [`CurrencyConverter::resolve`].
#[derive(Debug, Error)]
pub enum FxError {
    #[error("Rate source unreachable: {0}")]
    Unreachable(String),
    #[error("No rates published: {0}")]
    NoData(String),
    #[error("Malformed rate data: {0}")]
    Malformed(String),
    #[error("Rate cache error: {0}")]
    Cache(String),
}

/// `[currency]` settings section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FxConfig {
    pub live: bool,
    pub endpoint: String,
    pub cache_file: Option<PathBuf>,
    pub today_ttl_secs: u64,
    pub lookback_days: u32,
    pub timeout_secs: u64,
    /// Seconds an unreachable rate source is skipped before the next attempt.
    pub retry_after_secs: u64,
    pub fallback_rates: BTreeMap<String, Decimal>,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            live: true,
            endpoint: CNB_DAILY_URL.to_string(),
            cache_file: None,
            today_ttl_secs: 3600,
            lookback_days: 7,
            timeout_secs: 10,
            retry_after_secs: 300,
            fallback_rates: BTreeMap::new(),
        }
    }
}

impl FxConfig {
    /// Builds the converter described by this section.
    pub fn build(&self, base: fincon_core::CurrencyCode) -> Result<CurrencyConverter, FxError> {
        let mut converter = CurrencyConverter::new(base)
            .with_lookback_days(self.lookback_days)
            .with_retry_after(Duration::from_secs(self.retry_after_secs))
            .with_fallback_rates(self.fallback_rates.clone());
        if self.live {
            let provider = CnbRateProvider::new(self.endpoint.clone(), Duration::from_secs(self.timeout_secs))?;
            converter = converter.with_provider(Box::new(provider));
        }
        if let Some(path) = &self.cache_file {
            converter = converter.with_disk_cache(DiskCache::open(path, Duration::from_secs(self.today_ttl_secs)));
        }
        Ok(converter)
    }
}
