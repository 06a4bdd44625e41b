use chrono::{Days, NaiveDate, Utc};
use fincon_core::{CurrencyCode, RateSource};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::DiskCache;
use crate::provider::{DailyRates, RateProvider};
use crate::FxError;

/// Resolved conversion for one (currency, date) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RateQuote {
    /// Multiply an amount in the source currency by this to get the base amount.
    pub rate: Decimal,
    pub source: RateSource,
    /// Publication date of the fixing used; the requested date for identity/fallback.
    pub effective_date: NaiveDate,
}

#[derive(Default)]
struct Memory {
    days: HashMap<NaiveDate, Arc<DailyRates>>,
    failed: HashSet<NaiveDate>,
    unreachable_since: Option<Instant>,
}

/// Currency-to-base conversion with in-memory and on-disk caching, a bounded
/// backward search for the nearest published fixing, and static fallback rates.
pub struct CurrencyConverter {
    base: CurrencyCode,
    provider: Option<Box<dyn RateProvider>>,
    disk: Option<Mutex<DiskCache>>,
    memory: Mutex<Memory>,
    fallback: BTreeMap<String, Decimal>,
    lookback_days: u32,
    retry_after: Duration,
}

impl CurrencyConverter {
    pub fn new(base: CurrencyCode) -> Self {
        Self {
            base,
            provider: None,
            disk: None,
            memory: Mutex::new(Memory::default()),
            fallback: BTreeMap::new(),
            lookback_days: 7,
            retry_after: Duration::from_secs(300),
        }
    }

    pub fn with_provider(mut self, provider: Box<dyn RateProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_disk_cache(mut self, cache: DiskCache) -> Self {
        self.disk = Some(Mutex::new(cache));
        self
    }

    /// Static rates to base, keyed by currency code.
    pub fn with_fallback_rates(mut self, rates: BTreeMap<String, Decimal>) -> Self {
        self.fallback = rates
            .into_iter()
            .filter_map(|(code, rate)| CurrencyCode::parse(&code).map(|c| (c.as_str().to_string(), rate)))
            .collect();
        self
    }

    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }

    /// How long an unreachable provider is skipped before it is tried again.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn base(&self) -> &CurrencyCode {
        &self.base
    }

    /// Never fails: the live source is tried first, then static rates, then 1.
    pub async fn resolve(&self, currency: &CurrencyCode, date: NaiveDate) -> RateQuote {
        if *currency == self.base {
            return RateQuote { rate: Decimal::ONE, source: RateSource::Identity, effective_date: date };
        }

        if let Some(provider) = &self.provider {
            for offset in 0..=self.lookback_days {
                let Some(day) = date.checked_sub_days(Days::new(offset.into())) else {
                    break;
                };
                let daily = match self.daily(provider.as_ref(), day).await {
                    Ok(Some(daily)) => daily,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                if let Some(rate) = daily.rate_between(currency.as_str(), self.base.as_str(), provider.home_currency()) {
                    if offset > 0 {
                        debug!("Using {} rate from {} for {date}", currency, daily.published);
                    }
                    return RateQuote { rate, source: RateSource::Live, effective_date: daily.published };
                }
            }
        }

        self.fallback_quote(currency, date)
    }

    fn fallback_quote(&self, currency: &CurrencyCode, date: NaiveDate) -> RateQuote {
        match self.fallback.get(currency.as_str()) {
            Some(rate) => {
                debug!("Using static {currency} rate {rate}");
                RateQuote { rate: *rate, source: RateSource::Fallback, effective_date: date }
            }
            None => {
                warn!("No rate known for {currency}, converting at 1");
                RateQuote { rate: Decimal::ONE, source: RateSource::Fallback, effective_date: date }
            }
        }
    }

    /// `Ok(None)` for a day with nothing published, `Err` while the provider
    /// is inside its unreachable backoff.
    async fn daily(&self, provider: &dyn RateProvider, day: NaiveDate) -> Result<Option<Arc<DailyRates>>, FxError> {
        {
            let memory = self.lock_memory();
            if let Some(hit) = memory.days.get(&day) {
                return Ok(Some(hit.clone()));
            }
            if let Some(since) = memory.unreachable_since {
                if since.elapsed() < self.retry_after {
                    return Err(FxError::Unreachable("provider marked unreachable".into()));
                }
            }
            if memory.failed.contains(&day) {
                return Ok(None);
            }
        }

        if let Some(disk) = &self.disk {
            let cached = disk
                .lock()
                .ok()
                .and_then(|cache| cache.get(day, Utc::now()).cloned());
            if let Some(daily) = cached {
                let daily = Arc::new(daily);
                self.lock_memory().days.insert(day, daily.clone());
                return Ok(Some(daily));
            }
        }

        match provider.daily_rates(day).await {
            Ok(daily) => {
                info!("Fetched {} exchange rates for {day}", daily.rates.len());
                if let Some(disk) = &self.disk {
                    if let Ok(mut cache) = disk.lock() {
                        if let Err(e) = cache.insert(day, daily.clone()) {
                            warn!("Failed to write rate cache {}: {e}", cache.path().display());
                        }
                    }
                }
                let daily = Arc::new(daily);
                let mut memory = self.lock_memory();
                if memory.unreachable_since.take().is_some() {
                    info!("Rate source reachable again");
                }
                memory.days.insert(day, daily.clone());
                Ok(Some(daily))
            }
            Err(FxError::Unreachable(msg)) => {
                warn!("Rate source unreachable for {day}: {msg}");
                self.lock_memory().unreachable_since = Some(Instant::now());
                Err(FxError::Unreachable(msg))
            }
            Err(e) => {
                debug!("No fixing for {day}: {e}");
                self.lock_memory().failed.insert(day);
                Ok(None)
            }
        }
    }

    fn lock_memory(&self) -> std::sync::MutexGuard<'_, Memory> {
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn code(s: &str) -> CurrencyCode {
        CurrencyCode::parse(s).unwrap()
    }

    /// Publishes EUR=24.33 on weekdays only.
    struct WeekdayProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RateProvider for WeekdayProvider {
        fn home_currency(&self) -> &str {
            "CZK"
        }

        async fn daily_rates(&self, date: NaiveDate) -> Result<DailyRates, FxError> {
            use chrono::Datelike;
            self.calls.fetch_add(1, Ordering::SeqCst);
            if date.weekday().number_from_monday() > 5 {
                return Err(FxError::NoData(format!("weekend {date}")));
            }
            Ok(DailyRates {
                published: date,
                fetched_at: Utc::now(),
                rates: BTreeMap::from([("EUR".to_string(), Decimal::from_str("24.33").unwrap())]),
            })
        }
    }

    struct DownProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RateProvider for DownProvider {
        fn home_currency(&self) -> &str {
            "CZK"
        }

        async fn daily_rates(&self, _date: NaiveDate) -> Result<DailyRates, FxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FxError::Unreachable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn base_currency_is_identity() {
        let converter = CurrencyConverter::new(code("CZK"));
        let quote = converter.resolve(&code("CZK"), day(2025, 10, 31)).await;
        assert_eq!(quote.rate, Decimal::ONE);
        assert_eq!(quote.source, RateSource::Identity);
    }

    #[tokio::test]
    async fn weekend_looks_back_to_friday() {
        let calls = Arc::new(AtomicUsize::new(0));
        let converter = CurrencyConverter::new(code("CZK"))
            .with_provider(Box::new(WeekdayProvider { calls: calls.clone() }));

        // 2025-11-02 is a Sunday.
        let quote = converter.resolve(&code("EUR"), day(2025, 11, 2)).await;
        assert_eq!(quote.source, RateSource::Live);
        assert_eq!(quote.effective_date, day(2025, 10, 31));
        assert_eq!(quote.rate, Decimal::from_str("24.33").unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Every date in the window is memoized, including the failed ones.
        converter.resolve(&code("EUR"), day(2025, 11, 2)).await;
        converter.resolve(&code("EUR"), day(2025, 11, 1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_source_falls_back_without_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let converter = CurrencyConverter::new(code("CZK"))
            .with_provider(Box::new(DownProvider { calls: calls.clone() }))
            .with_fallback_rates(BTreeMap::from([("EUR".to_string(), Decimal::from(25))]));

        let eur = converter.resolve(&code("EUR"), day(2025, 10, 31)).await;
        assert_eq!(eur.source, RateSource::Fallback);
        assert_eq!(eur.rate, Decimal::from(25));

        let gbp = converter.resolve(&code("GBP"), day(2025, 10, 30)).await;
        assert_eq!(gbp.source, RateSource::Fallback);
        assert_eq!(gbp.rate, Decimal::ONE);

        // Skipped for the backoff after the first failure.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_http_source_falls_back() {
        let provider = crate::CnbRateProvider::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let converter = CurrencyConverter::new(code("CZK"))
            .with_provider(Box::new(provider))
            .with_fallback_rates(BTreeMap::from([("USD".to_string(), Decimal::from(21))]));
        let quote = converter.resolve(&code("USD"), day(2025, 10, 31)).await;
        assert_eq!(quote.source, RateSource::Fallback);
        assert_eq!(quote.rate, Decimal::from(21));
    }

    #[tokio::test]
    async fn outage_is_retried_after_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("31 Oct 2025 #211\nCountry|Currency|Amount|Code|Rate\nEMU|euro|1|EUR|24.330\n"),
            )
            .mount(&server)
            .await;

        let provider = crate::CnbRateProvider::new(server.uri(), Duration::from_secs(5)).unwrap();
        let converter = CurrencyConverter::new(code("CZK"))
            .with_provider(Box::new(provider))
            .with_retry_after(Duration::ZERO);

        let during = converter.resolve(&code("EUR"), day(2025, 10, 31)).await;
        assert_eq!(during.source, RateSource::Fallback);

        let after = converter.resolve(&code("EUR"), day(2025, 10, 31)).await;
        assert_eq!(after.source, RateSource::Live);
        assert_eq!(after.rate, Decimal::from_str("24.330").unwrap());
    }

    #[tokio::test]
    async fn disk_cache_serves_without_provider_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rates.json");
        let mut cache = DiskCache::open(&path, Duration::from_secs(3600));
        cache
            .insert(
                day(2025, 10, 31),
                DailyRates {
                    published: day(2025, 10, 31),
                    fetched_at: Utc::now(),
                    rates: BTreeMap::from([("EUR".to_string(), Decimal::from_str("24.10").unwrap())]),
                },
            )
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let converter = CurrencyConverter::new(code("CZK"))
            .with_provider(Box::new(WeekdayProvider { calls: calls.clone() }))
            .with_disk_cache(DiskCache::open(&path, Duration::from_secs(3600)));

        let quote = converter.resolve(&code("EUR"), day(2025, 10, 31)).await;
        assert_eq!(quote.rate, Decimal::from_str("24.10").unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_home_base_uses_cross_rate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let converter = CurrencyConverter::new(code("EUR"))
            .with_provider(Box::new(WeekdayProvider { calls }));
        let quote = converter.resolve(&code("CZK"), day(2025, 10, 31)).await;
        assert_eq!(quote.source, RateSource::Live);
        assert_eq!(quote.rate, Decimal::ONE / Decimal::from_str("24.33").unwrap());
    }
}
