use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::provider::DailyRates;
use crate::FxError;

/// True if a fixing cached for `date` may still be served at `now`.
///
/// Fixings for past days are final. Today's fixing may still be republished,
/// so it is only trusted for `today_ttl` after retrieval.
pub fn is_fresh(date: NaiveDate, fetched_at: DateTime<Utc>, now: DateTime<Utc>, today_ttl: Duration) -> bool {
    if date < now.date_naive() {
        return true;
    }
    let age = now.signed_duration_since(fetched_at);
    age.to_std().map(|age| age < today_ttl).unwrap_or(true)
}

/// JSON file of fixings keyed by lookup date.
pub struct DiskCache {
    path: PathBuf,
    today_ttl: Duration,
    entries: BTreeMap<NaiveDate, DailyRates>,
}

impl DiskCache {
    /// Opens the cache file. A missing file starts empty; an unreadable one is
    /// logged and discarded.
    pub fn open(path: impl Into<PathBuf>, today_ttl: Duration) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Discarding unreadable rate cache {}: {e}", path.display());
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        debug!("Loaded {} cached rate sets from {}", entries.len(), path.display());
        Self { path, today_ttl, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, date: NaiveDate, now: DateTime<Utc>) -> Option<&DailyRates> {
        self.entries
            .get(&date)
            .filter(|e| is_fresh(date, e.fetched_at, now, self.today_ttl))
    }

    pub fn insert(&mut self, date: NaiveDate, rates: DailyRates) -> Result<(), FxError> {
        self.entries.insert(date, rates);
        self.flush()
    }

    fn flush(&self) -> Result<(), FxError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FxError::Cache(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&self.entries).map_err(|e| FxError::Cache(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| FxError::Cache(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample(fetched_at: DateTime<Utc>) -> DailyRates {
        DailyRates {
            published: day(2025, 10, 31),
            fetched_at,
            rates: BTreeMap::from([("EUR".to_string(), Decimal::new(2433, 2))]),
        }
    }

    #[test]
    fn past_dates_never_expire() {
        let ttl = Duration::from_secs(3600);
        assert!(is_fresh(day(2025, 10, 31), at(2025, 10, 31, 8), at(2026, 6, 1, 12), ttl));
    }

    #[test]
    fn today_expires_after_ttl() {
        let ttl = Duration::from_secs(3600);
        let today = day(2025, 11, 3);
        assert!(is_fresh(today, at(2025, 11, 3, 8), at(2025, 11, 3, 8) + chrono::Duration::minutes(59), ttl));
        assert!(!is_fresh(today, at(2025, 11, 3, 8), at(2025, 11, 3, 10), ttl));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rates.json");
        let ttl = Duration::from_secs(3600);

        let mut cache = DiskCache::open(&path, ttl);
        assert!(cache.is_empty());
        cache.insert(day(2025, 10, 31), sample(at(2025, 10, 31, 15))).unwrap();

        let reopened = DiskCache::open(&path, ttl);
        assert_eq!(reopened.len(), 1);
        let hit = reopened.get(day(2025, 10, 31), at(2026, 1, 1, 0)).unwrap();
        assert_eq!(hit.rates["EUR"], Decimal::new(2433, 2));
    }

    #[test]
    fn stale_today_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DiskCache::open(dir.path().join("rates.json"), Duration::from_secs(60));
        cache.insert(day(2025, 11, 3), sample(at(2025, 11, 3, 8))).unwrap();
        assert!(cache.get(day(2025, 11, 3), at(2025, 11, 3, 9)).is_none());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rates.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(DiskCache::open(&path, Duration::from_secs(60)).is_empty());
    }
}
