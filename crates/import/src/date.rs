use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Tried after the descriptor's own formats.
pub const BUILTIN_DATE_FORMATS: &[&str] = &[
    "%d.%m.%Y",
    "%d. %m. %Y",
    "%Y-%m-%d",
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d.%m.%y",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateFormat {
    pub format: Option<String>,
    pub fallback_formats: Vec<String>,
}

impl DateFormat {
    /// Descriptor format, then its fallbacks, then the built-in list. Values with
    /// a trailing time the formats do not mention are retried on the date part.
    pub fn parse(&self, raw: &str) -> Option<NaiveDate> {
        let raw = raw.trim().trim_matches('"');
        if raw.is_empty() {
            return None;
        }
        let formats: Vec<&str> = self
            .format
            .iter()
            .map(String::as_str)
            .chain(self.fallback_formats.iter().map(String::as_str))
            .chain(BUILTIN_DATE_FORMATS.iter().copied())
            .collect();

        try_formats(raw, &formats).or_else(|| {
            let (head, _) = raw.split_once(|c: char| c == 'T' || c == ' ')?;
            try_formats(head, &formats)
        })
    }
}

// `%Y` accepts "25" as year 25; such readings are discarded so `%y` gets its turn.
fn try_formats(value: &str, formats: &[&str]) -> Option<NaiveDate> {
    formats.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(value, fmt)
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(value, fmt).ok().map(|dt| dt.date()))
            .filter(|date| date.year() >= 1900)
    })
}
