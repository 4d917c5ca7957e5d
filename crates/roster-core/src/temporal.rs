//! Timestamp parsing into the processing timezone.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::is_blank;

pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Share of failed values above which a column is re-parsed with `T` replaced.
const RETRY_FAILURE_RATIO: f64 = 0.90;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %:z",
    "%Y-%m-%d %H:%M:%S%.f %z",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalNormalizer {
    tz: Tz,
    naive_is_utc: bool,
}

impl TemporalNormalizer {
    /// `naive_is_utc` decides whether values without a zone marker are UTC
    /// (converted to `tz`) or already local wall-clock time.
    pub fn new(tz: Tz, naive_is_utc: bool) -> Self {
        Self { tz, naive_is_utc }
    }

    /// Single-value parse, including the `T` separator fallback.
    pub fn parse(&self, raw: &str) -> Option<DateTime<Tz>> {
        self.parse_primary(raw)
            .or_else(|| self.parse_primary(&space_separated(raw)))
    }

    /// Column parse: the `T` substitution is only applied when the primary
    /// parse fails for more than 90% of the column.
    pub fn parse_column(&self, raw: &[&str]) -> Vec<Option<DateTime<Tz>>> {
        let primary: Vec<_> = raw.iter().map(|v| self.parse_primary(v)).collect();
        if raw.is_empty() {
            return primary;
        }
        let failures = primary.iter().filter(|v| v.is_none()).count();
        if (failures as f64) / (raw.len() as f64) <= RETRY_FAILURE_RATIO {
            return primary;
        }
        raw.iter()
            .map(|v| self.parse_primary(&space_separated(v)))
            .collect()
    }

    /// Canonical `YYYY-MM-DD HH:MM:SS` in the local zone, or `None`.
    pub fn canonical(&self, raw: &str) -> Option<String> {
        self.parse(raw).map(|dt| format_canonical(&dt))
    }

    /// Like [`Self::canonical`] but maps failures to an empty string.
    pub fn canonical_or_empty(&self, raw: &str) -> String {
        self.canonical(raw).unwrap_or_default()
    }

    fn parse_primary(&self, raw: &str) -> Option<DateTime<Tz>> {
        if is_blank(raw) {
            return None;
        }
        let text = raw.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(dt.with_timezone(&self.tz));
        }
        if let Some(body) = strip_utc_marker(text) {
            return parse_naive(body).map(|naive| Utc.from_utc_datetime(&naive).with_timezone(&self.tz));
        }
        if let Some(dt) = parse_with_offset(text) {
            return Some(dt.with_timezone(&self.tz));
        }

        let naive = parse_naive(text)?;
        if self.naive_is_utc {
            Some(Utc.from_utc_datetime(&naive).with_timezone(&self.tz))
        } else {
            self.tz.from_local_datetime(&naive).earliest()
        }
    }
}

pub fn format_canonical(dt: &DateTime<Tz>) -> String {
    dt.format(CANONICAL_FORMAT).to_string()
}

/// Replaces a `T` date/time separator with a space. Only a `T` between two
/// digits counts, so zone suffixes such as `UTC` stay intact.
fn space_separated(raw: &str) -> String {
    let bytes = raw.as_bytes();
    raw.char_indices()
        .map(|(idx, ch)| {
            let between_digits = idx > 0
                && bytes[idx - 1].is_ascii_digit()
                && bytes.get(idx + 1).is_some_and(u8::is_ascii_digit);
            if ch == 'T' && between_digits {
                ' '
            } else {
                ch
            }
        })
        .collect()
}

/// Returns the body of a string that carries an explicit UTC marker.
fn strip_utc_marker(text: &str) -> Option<&str> {
    let upper = text.to_ascii_uppercase();
    for marker in [" UTC", "UTC", "+00:00", "+0000", "Z"] {
        if upper.ends_with(marker) {
            return Some(text[..text.len() - marker.len()].trim_end());
        }
    }
    None
}

fn parse_with_offset(text: &str) -> Option<DateTime<FixedOffset>> {
    OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(text, fmt).ok())
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NAIVE_DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}
