//! Core domain model for the daily report globe.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "covglobe-core";

/// Key format used by upstream report filenames and stored records.
pub const REPORT_DATE_FORMAT: &str = "%m-%d-%Y";

/// Canonical column order of [`ReportRecord::data`].
pub const CANONICAL_COLUMNS: [&str; 8] = [
    "lat",
    "lng",
    "confirmed",
    "deaths",
    "fullLocation",
    "country",
    "incidentRate",
    "caseFatality",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid report date {input:?}: expected MM-DD-YYYY")]
pub struct ReportDateError {
    pub input: String,
}

/// Calendar day of a report, keyed as `MM-DD-YYYY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportDate(NaiveDate);

impl ReportDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn naive(&self) -> NaiveDate {
        self.0
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Upstream publishes with a one-day lag, so "today" resolves to yesterday.
    pub fn latest_published(now: DateTime<Utc>) -> Self {
        Self(now.date_naive() - Days::new(1))
    }

    pub fn key(&self) -> String {
        self.0.format(REPORT_DATE_FORMAT).to_string()
    }
}

impl FromStr for ReportDate {
    type Err = ReportDateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // chrono accepts unpadded fields, keys must be exactly MM-DD-YYYY
        let well_formed = s.len() == 10
            && s.char_indices()
                .all(|(i, c)| if i == 2 || i == 5 { c == '-' } else { c.is_ascii_digit() });
        if !well_formed {
            return Err(ReportDateError { input: s.to_string() });
        }
        NaiveDate::parse_from_str(s, REPORT_DATE_FORMAT)
            .map(Self)
            .map_err(|_| ReportDateError { input: s.to_string() })
    }
}

impl fmt::Display for ReportDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(REPORT_DATE_FORMAT))
    }
}

/// One remote directory entry: file name plus its immutable content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub content_id: String,
}

/// Canonical persisted unit: one calendar day's normalized report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub date: String,
    pub last_update: DateTime<Utc>,
    pub data: String,
}

impl ReportRecord {
    pub fn report_date(&self) -> Result<ReportDate, ReportDateError> {
        self.date.parse()
    }

    /// SHA-256 of the stored CSV text, used for change detection.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.data.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Transient normalized row. Numeric fields keep NaN for missing input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRow {
    pub lat: f64,
    pub lng: f64,
    pub confirmed: f64,
    pub deaths: f64,
    pub full_location: String,
    pub country: String,
    pub incident_rate: f64,
    pub case_fatality: f64,
}

impl NormalizedRow {
    /// `(0, 0)` is the upstream sentinel for an unresolved location.
    pub fn is_unlocated(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }
}

/// Chronological extremes over all stored report dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub min: ReportDate,
    pub max: ReportDate,
}

impl DateRange {
    pub fn from_dates(dates: impl IntoIterator<Item = ReportDate>) -> Option<Self> {
        dates.into_iter().fold(None, |acc, date| match acc {
            None => Some(Self { min: date, max: date }),
            Some(range) => Some(Self {
                min: range.min.min(date),
                max: range.max.max(date),
            }),
        })
    }
}

impl Serialize for DateRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("DateRange", 2)?;
        state.serialize_field("min", &self.min.key())?;
        state.serialize_field("max", &self.max.key())?;
        state.end()
    }
}
