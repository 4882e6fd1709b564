//! Schema adapters for daily case-report CSVs.
//!
//! Upstream renamed and added columns several times. Each known header set is
//! a [`ReportSchema`] variant; [`SCHEMA_ADAPTERS`] lists them most specific
//! first and the first variant whose columns are all present in the header
//! row drives the parse. Columns are always looked up by name.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use covglobe_core::{NormalizedRow, CANONICAL_COLUMNS};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "covglobe-adapters";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unrecognized report header: {0}")]
    UnknownSchema(String),
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("writing canonical csv: {0}")]
    Write(#[from] std::io::Error),
    #[error("canonical csv is not utf-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReportSchema {
    /// `Incident_Rate` / `Case_Fatality_Ratio` (late 2020 onwards).
    IncidentRate,
    /// `Incidence_Rate` / `Case-Fatality_Ratio` (mid 2020).
    IncidenceRate,
    /// Underscore headers with `Combined_Key`, no derived rates.
    Admin2,
    /// `Province/State`, `Last Update`, `Latitude`/`Longitude`.
    ProvinceState,
}

pub const SCHEMA_ADAPTERS: [ReportSchema; 4] = [
    ReportSchema::IncidentRate,
    ReportSchema::IncidenceRate,
    ReportSchema::Admin2,
    ReportSchema::ProvinceState,
];

#[derive(Debug, Clone, Copy)]
struct SchemaColumns {
    country: &'static str,
    province: &'static str,
    last_update: &'static str,
    lat: &'static str,
    lng: &'static str,
    confirmed: &'static str,
    deaths: &'static str,
    combined_key: Option<&'static str>,
    incident_rate: Option<&'static str>,
    case_fatality: Option<&'static str>,
}

const UNDERSCORE_COLUMNS: SchemaColumns = SchemaColumns {
    country: "Country_Region",
    province: "Province_State",
    last_update: "Last_Update",
    lat: "Lat",
    lng: "Long_",
    confirmed: "Confirmed",
    deaths: "Deaths",
    combined_key: Some("Combined_Key"),
    incident_rate: None,
    case_fatality: None,
};

impl ReportSchema {
    fn columns(self) -> SchemaColumns {
        match self {
            Self::IncidentRate => SchemaColumns {
                incident_rate: Some("Incident_Rate"),
                case_fatality: Some("Case_Fatality_Ratio"),
                ..UNDERSCORE_COLUMNS
            },
            Self::IncidenceRate => SchemaColumns {
                incident_rate: Some("Incidence_Rate"),
                case_fatality: Some("Case-Fatality_Ratio"),
                ..UNDERSCORE_COLUMNS
            },
            Self::Admin2 => UNDERSCORE_COLUMNS,
            Self::ProvinceState => SchemaColumns {
                country: "Country/Region",
                province: "Province/State",
                last_update: "Last Update",
                lat: "Latitude",
                lng: "Longitude",
                confirmed: "Confirmed",
                deaths: "Deaths",
                combined_key: None,
                incident_rate: None,
                case_fatality: None,
            },
        }
    }

    pub fn detect(headers: &[String]) -> Option<Self> {
        SCHEMA_ADAPTERS
            .into_iter()
            .find(|schema| ColumnLayout::resolve(schema.columns(), headers).is_some())
    }
}

#[derive(Debug, Clone, Copy)]
struct ColumnLayout {
    country: usize,
    province: usize,
    last_update: usize,
    lat: usize,
    lng: usize,
    confirmed: usize,
    deaths: usize,
    combined_key: Option<usize>,
    incident_rate: Option<usize>,
    case_fatality: Option<usize>,
}

impl ColumnLayout {
    /// `None` unless every column the schema names is present.
    fn resolve(columns: SchemaColumns, headers: &[String]) -> Option<Self> {
        let find = |name: &str| headers.iter().position(|h| h == name);
        let find_optional = |name: Option<&str>| match name {
            Some(name) => find(name).map(Some),
            None => Some(None),
        };

        Some(Self {
            country: find(columns.country)?,
            province: find(columns.province)?,
            last_update: find(columns.last_update)?,
            lat: find(columns.lat)?,
            lng: find(columns.lng)?,
            confirmed: find(columns.confirmed)?,
            deaths: find(columns.deaths)?,
            combined_key: find_optional(columns.combined_key)?,
            incident_rate: find_optional(columns.incident_rate)?,
            case_fatality: find_optional(columns.case_fatality)?,
        })
    }

    fn row(&self, record: &csv::StringRecord) -> NormalizedRow {
        let text = |idx: usize| record.get(idx).unwrap_or_default().trim();
        let country = text(self.country).to_string();
        let full_location = match self.combined_key {
            Some(idx) => text(idx).to_string(),
            None => match text(self.province) {
                "" => country.clone(),
                province => format!("{province}, {country}"),
            },
        };

        NormalizedRow {
            lat: coerce_number(record.get(self.lat)),
            lng: coerce_number(record.get(self.lng)),
            confirmed: coerce_number(record.get(self.confirmed)),
            deaths: coerce_number(record.get(self.deaths)),
            full_location,
            country,
            incident_rate: coerce_number(self.incident_rate.and_then(|idx| record.get(idx))),
            case_fatality: coerce_number(self.case_fatality.and_then(|idx| record.get(idx))),
        }
    }
}

/// String to number coercion. A blank cell is 0; an absent column or
/// non-numeric text is NaN.
pub fn coerce_number(raw: Option<&str>) -> f64 {
    match raw.map(str::trim) {
        Some("") => 0.0,
        Some(text) => text.parse().unwrap_or(f64::NAN),
        None => f64::NAN,
    }
}

/// Shortest round-trip decimal; NaN and infinities spelled out.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        value.to_string()
    }
}

// %y before %Y: %Y would happily read "20" as the year 0020.
const LAST_UPDATE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%y %H:%M",
    "%m/%d/%Y %H:%M",
];

/// Row level `Last_Update` values, read as UTC.
pub fn parse_last_update(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    LAST_UPDATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReport {
    /// `None` only for empty input.
    pub schema: Option<ReportSchema>,
    pub rows: Vec<NormalizedRow>,
    /// Latest row-level update; `None` means no usable data.
    pub last_update: Option<DateTime<Utc>>,
    pub dropped_unlocated: usize,
}

impl NormalizedReport {
    fn empty() -> Self {
        Self {
            schema: None,
            rows: Vec::new(),
            last_update: None,
            dropped_unlocated: 0,
        }
    }

    pub fn to_canonical_csv(&self) -> Result<String, NormalizeError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(CANONICAL_COLUMNS)?;
        for row in &self.rows {
            writer.write_record([
                format_number(row.lat),
                format_number(row.lng),
                format_number(row.confirmed),
                format_number(row.deaths),
                row.full_location.clone(),
                row.country.clone(),
                format_number(row.incident_rate),
                format_number(row.case_fatality),
            ])?;
        }
        let bytes = writer.into_inner().map_err(|err| err.into_error())?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// Parse one upstream report into canonical rows.
pub fn normalize(raw_csv: &str) -> Result<NormalizedReport, NormalizeError> {
    let raw_csv = raw_csv.trim_start_matches('\u{feff}');
    if raw_csv.trim().is_empty() {
        return Ok(NormalizedReport::empty());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(raw_csv.as_bytes());

    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect::<Vec<_>>();
    let schema =
        ReportSchema::detect(&headers).ok_or_else(|| NormalizeError::UnknownSchema(headers.join(",")))?;
    let Some(layout) = ColumnLayout::resolve(schema.columns(), &headers) else {
        return Err(NormalizeError::UnknownSchema(headers.join(",")));
    };

    let mut rows = Vec::new();
    let mut last_update: Option<DateTime<Utc>> = None;
    let mut dropped_unlocated = 0usize;
    let mut unparsed_timestamps = 0usize;

    for record in reader.records() {
        let record = record?;

        match record.get(layout.last_update).and_then(parse_last_update) {
            Some(ts) => last_update = Some(last_update.map_or(ts, |current| current.max(ts))),
            None => unparsed_timestamps += 1,
        }

        let row = layout.row(&record);
        if row.is_unlocated() {
            dropped_unlocated += 1;
            continue;
        }
        rows.push(row);
    }

    debug!(
        ?schema,
        rows = rows.len(),
        dropped_unlocated,
        unparsed_timestamps,
        "normalized report"
    );

    Ok(NormalizedReport {
        schema: Some(schema),
        rows,
        last_update,
        dropped_unlocated,
    })
}
