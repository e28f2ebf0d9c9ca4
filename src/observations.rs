//! Raw RRP observation loading from the landing zone.

use std::collections::HashSet;
use std::io::Cursor;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifacts::{sort_newest_first, ArtifactError, ArtifactStore, ObjectMeta, LANDING_PREFIX};

pub const TIMESTAMP_COLUMN: &str = "SETTLEMENTDATE";
pub const PRICE_COLUMN: &str = "RRP";

pub const SETTLEMENT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const ACCEPTED_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: NaiveDateTime,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObservationLoadReport {
    pub files_read: u64,
    pub rows_read: u64,
    pub unparsable_timestamps: u64,
    pub misaligned_rows: u64,
    pub duplicates_removed: u64,
    pub null_prices: u64,
    pub output_rows: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationBatch {
    pub observations: Vec<Observation>,
    pub report: ObservationLoadReport,
}

impl ObservationBatch {
    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.observations.last().map(|obs| obs.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSelection {
    Latest(usize),
    ModifiedSince(DateTime<Utc>),
}

#[derive(Debug, Error)]
pub enum ObservationError {
    #[error("no raw observation files under {0}")]
    NoSourceFiles(String),
    #[error("no usable observations in {files} source file(s)")]
    NoRows { files: u64 },
    #[error("source file {key} is missing column {column}")]
    MissingColumn { key: String, column: &'static str },
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("CSV error in {key}: {source}")]
    Csv {
        key: String,
        #[source]
        source: csv::Error,
    },
}

pub fn parse_settlement_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    ACCEPTED_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
}

pub fn format_settlement_timestamp(ts: NaiveDateTime) -> String {
    ts.format(SETTLEMENT_FORMAT).to_string()
}

pub fn is_interval_aligned(ts: NaiveDateTime, interval: ChronoDuration) -> bool {
    let minutes = interval.num_minutes();
    if minutes <= 0 {
        return false;
    }
    let minute_of_day = i64::from(ts.hour()) * 60 + i64::from(ts.minute());
    ts.second() == 0 && ts.nanosecond() == 0 && minute_of_day % minutes == 0
}

pub fn load_observations(
    store: &dyn ArtifactStore,
    selection: SourceSelection,
    interval: ChronoDuration,
) -> Result<ObservationBatch, ObservationError> {
    let mut files = store.list(LANDING_PREFIX)?;
    files.retain(|meta| meta.key.to_ascii_lowercase().ends_with(".csv"));
    sort_newest_first(&mut files);
    let selected: Vec<ObjectMeta> = match selection {
        SourceSelection::Latest(n) => files.into_iter().take(n).collect(),
        SourceSelection::ModifiedSince(cutoff) => files
            .into_iter()
            .filter(|meta| meta.last_modified >= cutoff)
            .collect(),
    };

    if selected.is_empty() {
        return Err(ObservationError::NoSourceFiles(LANDING_PREFIX.to_string()));
    }

    info!(
        component = "observations",
        event = "observations.load.start",
        files = ?selected.iter().map(|m| m.key.as_str()).collect::<Vec<_>>(),
        interval_minutes = interval.num_minutes()
    );

    let mut report = ObservationLoadReport::default();
    let mut seen = HashSet::new();
    let mut observations = Vec::new();

    // Newest file first, so the first value seen for a timestamp wins.
    for meta in &selected {
        let bytes = store.get(&meta.key)?;
        let rows = parse_observation_csv(&meta.key, &bytes, interval, &mut report)?;
        report.files_read += 1;
        for obs in rows {
            if seen.insert(obs.timestamp) {
                observations.push(obs);
            } else {
                report.duplicates_removed += 1;
            }
        }
    }

    observations.sort_by_key(|obs| obs.timestamp);
    report.null_prices = observations.iter().filter(|o| o.price.is_none()).count() as u64;
    report.output_rows = observations.len() as u64;

    if report.unparsable_timestamps > 0 {
        warn!(
            component = "observations",
            event = "observations.load.unparsable_timestamps",
            dropped = report.unparsable_timestamps
        );
    }

    info!(
        component = "observations",
        event = "observations.load.finish",
        files_read = report.files_read,
        rows_read = report.rows_read,
        misaligned_rows = report.misaligned_rows,
        duplicates_removed = report.duplicates_removed,
        null_prices = report.null_prices,
        output_rows = report.output_rows
    );

    if observations.is_empty() {
        return Err(ObservationError::NoRows {
            files: report.files_read,
        });
    }

    Ok(ObservationBatch {
        observations,
        report,
    })
}

fn parse_observation_csv(
    key: &str,
    bytes: &[u8],
    interval: ChronoDuration,
    report: &mut ObservationLoadReport,
) -> Result<Vec<Observation>, ObservationError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(Cursor::new(bytes));

    let headers = reader
        .headers()
        .map_err(|source| ObservationError::Csv {
            key: key.to_string(),
            source,
        })?
        .clone();
    let ts_idx = column_index(&headers, TIMESTAMP_COLUMN).ok_or_else(|| {
        ObservationError::MissingColumn {
            key: key.to_string(),
            column: TIMESTAMP_COLUMN,
        }
    })?;
    let price_idx =
        column_index(&headers, PRICE_COLUMN).ok_or_else(|| ObservationError::MissingColumn {
            key: key.to_string(),
            column: PRICE_COLUMN,
        })?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| ObservationError::Csv {
            key: key.to_string(),
            source,
        })?;
        report.rows_read += 1;

        let raw_ts = record.get(ts_idx).unwrap_or_default();
        let Some(timestamp) = parse_settlement_timestamp(raw_ts) else {
            report.unparsable_timestamps += 1;
            debug!(
                component = "observations",
                event = "observations.row.unparsable_timestamp",
                key,
                value = raw_ts
            );
            continue;
        };
        if !is_interval_aligned(timestamp, interval) {
            report.misaligned_rows += 1;
            continue;
        }

        let price = record
            .get(price_idx)
            .map(str::trim)
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite());
        rows.push(Observation { timestamp, price });
    }

    Ok(rows)
}

fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}
