//! Calendar features, exact-offset lag resolution and horizon extension.

use std::collections::HashMap;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::observations::Observation;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const FEATURE_COLUMNS: [&str; 5] = ["lag1_price", "hour", "day_of_week", "month", "day_of_year"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureError {
    #[error("horizon step must be positive, got {0} minutes")]
    InvalidStep(i64),
    #[error("timestamp overflow extending horizon past {0}")]
    TimestampOverflow(NaiveDateTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarFeatures {
    pub hour: u32,
    pub day_of_week: u32,
    pub month: u32,
    pub day_of_year: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub timestamp: NaiveDateTime,
    pub lag1_price: Option<f64>,
    pub hour: u32,
    pub day_of_week: u32,
    pub month: u32,
    pub day_of_year: u32,
}

impl FeatureVector {
    pub fn values(&self) -> [Option<f64>; 5] {
        [
            self.lag1_price,
            Some(f64::from(self.hour)),
            Some(f64::from(self.day_of_week)),
            Some(f64::from(self.month)),
            Some(f64::from(self.day_of_year)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub timestamps: Vec<NaiveDateTime>,
    pub rows: Vec<Vec<Option<f64>>>,
}

impl FeatureMatrix {
    pub fn from_vectors(vectors: &[FeatureVector]) -> Self {
        Self {
            columns: feature_column_names(),
            timestamps: vectors.iter().map(|v| v.timestamp).collect(),
            rows: vectors.iter().map(|v| v.values().to_vec()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn missing_count(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .filter(|cell| cell.is_none())
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonPolicy {
    pub length: usize,
    pub step: ChronoDuration,
}

impl Default for HorizonPolicy {
    fn default() -> Self {
        Self {
            length: 48,
            step: ChronoDuration::minutes(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Horizon {
    steps: Vec<NaiveDateTime>,
}

impl Horizon {
    pub fn steps(&self) -> &[NaiveDateTime] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn first(&self) -> Option<NaiveDateTime> {
        self.steps.first().copied()
    }

    pub fn contains(&self, ts: &NaiveDateTime) -> bool {
        self.steps.binary_search(ts).is_ok()
    }
}

pub fn calendar_features(ts: NaiveDateTime) -> CalendarFeatures {
    CalendarFeatures {
        hour: ts.hour(),
        day_of_week: ts.weekday().num_days_from_monday(),
        month: ts.month(),
        day_of_year: ts.ordinal(),
    }
}

#[derive(Debug, Clone)]
pub struct LagResolver {
    table: HashMap<NaiveDateTime, f64>,
    offset: ChronoDuration,
}

impl LagResolver {
    // Observations with a null price are left out of the table, so a lag onto
    // them resolves to `None` like any other absent timestamp.
    pub fn from_observations(observations: &[Observation], offset: ChronoDuration) -> Self {
        let table = observations
            .iter()
            .filter_map(|obs| obs.price.map(|price| (obs.timestamp, price)))
            .collect();
        Self { table, offset }
    }

    pub fn offset(&self) -> ChronoDuration {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn resolve(&self, ts: NaiveDateTime) -> Option<f64> {
        let target = ts.checked_sub_signed(self.offset)?;
        self.table.get(&target).copied()
    }
}

pub fn extend_timeline(
    last_observed: NaiveDateTime,
    policy: HorizonPolicy,
) -> Result<Horizon, FeatureError> {
    if policy.step <= ChronoDuration::zero() {
        return Err(FeatureError::InvalidStep(policy.step.num_minutes()));
    }

    let mut steps = Vec::with_capacity(policy.length);
    let mut cursor = last_observed;
    for _ in 0..policy.length {
        cursor = cursor
            .checked_add_signed(policy.step)
            .ok_or(FeatureError::TimestampOverflow(cursor))?;
        steps.push(cursor);
    }

    debug!(
        component = "features",
        event = "features.horizon.extended",
        last_observed = %last_observed,
        steps = steps.len(),
        step_minutes = policy.step.num_minutes()
    );

    Ok(Horizon { steps })
}

pub fn build_feature_vector(ts: NaiveDateTime, lags: &LagResolver) -> FeatureVector {
    let calendar = calendar_features(ts);
    FeatureVector {
        timestamp: ts,
        lag1_price: lags.resolve(ts),
        hour: calendar.hour,
        day_of_week: calendar.day_of_week,
        month: calendar.month,
        day_of_year: calendar.day_of_year,
    }
}

pub fn build_feature_vectors(timestamps: &[NaiveDateTime], lags: &LagResolver) -> Vec<FeatureVector> {
    let vectors: Vec<FeatureVector> = timestamps
        .iter()
        .map(|ts| build_feature_vector(*ts, lags))
        .collect();

    let null_lags = vectors.iter().filter(|v| v.lag1_price.is_none()).count();
    info!(
        component = "features",
        event = "features.vectors.built",
        rows = vectors.len(),
        null_lags,
        lag_offset_minutes = lags.offset().num_minutes()
    );

    vectors
}

pub fn feature_column_names() -> Vec<String> {
    FEATURE_COLUMNS.iter().map(|c| (*c).to_string()).collect()
}

pub fn feature_fingerprint(columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
