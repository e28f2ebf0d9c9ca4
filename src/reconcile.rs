//! Splits inference output into Actual/Forecast records and publishes them.

use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::forecast_store::{ForecastRecord, ForecastStore, PeriodType, ReplaceReport, StoreError};
use crate::inference::InferenceOutput;
use crate::observations::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub actual_tail: usize,
    pub ttl: ChronoDuration,
    pub write_chunk_size: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            actual_tail: 48,
            ttl: ChronoDuration::days(1),
            write_chunk_size: 25,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("ttl must be positive, got {0} seconds")]
    NonPositiveTtl(i64),
    #[error("ttl of {0} seconds overflows the expiry timestamp")]
    TtlOutOfRange(i64),
    #[error("expected {expected} forecast rows, inference produced {found}")]
    ForecastCount { expected: usize, found: usize },
    #[error("timestamp {0} would be written twice")]
    DuplicateTimestamp(NaiveDateTime),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub actual_records: usize,
    pub forecast_records: usize,
    pub null_actuals_skipped: usize,
    pub expires_at: i64,
    pub store: ReplaceReport,
}

pub fn build_records(
    observations: &[Observation],
    output: &InferenceOutput,
    now: DateTime<Utc>,
    settings: ReconcileSettings,
) -> Result<Vec<ForecastRecord>, ReconcileError> {
    if settings.ttl <= ChronoDuration::zero() {
        return Err(ReconcileError::NonPositiveTtl(settings.ttl.num_seconds()));
    }
    let expires_at = now
        .checked_add_signed(settings.ttl)
        .ok_or(ReconcileError::TtlOutOfRange(settings.ttl.num_seconds()))?
        .timestamp();

    let forecasts: Vec<ForecastRecord> = output
        .horizon_rows()
        .map(|row| ForecastRecord {
            timestamp: row.timestamp,
            price: row.predicted,
            period_type: PeriodType::Forecast,
            expires_at,
        })
        .collect();
    if forecasts.len() != output.horizon.len() {
        return Err(ReconcileError::ForecastCount {
            expected: output.horizon.len(),
            found: forecasts.len(),
        });
    }

    let tail_start = observations.len().saturating_sub(settings.actual_tail);
    let tail = &observations[tail_start..];
    let actuals: Vec<ForecastRecord> = tail
        .iter()
        .filter_map(|obs| {
            obs.price.map(|price| ForecastRecord {
                timestamp: obs.timestamp,
                price,
                period_type: PeriodType::Actual,
                expires_at,
            })
        })
        .collect();

    let mut records = actuals;
    records.extend(forecasts);

    let mut seen = HashSet::with_capacity(records.len());
    for record in &records {
        if !seen.insert(record.timestamp) {
            return Err(ReconcileError::DuplicateTimestamp(record.timestamp));
        }
    }

    Ok(records)
}

pub fn reconcile_and_publish(
    store: &dyn ForecastStore,
    observations: &[Observation],
    output: &InferenceOutput,
    now: DateTime<Utc>,
    settings: ReconcileSettings,
) -> Result<ReconcileSummary, ReconcileError> {
    let records = build_records(observations, output, now, settings)?;
    let actual_records = records
        .iter()
        .filter(|r| r.period_type == PeriodType::Actual)
        .count();
    let forecast_records = records.len() - actual_records;
    let tail_len = observations.len().min(settings.actual_tail);
    let expires_at = now
        .checked_add_signed(settings.ttl)
        .ok_or(ReconcileError::TtlOutOfRange(settings.ttl.num_seconds()))?
        .timestamp();

    let report = store.replace_all(&records, settings.write_chunk_size)?;

    info!(
        component = "reconcile",
        event = "reconcile.store.replaced",
        actual_records,
        forecast_records,
        generation = report.generation,
        chunks = report.chunks,
        expires_at
    );

    Ok(ReconcileSummary {
        actual_records,
        forecast_records,
        null_actuals_skipped: tail_len - actual_records,
        expires_at,
        store: report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{run_inference, InferenceSettings};
    use crate::model::{ModelError, PriceModel};
    use crate::features::FeatureMatrix;
    use chrono::{NaiveDate, TimeZone};

    struct Constant;

    impl PriceModel for Constant {
        fn feature_columns(&self) -> &[String] {
            &[]
        }

        fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
            Ok(vec![42.0; features.len()])
        }
    }

    fn ts(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap()
    }

    fn series(len: usize, null_every: usize) -> Vec<Observation> {
        (0..len)
            .map(|i| Observation {
                timestamp: ts(1, 0, 0) + ChronoDuration::minutes(30 * i as i64),
                price: if null_every > 0 && i % null_every == 0 {
                    None
                } else {
                    Some(i as f64)
                },
            })
            .collect()
    }

    #[test]
    fn full_series_yields_48_of_each_kind() {
        let observed = series(96, 0);
        let output = run_inference(&observed, &Constant, InferenceSettings::default()).unwrap();
        let records = build_records(&observed, &output, now(), ReconcileSettings::default()).unwrap();

        let actual: Vec<_> = records
            .iter()
            .filter(|r| r.period_type == PeriodType::Actual)
            .collect();
        let forecast: Vec<_> = records
            .iter()
            .filter(|r| r.period_type == PeriodType::Forecast)
            .collect();
        assert_eq!(actual.len(), 48);
        assert_eq!(forecast.len(), 48);
        assert_eq!(actual[0].timestamp, observed[48].timestamp);
        assert_eq!(actual[0].price, 48.0);
        assert_eq!(forecast[0].timestamp, observed[95].timestamp + ChronoDuration::minutes(30));
        assert!(forecast.iter().all(|r| r.price == 42.0));
        assert!(records.iter().all(|r| r.expires_at > now().timestamp()));
        assert_eq!(records[0].expires_at, now().timestamp() + 86_400);
    }

    #[test]
    fn null_trailing_actuals_are_skipped() {
        let observed = series(60, 4);
        let output = run_inference(&observed, &Constant, InferenceSettings::default()).unwrap();
        let records = build_records(&observed, &output, now(), ReconcileSettings::default()).unwrap();

        let actuals = records
            .iter()
            .filter(|r| r.period_type == PeriodType::Actual)
            .count();
        // Tail is indices 12..60; every fourth one is null.
        assert_eq!(actuals, 36);
    }

    #[test]
    fn short_series_with_null_lags_still_emits_records() {
        let observed = vec![
            Observation {
                timestamp: ts(1, 0, 0),
                price: Some(100.0),
            },
            Observation {
                timestamp: ts(1, 0, 30),
                price: Some(120.0),
            },
        ];
        let output = run_inference(&observed, &Constant, InferenceSettings::default()).unwrap();
        let records = build_records(&observed, &output, now(), ReconcileSettings::default()).unwrap();
        assert_eq!(records.len(), 50);
        assert_eq!(records[0].period_type, PeriodType::Actual);
        assert_eq!(records[2].period_type, PeriodType::Forecast);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let observed = series(4, 0);
        let output = run_inference(&observed, &Constant, InferenceSettings::default()).unwrap();
        let settings = ReconcileSettings {
            ttl: ChronoDuration::zero(),
            ..ReconcileSettings::default()
        };
        assert!(matches!(
            build_records(&observed, &output, now(), settings).unwrap_err(),
            ReconcileError::NonPositiveTtl(0)
        ));
    }

    #[test]
    fn ttl_past_the_calendar_range_is_rejected() {
        let observed = series(4, 0);
        let output = run_inference(&observed, &Constant, InferenceSettings::default()).unwrap();
        let settings = ReconcileSettings {
            ttl: ChronoDuration::days(1_000_000_000),
            ..ReconcileSettings::default()
        };
        assert!(matches!(
            build_records(&observed, &output, now(), settings).unwrap_err(),
            ReconcileError::TtlOutOfRange(_)
        ));
    }
}
