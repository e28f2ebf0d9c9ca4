//! Observed series + horizon -> feature window -> model predictions.

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{
    build_feature_vectors, extend_timeline, FeatureError, FeatureMatrix, Horizon, HorizonPolicy,
    LagResolver,
};
use crate::model::{ModelError, PriceModel};
use crate::observations::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceSettings {
    pub horizon: HorizonPolicy,
    pub lag_offset: ChronoDuration,
    pub window: usize,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        let horizon = HorizonPolicy::default();
        Self {
            horizon,
            lag_offset: ChronoDuration::days(1),
            window: horizon.length + 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("observed series is empty")]
    EmptySeries,
    #[error("observed series is not strictly increasing at {0}")]
    UnsortedInput(NaiveDateTime),
    #[error("inference window {window} must exceed horizon length {horizon}")]
    WindowTooSmall { window: usize, horizon: usize },
    #[error("feature error: {0}")]
    Feature(#[from] FeatureError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("model returned {found} predictions for {expected} rows")]
    OutputLength { expected: usize, found: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PredictedRow {
    pub timestamp: NaiveDateTime,
    pub predicted: f64,
    pub in_horizon: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceOutput {
    pub horizon: Horizon,
    pub features: FeatureMatrix,
    pub rows: Vec<PredictedRow>,
}

impl InferenceOutput {
    pub fn horizon_rows(&self) -> impl Iterator<Item = &PredictedRow> {
        self.rows.iter().filter(|row| row.in_horizon)
    }
}

pub fn run_inference(
    observations: &[Observation],
    model: &dyn PriceModel,
    settings: InferenceSettings,
) -> Result<InferenceOutput, InferenceError> {
    if settings.window <= settings.horizon.length {
        return Err(InferenceError::WindowTooSmall {
            window: settings.window,
            horizon: settings.horizon.length,
        });
    }
    let last_observed = validate_series(observations)?;

    let horizon = extend_timeline(last_observed, settings.horizon)?;
    let combined: Vec<NaiveDateTime> = observations
        .iter()
        .map(|obs| obs.timestamp)
        .chain(horizon.steps().iter().copied())
        .collect();

    // Lags come from the full observed series; only the window is scored.
    let lags = LagResolver::from_observations(observations, settings.lag_offset);
    let window_start = combined.len().saturating_sub(settings.window);
    let window = &combined[window_start..];
    let vectors = build_feature_vectors(window, &lags);
    let features = FeatureMatrix::from_vectors(&vectors);

    let missing = features.missing_count();
    if missing > 0 {
        warn!(
            component = "inference",
            event = "inference.features.null_lags",
            rows = features.len(),
            missing
        );
    }

    info!(
        component = "inference",
        event = "inference.predict.start",
        observed_rows = observations.len(),
        horizon_rows = horizon.len(),
        window_rows = features.len(),
        first_horizon = ?horizon.first()
    );

    let predictions = model.predict(&features)?;
    if predictions.len() != features.len() {
        return Err(InferenceError::OutputLength {
            expected: features.len(),
            found: predictions.len(),
        });
    }

    let rows: Vec<PredictedRow> = window
        .iter()
        .zip(&predictions)
        .map(|(ts, predicted)| PredictedRow {
            timestamp: *ts,
            predicted: *predicted,
            in_horizon: *ts > last_observed,
        })
        .collect();

    info!(
        component = "inference",
        event = "inference.predict.finish",
        rows = rows.len(),
        horizon_rows = rows.iter().filter(|r| r.in_horizon).count()
    );

    Ok(InferenceOutput {
        horizon,
        features,
        rows,
    })
}

fn validate_series(observations: &[Observation]) -> Result<NaiveDateTime, InferenceError> {
    let last = observations
        .last()
        .map(|obs| obs.timestamp)
        .ok_or(InferenceError::EmptySeries)?;
    for pair in observations.windows(2) {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(InferenceError::UnsortedInput(pair[1].timestamp));
        }
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    // Echoes the lag column, or -1 when it is null.
    struct LagEcho {
        columns: Vec<String>,
    }

    impl LagEcho {
        fn new() -> Self {
            Self {
                columns: crate::features::feature_column_names(),
            }
        }
    }

    impl PriceModel for LagEcho {
        fn feature_columns(&self) -> &[String] {
            &self.columns
        }

        fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
            Ok(features
                .rows
                .iter()
                .map(|row| row[0].unwrap_or(-1.0))
                .collect())
        }
    }

    struct ShortOutput;

    impl PriceModel for ShortOutput {
        fn feature_columns(&self) -> &[String] {
            &[]
        }

        fn predict(&self, _features: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
            Ok(vec![1.0])
        }
    }

    fn ts(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 5, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn day_series(day: u32, base: f64) -> Vec<Observation> {
        (0..48)
            .map(|i| Observation {
                timestamp: ts(day, (i / 2) as u32, ((i % 2) * 30) as u32),
                price: Some(base + i as f64),
            })
            .collect()
    }

    #[test]
    fn window_is_one_actual_plus_horizon_with_exact_lags() {
        let mut observed = day_series(1, 100.0);
        observed.extend(day_series(2, 200.0));
        let out = run_inference(&observed, &LagEcho::new(), InferenceSettings::default()).unwrap();

        assert_eq!(out.rows.len(), 49);
        assert_eq!(out.horizon.len(), 48);
        assert!(!out.rows[0].in_horizon);
        assert_eq!(out.rows[0].timestamp, ts(2, 23, 30));
        // Lag for the last actual is 2025-05-01 23:30.
        assert_eq!(out.rows[0].predicted, 147.0);
        // First horizon step is 2025-05-03 00:00, lag 2025-05-02 00:00.
        assert_eq!(out.rows[1].timestamp, ts(3, 0, 0));
        assert_eq!(out.rows[1].predicted, 200.0);
        assert_eq!(out.horizon_rows().count(), 48);
    }

    #[test]
    fn short_series_without_lags_does_not_fail() {
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
        let out = run_inference(&observed, &LagEcho::new(), InferenceSettings::default()).unwrap();

        // Window cannot be filled past the combined length of 50.
        assert_eq!(out.rows.len(), 49);
        assert_eq!(out.rows[0].timestamp, ts(1, 0, 30));
        assert_eq!(out.features.rows[0][0], None);
        assert!(out.rows[..47].iter().all(|r| r.predicted == -1.0));
        // The final two steps land exactly one day after the observations.
        assert_eq!(out.rows[47].timestamp, ts(2, 0, 0));
        assert_eq!(out.rows[47].predicted, 100.0);
        assert_eq!(out.rows[48].timestamp, ts(2, 0, 30));
        assert_eq!(out.rows[48].predicted, 120.0);
    }

    #[test]
    fn unsorted_input_is_rejected() {
        let observed = vec![
            Observation {
                timestamp: ts(1, 1, 0),
                price: Some(1.0),
            },
            Observation {
                timestamp: ts(1, 0, 30),
                price: Some(1.0),
            },
        ];
        assert!(matches!(
            run_inference(&observed, &LagEcho::new(), InferenceSettings::default()).unwrap_err(),
            InferenceError::UnsortedInput(_)
        ));
    }

    #[test]
    fn mismatched_prediction_count_is_an_error() {
        let observed = day_series(1, 10.0);
        assert!(matches!(
            run_inference(&observed, &ShortOutput, InferenceSettings::default()).unwrap_err(),
            InferenceError::OutputLength {
                expected: 49,
                found: 1
            }
        ));
    }

    #[test]
    fn empty_series_is_rejected() {
        assert!(matches!(
            run_inference(&[], &LagEcho::new(), InferenceSettings::default()).unwrap_err(),
            InferenceError::EmptySeries
        ));
    }
}
