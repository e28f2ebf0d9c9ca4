//! Weekly training-set curation and incremental model versioning.

use std::collections::HashSet;
use std::io::Cursor;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::artifacts::{
    sort_newest_first, ArtifactError, ArtifactStore, CHECKPOINT_PREFIX, CURATED_PREFIX,
    LATEST_MODEL_KEY,
};
use crate::features::{build_feature_vectors, feature_column_names, FeatureMatrix, LagResolver};
use crate::forecast_store::StoreError;
use crate::model::{evaluate, EvaluationMetrics, FitReport, ModelError, PriceModel, RidgeModel};
use crate::observations::{
    format_settlement_timestamp, load_observations, parse_settlement_timestamp, ObservationError,
    ObservationLoadReport, SourceSelection, PRICE_COLUMN, TIMESTAMP_COLUMN,
};
use crate::registry::{ModelRegistry, ModelVersion, NewModelVersion};
use crate::spike::market_local_now;

pub const CURATED_FILE_NAME: &str = "part-00000.csv";
pub const METRIC_DECIMALS: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSettings {
    pub ridge_lambda: f64,
    pub market_timezone: Tz,
    pub lag_offset: ChronoDuration,
    pub interval: ChronoDuration,
    pub curation_lookback: ChronoDuration,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            ridge_lambda: 1e-6,
            market_timezone: chrono_tz::Australia::Brisbane,
            lag_offset: ChronoDuration::days(1),
            interval: ChronoDuration::minutes(30),
            curation_lookback: ChronoDuration::days(7),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("no training data under {0}")]
    NoTrainingData(String),
    #[error("training file {key} is missing column {column}")]
    MissingColumn { key: String, column: String },
    #[error("training file {key} row {row}: bad {column} value '{value}'")]
    InvalidValue {
        key: String,
        row: usize,
        column: String,
        value: String,
    },
    #[error("CSV error in {key}: {source}")]
    Csv {
        key: String,
        #[source]
        source: csv::Error,
    },
    #[error("no complete rows to curate from {0} observation(s)")]
    NothingToCurate(usize),
    #[error("observation error: {0}")]
    Observation(#[from] ObservationError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("artifact read failed: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("failed to write {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: ArtifactError,
    },
    #[error("registry error: {0}")]
    Registry(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationSummary {
    pub training_week: u32,
    pub key: String,
    pub rows_written: usize,
    pub rows_dropped: usize,
    pub load: ObservationLoadReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub version: ModelVersion,
    pub checkpoint_key: String,
    pub resumed_from: Option<String>,
    pub fit: FitReport,
    pub metrics: EvaluationMetrics,
}

pub fn training_week(now: DateTime<Utc>, tz: Tz) -> u32 {
    market_local_now(now, tz).iso_week().week()
}

pub fn training_data_prefix(week: u32) -> String {
    format!("{CURATED_PREFIX}training-data-week-{week}/")
}

pub fn checkpoint_key(now: DateTime<Utc>) -> String {
    format!("{CHECKPOINT_PREFIX}model_{}.json", now.format("%Y%m%d%H%M%S%6f"))
}

// Suffixes the timestamped key until it names no existing checkpoint.
fn unused_checkpoint_key(
    store: &dyn ArtifactStore,
    now: DateTime<Utc>,
) -> Result<String, TrainingError> {
    let taken: HashSet<String> = store
        .list(CHECKPOINT_PREFIX)?
        .into_iter()
        .map(|meta| meta.key)
        .collect();
    let base = checkpoint_key(now);
    if !taken.contains(&base) {
        return Ok(base);
    }
    let stem = base.trim_end_matches(".json");
    let mut attempt = 1u32;
    loop {
        let candidate = format!("{stem}_{attempt:03}.json");
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        attempt += 1;
    }
}

pub fn curate_training_set(
    store: &dyn ArtifactStore,
    now: DateTime<Utc>,
    settings: TrainingSettings,
) -> Result<CurationSummary, TrainingError> {
    let cutoff = now - settings.curation_lookback;
    let batch = load_observations(store, SourceSelection::ModifiedSince(cutoff), settings.interval)?;

    let lags = LagResolver::from_observations(&batch.observations, settings.lag_offset);
    let timestamps: Vec<NaiveDateTime> = batch.observations.iter().map(|o| o.timestamp).collect();
    let vectors = build_feature_vectors(&timestamps, &lags);

    let week = training_week(now, settings.market_timezone);
    let key = format!("{}{CURATED_FILE_NAME}", training_data_prefix(week));
    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_err = |source| TrainingError::Csv {
        key: key.clone(),
        source,
    };

    let mut header = vec![TIMESTAMP_COLUMN.to_string(), PRICE_COLUMN.to_string()];
    header.extend(feature_column_names());
    writer.write_record(&header).map_err(csv_err)?;

    let mut rows_written = 0usize;
    for (obs, vector) in batch.observations.iter().zip(&vectors) {
        let (Some(price), Some(lag)) = (obs.price, vector.lag1_price) else {
            continue;
        };
        writer
            .write_record([
                format_settlement_timestamp(obs.timestamp),
                price.to_string(),
                lag.to_string(),
                vector.hour.to_string(),
                vector.day_of_week.to_string(),
                vector.month.to_string(),
                vector.day_of_year.to_string(),
            ])
            .map_err(csv_err)?;
        rows_written += 1;
    }

    let rows_dropped = batch.observations.len() - rows_written;
    if rows_written == 0 {
        return Err(TrainingError::NothingToCurate(batch.observations.len()));
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| csv_err(err.into_error().into()))?;
    store.put(&key, &bytes).map_err(|source| TrainingError::Write {
        key: key.clone(),
        source,
    })?;

    info!(
        component = "training",
        event = "training.curate.finish",
        key = %key,
        rows_written,
        rows_dropped
    );

    Ok(CurationSummary {
        training_week: week,
        key,
        rows_written,
        rows_dropped,
        load: batch.report,
    })
}

pub fn load_latest_checkpoint(store: &dyn ArtifactStore) -> Option<(String, RidgeModel)> {
    let mut checkpoints = match store.list(CHECKPOINT_PREFIX) {
        Ok(list) => list,
        Err(err) => {
            warn!(
                component = "training",
                event = "training.checkpoint.list_failed",
                error = %err
            );
            return None;
        }
    };
    checkpoints.retain(|meta| meta.key.ends_with(".json"));
    sort_newest_first(&mut checkpoints);

    let Some(latest) = checkpoints.into_iter().next() else {
        warn!(
            component = "training",
            event = "training.checkpoint.none",
            prefix = CHECKPOINT_PREFIX
        );
        return None;
    };

    match store
        .get(&latest.key)
        .map_err(TrainingError::from)
        .and_then(|bytes| RidgeModel::load(&bytes).map_err(TrainingError::from))
    {
        Ok(model) => {
            info!(
                component = "training",
                event = "training.checkpoint.loaded",
                key = %latest.key,
                rows_seen = model.rows_seen(),
                training_rounds = model.training_rounds()
            );
            Some((latest.key, model))
        }
        Err(err) => {
            warn!(
                component = "training",
                event = "training.checkpoint.unreadable",
                key = %latest.key,
                error = %err
            );
            None
        }
    }
}

pub fn train_model_version(
    store: &dyn ArtifactStore,
    registry: &dyn ModelRegistry,
    now: DateTime<Utc>,
    settings: TrainingSettings,
) -> Result<TrainingSummary, TrainingError> {
    let week = training_week(now, settings.market_timezone);
    let prefix = training_data_prefix(week);
    let mut files = store.list(&prefix)?;
    files.retain(|meta| meta.key.to_ascii_lowercase().ends_with(".csv"));
    files.sort_by(|a, b| a.key.cmp(&b.key));
    let Some(source) = files.into_iter().next() else {
        return Err(TrainingError::NoTrainingData(prefix));
    };

    let bytes = store.get(&source.key)?;
    let (features, targets) = parse_training_csv(&source.key, &bytes)?;

    info!(
        component = "training",
        event = "training.data.loaded",
        key = %source.key,
        training_week = week,
        rows = features.len()
    );

    let (resumed_from, mut model) = match load_latest_checkpoint(store) {
        Some((key, model)) => (Some(key), model),
        None => (None, RidgeModel::new(settings.ridge_lambda)),
    };
    let fit = model.fit(&features, &targets)?;

    let model_bytes = model.to_bytes()?;
    let checkpoint = unused_checkpoint_key(store, now)?;
    for key in [checkpoint.as_str(), LATEST_MODEL_KEY] {
        store
            .put(key, &model_bytes)
            .map_err(|source| TrainingError::Write {
                key: key.to_string(),
                source,
            })?;
    }

    let predicted = model.predict(&features)?;
    let metrics = evaluate(&predicted, &targets).rounded(METRIC_DECIMALS);

    let version = registry.record_version(NewModelVersion {
        artifact_path: checkpoint.clone(),
        trained_at: now,
        training_week: week,
        sample_count: fit.rows_used,
        metrics,
        feature_columns: model.feature_columns().to_vec(),
    })?;

    info!(
        component = "training",
        event = "training.version.finish",
        model_id = %version.model_id,
        version = version.version,
        checkpoint = %checkpoint,
        warm_start = fit.warm_start,
        rmse = metrics.rmse,
        r2 = metrics.r2
    );

    Ok(TrainingSummary {
        version,
        checkpoint_key: checkpoint,
        resumed_from,
        fit,
        metrics,
    })
}

pub fn parse_training_csv(
    key: &str,
    bytes: &[u8],
) -> Result<(FeatureMatrix, Vec<f64>), TrainingError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(Cursor::new(bytes));
    let csv_err = |source| TrainingError::Csv {
        key: key.to_string(),
        source,
    };
    let headers = reader.headers().map_err(csv_err)?.clone();

    let columns = feature_column_names();
    let find = |name: &str| {
        column_index(&headers, name).ok_or_else(|| TrainingError::MissingColumn {
            key: key.to_string(),
            column: name.to_string(),
        })
    };
    let ts_idx = find(TIMESTAMP_COLUMN)?;
    let price_idx = find(PRICE_COLUMN)?;
    let feature_idx = columns
        .iter()
        .map(|name| find(name.as_str()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut timestamps = Vec::new();
    let mut rows = Vec::new();
    let mut targets = Vec::new();
    let mut dropped = 0usize;
    for (row_idx, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        let raw_ts = record.get(ts_idx).unwrap_or_default();
        let timestamp =
            parse_settlement_timestamp(raw_ts).ok_or_else(|| TrainingError::InvalidValue {
                key: key.to_string(),
                row: row_idx,
                column: TIMESTAMP_COLUMN.to_string(),
                value: raw_ts.to_string(),
            })?;

        let target = parse_cell(key, row_idx, PRICE_COLUMN, record.get(price_idx))?;
        let mut values = Vec::with_capacity(feature_idx.len());
        for (name, idx) in columns.iter().zip(&feature_idx) {
            values.push(parse_cell(key, row_idx, name, record.get(*idx))?);
        }

        match target {
            Some(target) if values.iter().all(Option::is_some) => {
                timestamps.push(timestamp);
                rows.push(values);
                targets.push(target);
            }
            _ => dropped += 1,
        }
    }

    if dropped > 0 {
        warn!(
            component = "training",
            event = "training.data.incomplete_rows",
            key,
            dropped
        );
    }

    Ok((
        FeatureMatrix {
            columns,
            timestamps,
            rows,
        },
        targets,
    ))
}

fn parse_cell(
    key: &str,
    row: usize,
    column: &str,
    raw: Option<&str>,
) -> Result<Option<f64>, TrainingError> {
    let trimmed = raw.unwrap_or_default().trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(TrainingError::InvalidValue {
            key: key.to_string(),
            row,
            column: column.to_string(),
            value: trimmed.to_string(),
        }),
    }
}

fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}
