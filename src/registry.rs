//! Append-only model version registry.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::forecast_store::StoreError;
use crate::model::EvaluationMetrics;

const VERSION_COUNTER: &str = "model_version";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub model_id: String,
    pub version: u64,
    #[serde(rename = "model_path")]
    pub artifact_path: String,
    #[serde(rename = "training_date")]
    pub trained_at: DateTime<Utc>,
    pub training_week: u32,
    #[serde(rename = "training_samples")]
    pub sample_count: u64,
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
    pub mse: f64,
    pub feature_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewModelVersion {
    pub artifact_path: String,
    pub trained_at: DateTime<Utc>,
    pub training_week: u32,
    pub sample_count: u64,
    pub metrics: EvaluationMetrics,
    pub feature_columns: Vec<String>,
}

pub trait ModelRegistry: Send + Sync {
    fn record_version(&self, entry: NewModelVersion) -> Result<ModelVersion, StoreError>;
    fn list_versions(&self) -> Result<Vec<ModelVersion>, StoreError>;
    fn version_count(&self) -> Result<u64, StoreError>;
}

pub fn model_id_for(version: u64) -> String {
    format!("model_v{version}")
}

pub struct SqliteModelRegistry {
    conn: Mutex<Connection>,
}

impl SqliteModelRegistry {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS model_versions (
                version INTEGER PRIMARY KEY,
                model_id TEXT NOT NULL UNIQUE,
                model_path TEXT NOT NULL,
                training_date TEXT NOT NULL,
                training_week INTEGER NOT NULL,
                training_samples INTEGER NOT NULL,
                rmse REAL NOT NULL,
                mae REAL NOT NULL,
                r2 REAL NOT NULL,
                mse REAL NOT NULL,
                feature_columns TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS version_counter (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ModelRegistry for SqliteModelRegistry {
    fn record_version(&self, entry: NewModelVersion) -> Result<ModelVersion, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Seeded from existing rows so the sequence continues max(version) + 1.
        tx.execute(
            "
            INSERT OR IGNORE INTO version_counter (name, value)
            SELECT ?1, COALESCE(MAX(version), 0) FROM model_versions
            ",
            params![VERSION_COUNTER],
        )?;
        let version: i64 = tx.query_row(
            "UPDATE version_counter SET value = value + 1 WHERE name = ?1 RETURNING value",
            params![VERSION_COUNTER],
            |row| row.get(0),
        )?;

        let version = version as u64;
        let stored = ModelVersion {
            model_id: model_id_for(version),
            version,
            artifact_path: entry.artifact_path,
            trained_at: entry.trained_at,
            training_week: entry.training_week,
            sample_count: entry.sample_count,
            rmse: entry.metrics.rmse,
            mae: entry.metrics.mae,
            r2: entry.metrics.r2,
            mse: entry.metrics.mse,
            feature_columns: entry.feature_columns,
        };
        let columns_json = serde_json::to_string(&stored.feature_columns)
            .map_err(|err| StoreError::CorruptRecord(err.to_string()))?;

        tx.execute(
            "
            INSERT INTO model_versions (
                version,
                model_id,
                model_path,
                training_date,
                training_week,
                training_samples,
                rmse,
                mae,
                r2,
                mse,
                feature_columns
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                stored.version as i64,
                stored.model_id,
                stored.artifact_path,
                stored.trained_at.to_rfc3339(),
                stored.training_week,
                stored.sample_count as i64,
                stored.rmse,
                stored.mae,
                stored.r2,
                stored.mse,
                columns_json,
            ],
        )?;
        tx.commit()?;

        info!(
            component = "registry",
            event = "registry.version.recorded",
            model_id = %stored.model_id,
            version = stored.version,
            model_path = %stored.artifact_path
        );

        Ok(stored)
    }

    fn list_versions(&self) -> Result<Vec<ModelVersion>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "
            SELECT
                version,
                model_id,
                model_path,
                training_date,
                training_week,
                training_samples,
                rmse,
                mae,
                r2,
                mse,
                feature_columns
            FROM model_versions
            ORDER BY version ASC
            ",
        )?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_date: String = row.get(3)?;
            let trained_at = DateTime::parse_from_rfc3339(&raw_date)
                .map_err(|err| StoreError::CorruptRecord(format!("training_date '{raw_date}': {err}")))?
                .with_timezone(&Utc);
            let raw_columns: String = row.get(10)?;
            let feature_columns: Vec<String> = serde_json::from_str(&raw_columns)
                .map_err(|err| StoreError::CorruptRecord(format!("feature_columns: {err}")))?;
            let version: i64 = row.get(0)?;
            let samples: i64 = row.get(5)?;

            out.push(ModelVersion {
                model_id: row.get(1)?,
                version: version as u64,
                artifact_path: row.get(2)?,
                trained_at,
                training_week: row.get(4)?,
                sample_count: samples as u64,
                rmse: row.get(6)?,
                mae: row.get(7)?,
                r2: row.get(8)?,
                mse: row.get(9)?,
                feature_columns,
            });
        }
        Ok(out)
    }

    fn version_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM model_versions", [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }
}
