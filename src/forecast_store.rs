//! Forecast/actual record store.
//!
//! Each publish writes a fresh generation and then repoints the current
//! generation marker in one transaction, so readers never see an empty or
//! half-written store.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::observations::{format_settlement_timestamp, parse_settlement_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeriodType {
    Actual,
    Forecast,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Actual => "Actual",
            Self::Forecast => "Forecast",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Actual" => Some(Self::Actual),
            "Forecast" => Some(Self::Forecast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    #[serde(rename = "SETTLEMENTDATE")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "RRP")]
    pub price: f64,
    #[serde(rename = "PeriodType")]
    pub period_type: PeriodType,
    // Epoch seconds after which the record is no longer served.
    #[serde(rename = "TimeToExist")]
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceReport {
    pub generation: i64,
    pub written: u64,
    pub chunks: u64,
    pub retired_records: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("write chunk size must be > 0")]
    InvalidChunkSize,
    #[error("partial write: {written} record(s) written before chunk {failed_chunk} failed: {source}")]
    PartialWrite {
        written: u64,
        failed_chunk: u64,
        #[source]
        source: rusqlite::Error,
    },
    #[error("corrupt stored record: {0}")]
    CorruptRecord(String),
    #[error("store lock poisoned")]
    Poisoned,
}

pub trait ForecastStore: Send + Sync {
    fn replace_all(
        &self,
        records: &[ForecastRecord],
        chunk_size: usize,
    ) -> Result<ReplaceReport, StoreError>;

    fn scan(&self, now: DateTime<Utc>) -> Result<Vec<ForecastRecord>, StoreError>;
}

pub struct SqliteForecastStore {
    conn: Mutex<Connection>,
}

impl SqliteForecastStore {
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
            ",
        )?;
        ensure_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn current_generation(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(conn.query_row(
            "SELECT current FROM forecast_generation WHERE id = 1",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn stored_generations(&self) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT generation FROM forecast_records ORDER BY generation ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<i64>, _>>()?)
    }
}

impl ForecastStore for SqliteForecastStore {
    fn replace_all(
        &self,
        records: &[ForecastRecord],
        chunk_size: usize,
    ) -> Result<ReplaceReport, StoreError> {
        if chunk_size == 0 {
            return Err(StoreError::InvalidChunkSize);
        }
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;

        let generation = reserve_generation(&mut conn)?;
        let mut written = 0u64;
        let mut chunks = 0u64;
        for (chunk_idx, chunk) in records.chunks(chunk_size).enumerate() {
            if let Err(source) = write_chunk(&mut conn, generation, chunk) {
                warn!(
                    component = "forecast_store",
                    event = "forecast_store.write.chunk_failed",
                    generation,
                    chunk = chunk_idx,
                    written,
                    error = %source
                );
                if let Err(cleanup) = conn.execute(
                    "DELETE FROM forecast_records WHERE generation = ?1",
                    params![generation],
                ) {
                    warn!(
                        component = "forecast_store",
                        event = "forecast_store.write.cleanup_failed",
                        generation,
                        error = %cleanup
                    );
                }
                return Err(StoreError::PartialWrite {
                    written,
                    failed_chunk: chunk_idx as u64,
                    source,
                });
            }
            written += chunk.len() as u64;
            chunks += 1;
        }

        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE forecast_generation SET current = ?1 WHERE id = 1",
            params![generation],
        )?;
        let retired_records = tx.execute(
            "DELETE FROM forecast_records WHERE generation <> ?1",
            params![generation],
        )? as u64;
        tx.commit()?;

        info!(
            component = "forecast_store",
            event = "forecast_store.generation.swapped",
            generation,
            written,
            chunks,
            retired_records
        );

        Ok(ReplaceReport {
            generation,
            written,
            chunks,
            retired_records,
        })
    }

    fn scan(&self, now: DateTime<Utc>) -> Result<Vec<ForecastRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "
            SELECT r.settlement_date, r.rrp, r.period_type, r.expires_at
            FROM forecast_records r
            JOIN forecast_generation g ON g.id = 1 AND r.generation = g.current
            WHERE r.expires_at > ?1
            ORDER BY r.settlement_date ASC
            ",
        )?;
        let mut rows = stmt.query(params![now.timestamp()])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_ts: String = row.get(0)?;
            let raw_period: String = row.get(2)?;
            let timestamp = parse_settlement_timestamp(&raw_ts)
                .ok_or_else(|| StoreError::CorruptRecord(format!("timestamp '{raw_ts}'")))?;
            let period_type = PeriodType::parse(&raw_period)
                .ok_or_else(|| StoreError::CorruptRecord(format!("period type '{raw_period}'")))?;
            out.push(ForecastRecord {
                timestamp,
                price: row.get(1)?,
                period_type,
                expires_at: row.get(3)?,
            });
        }
        Ok(out)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS forecast_records (
            generation INTEGER NOT NULL,
            settlement_date TEXT NOT NULL,
            rrp REAL NOT NULL,
            period_type TEXT NOT NULL CHECK (period_type IN ('Actual', 'Forecast')),
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (generation, settlement_date)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS forecast_generation (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            current INTEGER NOT NULL,
            next INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO forecast_generation (id, current, next) VALUES (1, 0, 1);
        ",
    )?;
    Ok(())
}

fn reserve_generation(conn: &mut Connection) -> Result<i64, StoreError> {
    let tx = conn.transaction()?;
    let generation: Option<i64> = tx
        .query_row(
            "UPDATE forecast_generation SET next = next + 1 WHERE id = 1 RETURNING next - 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    tx.commit()?;
    generation.ok_or_else(|| StoreError::CorruptRecord("missing generation marker".to_string()))
}

fn write_chunk(
    conn: &mut Connection,
    generation: i64,
    chunk: &[ForecastRecord],
) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "
            INSERT INTO forecast_records (
                generation,
                settlement_date,
                rrp,
                period_type,
                expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )?;
        for record in chunk {
            stmt.execute(params![
                generation,
                format_settlement_timestamp(record.timestamp),
                record.price,
                record.period_type.as_str(),
                record.expires_at,
            ])?;
        }
    }
    tx.commit()
}
