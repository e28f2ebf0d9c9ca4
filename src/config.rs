//! Pipeline settings loaded from `RRP_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Duration as ChronoDuration;
use chrono_tz::Tz;
use thiserror::Error;

use crate::features::HorizonPolicy;

pub const DEFAULT_SPIKE_THRESHOLD: f64 = 150.0;
pub const DEFAULT_HORIZON_LENGTH: usize = 48;
pub const DEFAULT_HORIZON_STEP_MINUTES: i64 = 30;
pub const DEFAULT_LAG_OFFSET_MINUTES: i64 = 24 * 60;
pub const DEFAULT_TTL_DAYS: i64 = 1;
pub const DEFAULT_ACTUAL_TAIL_LENGTH: usize = 48;
pub const DEFAULT_SOURCE_FILE_LIMIT: usize = 3;
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 25;
pub const DEFAULT_CURATION_LOOKBACK_DAYS: i64 = 7;
pub const DEFAULT_RIDGE_LAMBDA: f64 = 1e-6;
pub const DEFAULT_MARKET_TIMEZONE: Tz = chrono_tz::Australia::Brisbane;
pub const DEFAULT_RUN_LOCK_STALE_MINUTES: i64 = 6 * 60;
pub const MAX_SPAN_DAYS: i64 = 10 * 366;
const MAX_SPAN_MINUTES: i64 = MAX_SPAN_DAYS * 24 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub source_root: PathBuf,
    pub forecast_store_path: PathBuf,
    pub metadata_store_path: PathBuf,
    pub spike_threshold: f64,
    pub horizon_length: usize,
    pub horizon_step_minutes: i64,
    pub lag_offset_minutes: i64,
    pub ttl_days: i64,
    // Smallest useful value is horizon_length + 1.
    pub inference_window: usize,
    pub actual_tail_length: usize,
    pub source_file_limit: usize,
    pub write_chunk_size: usize,
    pub curation_lookback_days: i64,
    pub ridge_lambda: f64,
    pub market_timezone: Tz,
    pub run_lock_path: PathBuf,
    pub run_lock_stale_minutes: i64,
}

impl PipelineConfig {
    pub fn with_locations(
        source_root: impl Into<PathBuf>,
        forecast_store_path: impl Into<PathBuf>,
        metadata_store_path: impl Into<PathBuf>,
    ) -> Self {
        let source_root = source_root.into();
        let run_lock_path = source_root.join(".run.lock");
        Self {
            source_root,
            forecast_store_path: forecast_store_path.into(),
            metadata_store_path: metadata_store_path.into(),
            spike_threshold: DEFAULT_SPIKE_THRESHOLD,
            horizon_length: DEFAULT_HORIZON_LENGTH,
            horizon_step_minutes: DEFAULT_HORIZON_STEP_MINUTES,
            lag_offset_minutes: DEFAULT_LAG_OFFSET_MINUTES,
            ttl_days: DEFAULT_TTL_DAYS,
            inference_window: DEFAULT_HORIZON_LENGTH + 1,
            actual_tail_length: DEFAULT_ACTUAL_TAIL_LENGTH,
            source_file_limit: DEFAULT_SOURCE_FILE_LIMIT,
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
            curation_lookback_days: DEFAULT_CURATION_LOOKBACK_DAYS,
            ridge_lambda: DEFAULT_RIDGE_LAMBDA,
            market_timezone: DEFAULT_MARKET_TIMEZONE,
            run_lock_path,
            run_lock_stale_minutes: DEFAULT_RUN_LOCK_STALE_MINUTES,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let source_root = required_path(&lookup, "RRP_SOURCE_LOCATION")?;
        let forecast_store = required_path(&lookup, "RRP_FORECAST_STORE")?;
        let metadata_store = required_path(&lookup, "RRP_METADATA_STORE")?;
        let mut cfg = Self::with_locations(source_root, forecast_store, metadata_store);

        if let Some(v) = parse_opt::<f64>(&lookup, "RRP_SPIKE_THRESHOLD")? {
            cfg.spike_threshold = v;
        }
        if let Some(v) = parse_opt::<usize>(&lookup, "RRP_HORIZON_LENGTH")? {
            cfg.horizon_length = v;
            cfg.inference_window = v.saturating_add(1);
        }
        if let Some(v) = parse_opt::<i64>(&lookup, "RRP_HORIZON_STEP_MINUTES")? {
            cfg.horizon_step_minutes = v;
        }
        if let Some(v) = parse_opt::<i64>(&lookup, "RRP_LAG_OFFSET_MINUTES")? {
            cfg.lag_offset_minutes = v;
        }
        if let Some(v) = parse_opt::<i64>(&lookup, "RRP_TTL_DAYS")? {
            cfg.ttl_days = v;
        }
        if let Some(v) = parse_opt::<usize>(&lookup, "RRP_INFERENCE_WINDOW")? {
            cfg.inference_window = v;
        }
        if let Some(v) = parse_opt::<usize>(&lookup, "RRP_ACTUAL_TAIL")? {
            cfg.actual_tail_length = v;
        }
        if let Some(v) = parse_opt::<usize>(&lookup, "RRP_SOURCE_FILE_LIMIT")? {
            cfg.source_file_limit = v;
        }
        if let Some(v) = parse_opt::<usize>(&lookup, "RRP_WRITE_CHUNK_SIZE")? {
            cfg.write_chunk_size = v;
        }
        if let Some(v) = parse_opt::<i64>(&lookup, "RRP_CURATION_LOOKBACK_DAYS")? {
            cfg.curation_lookback_days = v;
        }
        if let Some(v) = parse_opt::<f64>(&lookup, "RRP_RIDGE_LAMBDA")? {
            cfg.ridge_lambda = v;
        }
        if let Some(raw) = non_empty(&lookup, "RRP_MARKET_TIMEZONE") {
            cfg.market_timezone = raw.parse::<Tz>().map_err(|err| ConfigError::Invalid {
                key: "RRP_MARKET_TIMEZONE",
                value: raw.clone(),
                reason: err.to_string(),
            })?;
        }
        if let Some(raw) = non_empty(&lookup, "RRP_RUN_LOCK") {
            cfg.run_lock_path = PathBuf::from(raw);
        }
        if let Some(v) = parse_opt::<i64>(&lookup, "RRP_RUN_LOCK_STALE_MINUTES")? {
            cfg.run_lock_stale_minutes = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.spike_threshold.is_finite() {
            return Err(invalid(
                "RRP_SPIKE_THRESHOLD",
                self.spike_threshold,
                "must be finite",
            ));
        }
        if self.horizon_length == 0 {
            return Err(invalid("RRP_HORIZON_LENGTH", 0, "must be > 0"));
        }
        check_span_minutes("RRP_HORIZON_STEP_MINUTES", self.horizon_step_minutes)?;
        let horizon_minutes = i64::try_from(self.horizon_length)
            .ok()
            .and_then(|len| len.checked_mul(self.horizon_step_minutes));
        if !matches!(horizon_minutes, Some(total) if total <= MAX_SPAN_MINUTES) {
            return Err(invalid(
                "RRP_HORIZON_LENGTH",
                self.horizon_length,
                &format!("horizon must span at most {MAX_SPAN_DAYS} days"),
            ));
        }
        check_span_minutes("RRP_LAG_OFFSET_MINUTES", self.lag_offset_minutes)?;
        check_span_days("RRP_TTL_DAYS", self.ttl_days)?;
        if self.inference_window <= self.horizon_length {
            return Err(invalid(
                "RRP_INFERENCE_WINDOW",
                self.inference_window,
                "must exceed the horizon length",
            ));
        }
        if self.source_file_limit == 0 {
            return Err(invalid("RRP_SOURCE_FILE_LIMIT", 0, "must be > 0"));
        }
        if self.write_chunk_size == 0 {
            return Err(invalid("RRP_WRITE_CHUNK_SIZE", 0, "must be > 0"));
        }
        check_span_days("RRP_CURATION_LOOKBACK_DAYS", self.curation_lookback_days)?;
        check_span_minutes("RRP_RUN_LOCK_STALE_MINUTES", self.run_lock_stale_minutes)?;
        if !(self.ridge_lambda.is_finite() && self.ridge_lambda >= 0.0) {
            return Err(invalid(
                "RRP_RIDGE_LAMBDA",
                self.ridge_lambda,
                "must be finite and >= 0",
            ));
        }
        Ok(())
    }

    pub fn horizon_policy(&self) -> HorizonPolicy {
        HorizonPolicy {
            length: self.horizon_length,
            step: ChronoDuration::minutes(self.horizon_step_minutes),
        }
    }

    pub fn lag_offset(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.lag_offset_minutes)
    }

    pub fn ttl(&self) -> ChronoDuration {
        ChronoDuration::days(self.ttl_days)
    }

    pub fn curation_lookback(&self) -> ChronoDuration {
        ChronoDuration::days(self.curation_lookback_days)
    }

    pub fn run_lock_stale_after(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.run_lock_stale_minutes)
    }
}

// Bounds spans before the accessors build a `ChronoDuration`.
fn check_span_minutes(key: &'static str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(invalid(key, value, "must be > 0"));
    }
    match ChronoDuration::try_minutes(value) {
        Some(_) if value <= MAX_SPAN_MINUTES => Ok(()),
        _ => Err(invalid(
            key,
            value,
            &format!("must span at most {MAX_SPAN_DAYS} days"),
        )),
    }
}

fn check_span_days(key: &'static str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(invalid(key, value, "must be > 0"));
    }
    match ChronoDuration::try_days(value) {
        Some(_) if value <= MAX_SPAN_DAYS => Ok(()),
        _ => Err(invalid(
            key,
            value,
            &format!("must span at most {MAX_SPAN_DAYS} days"),
        )),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn required_path(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<PathBuf, ConfigError> {
    non_empty(lookup, key)
        .map(PathBuf::from)
        .ok_or(ConfigError::Missing(key))
}

fn parse_opt<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: err.to_string(),
            }),
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("RRP_SOURCE_LOCATION", "/data/rrp"),
        ("RRP_FORECAST_STORE", "/data/forecast.sqlite"),
        ("RRP_METADATA_STORE", "/data/models.sqlite"),
    ];

    #[test]
    fn defaults_apply_when_only_locations_are_set() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&REQUIRED)).unwrap();

        assert_eq!(cfg.spike_threshold, 150.0);
        assert_eq!(cfg.horizon_length, 48);
        assert_eq!(cfg.horizon_step_minutes, 30);
        assert_eq!(cfg.lag_offset_minutes, 1_440);
        assert_eq!(cfg.ttl_days, 1);
        assert_eq!(cfg.inference_window, 49);
        assert_eq!(cfg.market_timezone, chrono_tz::Australia::Brisbane);
        assert_eq!(cfg.run_lock_path, PathBuf::from("/data/rrp/.run.lock"));
    }

    #[test]
    fn missing_required_location_is_reported_by_key() {
        let err = PipelineConfig::from_lookup(lookup_from(&REQUIRED[..2])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("RRP_METADATA_STORE"));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("RRP_SPIKE_THRESHOLD", "300.5"),
            ("RRP_HORIZON_LENGTH", "24"),
            ("RRP_MARKET_TIMEZONE", "Australia/Sydney"),
            ("RRP_WRITE_CHUNK_SIZE", "10"),
        ]);
        let cfg = PipelineConfig::from_lookup(lookup_from(&vars)).unwrap();

        assert_eq!(cfg.spike_threshold, 300.5);
        assert_eq!(cfg.horizon_length, 24);
        assert_eq!(cfg.inference_window, 25);
        assert_eq!(cfg.market_timezone, chrono_tz::Australia::Sydney);
        assert_eq!(cfg.write_chunk_size, 10);
    }

    #[test]
    fn window_not_larger_than_horizon_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("RRP_INFERENCE_WINDOW", "48"));
        let err = PipelineConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "RRP_INFERENCE_WINDOW",
                ..
            }
        ));
    }

    #[test]
    fn unparsable_number_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("RRP_TTL_DAYS", "one"));
        let err = PipelineConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "RRP_TTL_DAYS",
                ..
            }
        ));
    }

    fn rejected_key(vars: &[(&str, &str)]) -> Option<&'static str> {
        let mut all = REQUIRED.to_vec();
        all.extend_from_slice(vars);
        match PipelineConfig::from_lookup(lookup_from(&all)) {
            Err(ConfigError::Invalid { key, .. }) => Some(key),
            _ => None,
        }
    }

    #[test]
    fn out_of_range_spans_are_rejected_by_key() {
        let huge = i64::MAX.to_string();
        assert_eq!(
            rejected_key(&[("RRP_TTL_DAYS", "100000000000000")]),
            Some("RRP_TTL_DAYS")
        );
        assert_eq!(
            rejected_key(&[("RRP_LAG_OFFSET_MINUTES", huge.as_str())]),
            Some("RRP_LAG_OFFSET_MINUTES")
        );
        assert_eq!(
            rejected_key(&[("RRP_HORIZON_STEP_MINUTES", huge.as_str())]),
            Some("RRP_HORIZON_STEP_MINUTES")
        );
        assert_eq!(
            rejected_key(&[("RRP_CURATION_LOOKBACK_DAYS", "4000")]),
            Some("RRP_CURATION_LOOKBACK_DAYS")
        );
        assert_eq!(
            rejected_key(&[("RRP_RUN_LOCK_STALE_MINUTES", huge.as_str())]),
            Some("RRP_RUN_LOCK_STALE_MINUTES")
        );
        assert_eq!(
            rejected_key(&[("RRP_RUN_LOCK_STALE_MINUTES", "0")]),
            Some("RRP_RUN_LOCK_STALE_MINUTES")
        );
    }

    #[test]
    fn horizon_longer_than_the_span_cap_is_rejected() {
        assert_eq!(
            rejected_key(&[
                ("RRP_HORIZON_LENGTH", "1000000"),
                ("RRP_HORIZON_STEP_MINUTES", "10000"),
            ]),
            Some("RRP_HORIZON_LENGTH")
        );
        let huge = usize::MAX.to_string();
        assert_eq!(
            rejected_key(&[("RRP_HORIZON_LENGTH", huge.as_str())]),
            Some("RRP_HORIZON_LENGTH")
        );
    }

    #[test]
    fn spans_at_the_cap_are_accepted() {
        let days = MAX_SPAN_DAYS.to_string();
        assert_eq!(rejected_key(&[("RRP_TTL_DAYS", days.as_str())]), None);
        let cfg = PipelineConfig::from_lookup(lookup_from(&REQUIRED)).unwrap();
        assert_eq!(cfg.run_lock_stale_after(), ChronoDuration::hours(6));
        assert_eq!(cfg.curation_lookback(), ChronoDuration::days(7));
    }
}
