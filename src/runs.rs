//! Top-level run handlers: lock, wire collaborators, classify failures.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::artifacts::{ArtifactError, ArtifactStore, LATEST_MODEL_KEY};
use crate::config::{ConfigError, PipelineConfig};
use crate::forecast_store::ForecastStore;
use crate::inference::{run_inference, InferenceError, InferenceSettings};
use crate::model::{ModelError, PriceModel, RidgeModel};
use crate::observations::{load_observations, ObservationError, ObservationLoadReport, SourceSelection};
use crate::reconcile::{reconcile_and_publish, ReconcileError, ReconcileSettings, ReconcileSummary};
use crate::registry::ModelRegistry;
use crate::training::{
    curate_training_set, train_model_version, CurationSummary, TrainingError, TrainingSettings,
    TrainingSummary,
};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("prediction failed: {0}")]
    Prediction(String),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("another run holds the lock at {}", .0.display())]
    RunInProgress(PathBuf),
}

impl RunError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration(_) => 400,
            Self::DataUnavailable(_) => 404,
            Self::ModelLoad(_) | Self::Prediction(_) | Self::Persistence(_) => 500,
            Self::RunInProgress(_) => 409,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::DataUnavailable(_) => "data_unavailable",
            Self::ModelLoad(_) => "model_load",
            Self::Prediction(_) => "prediction",
            Self::Persistence(_) => "persistence",
            Self::RunInProgress(_) => "run_in_progress",
        }
    }
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<ObservationError> for RunError {
    fn from(err: ObservationError) -> Self {
        match err {
            ObservationError::Artifact(ArtifactError::Io { .. }) => {
                Self::Persistence(err.to_string())
            }
            _ => Self::DataUnavailable(err.to_string()),
        }
    }
}

impl From<InferenceError> for RunError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::EmptySeries => Self::DataUnavailable(err.to_string()),
            InferenceError::WindowTooSmall { .. } => Self::Configuration(err.to_string()),
            _ => Self::Prediction(err.to_string()),
        }
    }
}

impl From<ReconcileError> for RunError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Store(_) => Self::Persistence(err.to_string()),
            ReconcileError::NonPositiveTtl(_) | ReconcileError::TtlOutOfRange(_) => {
                Self::Configuration(err.to_string())
            }
            _ => Self::Prediction(err.to_string()),
        }
    }
}

impl From<TrainingError> for RunError {
    fn from(err: TrainingError) -> Self {
        match &err {
            TrainingError::Observation(inner) => match inner {
                ObservationError::Artifact(ArtifactError::Io { .. }) => {
                    Self::Persistence(err.to_string())
                }
                _ => Self::DataUnavailable(err.to_string()),
            },
            TrainingError::NoTrainingData(_)
            | TrainingError::NothingToCurate(_)
            | TrainingError::MissingColumn { .. }
            | TrainingError::InvalidValue { .. }
            | TrainingError::Csv { .. }
            | TrainingError::Artifact(ArtifactError::NotFound(_))
            | TrainingError::Model(ModelError::EmptyTrainingSet) => {
                Self::DataUnavailable(err.to_string())
            }
            TrainingError::Model(_) => Self::ModelLoad(err.to_string()),
            TrainingError::Artifact(_) | TrainingError::Write { .. } | TrainingError::Registry(_) => {
                Self::Persistence(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status_code: u16,
    pub message: String,
}

impl RunOutcome {
    pub fn from_result<T>(result: &Result<T, RunError>, success_message: &str) -> Self {
        match result {
            Ok(_) => Self {
                status_code: 200,
                message: success_message.to_string(),
            },
            Err(err) => Self {
                status_code: err.status_code(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

// Exclusive marker file holding the owner's pid; removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path, stale_after: ChronoDuration) -> Result<Self, RunError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    RunError::Persistence(format!("create {}: {err}", parent.display()))
                })?;
            }
        }

        match Self::create(path)? {
            Some(lock) => Ok(lock),
            None if lock_is_stale(path, stale_after) => {
                warn!(
                    component = "runs",
                    event = "runs.lock.stale_reclaimed",
                    path = %path.display(),
                    stale_after_secs = stale_after.num_seconds()
                );
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(RunError::Persistence(format!(
                            "remove stale lock {}: {err}",
                            path.display()
                        )));
                    }
                }
                Self::create(path)?.ok_or_else(|| RunError::RunInProgress(path.to_path_buf()))
            }
            None => Err(RunError::RunInProgress(path.to_path_buf())),
        }
    }

    fn create(path: &Path) -> Result<Option<Self>, RunError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => {
                return Err(RunError::Persistence(format!(
                    "create lock {}: {err}",
                    path.display()
                )));
            }
        };
        if let Err(err) = writeln!(file, "{}", std::process::id()) {
            warn!(
                component = "runs",
                event = "runs.lock.pid_write_failed",
                path = %path.display(),
                error = %err
            );
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_is_stale(path: &Path, stale_after: ChronoDuration) -> bool {
    let holder = fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok());
    if let Some(pid) = holder {
        if process_alive(pid) == Some(false) {
            return true;
        }
    }

    let age = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .and_then(|age| ChronoDuration::from_std(age).ok());
    matches!(age, Some(age) if age > stale_after)
}

// `None` where liveness cannot be checked.
fn process_alive(pid: u32) -> Option<bool> {
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return None;
    }
    Some(proc_root.join(pid.to_string()).exists())
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(
                component = "runs",
                event = "runs.lock.release_failed",
                path = %self.path.display(),
                error = %err
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRunSummary {
    pub observations: ObservationLoadReport,
    pub horizon_start: Option<NaiveDateTime>,
    pub horizon_end: Option<NaiveDateTime>,
    pub reconcile: ReconcileSummary,
}

pub fn inference_settings(cfg: &PipelineConfig) -> InferenceSettings {
    InferenceSettings {
        horizon: cfg.horizon_policy(),
        lag_offset: cfg.lag_offset(),
        window: cfg.inference_window,
    }
}

pub fn reconcile_settings(cfg: &PipelineConfig) -> ReconcileSettings {
    ReconcileSettings {
        actual_tail: cfg.actual_tail_length,
        ttl: cfg.ttl(),
        write_chunk_size: cfg.write_chunk_size,
    }
}

pub fn training_settings(cfg: &PipelineConfig) -> TrainingSettings {
    TrainingSettings {
        ridge_lambda: cfg.ridge_lambda,
        market_timezone: cfg.market_timezone,
        lag_offset: cfg.lag_offset(),
        interval: cfg.horizon_policy().step,
        curation_lookback: cfg.curation_lookback(),
    }
}

pub fn load_latest_model(artifacts: &dyn ArtifactStore) -> Result<RidgeModel, RunError> {
    let bytes = artifacts
        .get(LATEST_MODEL_KEY)
        .map_err(|err| RunError::ModelLoad(err.to_string()))?;
    let model = RidgeModel::load(&bytes).map_err(|err| RunError::ModelLoad(err.to_string()))?;
    if !model.is_fitted() {
        return Err(RunError::ModelLoad(ModelError::NotFitted.to_string()));
    }
    Ok(model)
}

pub fn run_forecast(
    cfg: &PipelineConfig,
    artifacts: &dyn ArtifactStore,
    forecasts: &dyn ForecastStore,
    now: DateTime<Utc>,
) -> Result<ForecastRunSummary, RunError> {
    cfg.validate()?;
    let _lock = RunLock::acquire(&cfg.run_lock_path, cfg.run_lock_stale_after())?;
    let model = load_latest_model(artifacts)?;
    forecast_with_model(cfg, &model, artifacts, forecasts, now)
}

pub fn run_forecast_with_model(
    cfg: &PipelineConfig,
    model: &dyn PriceModel,
    artifacts: &dyn ArtifactStore,
    forecasts: &dyn ForecastStore,
    now: DateTime<Utc>,
) -> Result<ForecastRunSummary, RunError> {
    cfg.validate()?;
    let _lock = RunLock::acquire(&cfg.run_lock_path, cfg.run_lock_stale_after())?;
    forecast_with_model(cfg, model, artifacts, forecasts, now)
}

fn forecast_with_model(
    cfg: &PipelineConfig,
    model: &dyn PriceModel,
    artifacts: &dyn ArtifactStore,
    forecasts: &dyn ForecastStore,
    now: DateTime<Utc>,
) -> Result<ForecastRunSummary, RunError> {
    info!(
        component = "runs",
        event = "runs.forecast.start",
        now = %now,
        source_file_limit = cfg.source_file_limit
    );

    let batch = load_observations(
        artifacts,
        SourceSelection::Latest(cfg.source_file_limit),
        cfg.horizon_policy().step,
    )?;
    let output = run_inference(&batch.observations, model, inference_settings(cfg))?;
    let reconcile = reconcile_and_publish(
        forecasts,
        &batch.observations,
        &output,
        now,
        reconcile_settings(cfg),
    )?;

    Ok(ForecastRunSummary {
        observations: batch.report,
        horizon_start: output.horizon.first(),
        horizon_end: output.horizon.steps().last().copied(),
        reconcile,
    })
}

pub fn run_training(
    cfg: &PipelineConfig,
    artifacts: &dyn ArtifactStore,
    registry: &dyn ModelRegistry,
    now: DateTime<Utc>,
) -> Result<TrainingSummary, RunError> {
    cfg.validate()?;
    let _lock = RunLock::acquire(&cfg.run_lock_path, cfg.run_lock_stale_after())?;
    info!(component = "runs", event = "runs.training.start", now = %now);
    Ok(train_model_version(
        artifacts,
        registry,
        now,
        training_settings(cfg),
    )?)
}

pub fn run_curation(
    cfg: &PipelineConfig,
    artifacts: &dyn ArtifactStore,
    now: DateTime<Utc>,
) -> Result<CurationSummary, RunError> {
    cfg.validate()?;
    let _lock = RunLock::acquire(&cfg.run_lock_path, cfg.run_lock_stale_after())?;
    info!(component = "runs", event = "runs.curation.start", now = %now);
    Ok(curate_training_set(artifacts, now, training_settings(cfg))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(RunError::Configuration("x".into()).status_code(), 400);
        assert_eq!(RunError::DataUnavailable("x".into()).status_code(), 404);
        assert_eq!(RunError::ModelLoad("x".into()).status_code(), 500);
        assert_eq!(RunError::Prediction("x".into()).status_code(), 500);
        assert_eq!(RunError::Persistence("x".into()).status_code(), 500);
        assert_eq!(
            RunError::RunInProgress(PathBuf::from("/tmp/x")).status_code(),
            409
        );
    }

    #[test]
    fn outcome_carries_status_and_message() {
        let ok: Result<(), RunError> = Ok(());
        let outcome = RunOutcome::from_result(&ok, "done");
        assert!(outcome.is_success());
        assert_eq!(outcome.message, "done");

        let failed: Result<(), RunError> = Err(RunError::DataUnavailable("no rows".into()));
        let outcome = RunOutcome::from_result(&failed, "done");
        assert!(!outcome.is_success());
        assert_eq!(outcome.status_code, 404);
        assert_eq!(outcome.message, "data unavailable: no rows");
    }

    #[test]
    fn training_errors_are_classified() {
        let err: RunError = TrainingError::NoTrainingData("curated-zone/x/".into()).into();
        assert_eq!(err.status_code(), 404);
        let err: RunError = TrainingError::Model(ModelError::EmptyTrainingSet).into();
        assert_eq!(err.kind(), "data_unavailable");
        let err: RunError = TrainingError::Write {
            key: "models/model.json".into(),
            source: ArtifactError::InvalidKey("models/model.json".into()),
        }
        .into();
        assert_eq!(err.kind(), "persistence");
    }

    fn hour() -> ChronoDuration {
        ChronoDuration::hours(1)
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("run.lock");

        let held = RunLock::acquire(&path, hour()).unwrap();
        assert!(path.exists());
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
        assert!(matches!(
            RunLock::acquire(&path, hour()).unwrap_err(),
            RunError::RunInProgress(_)
        ));
        drop(held);
        assert!(!path.exists());
        RunLock::acquire(&path, hour()).unwrap();
    }

    #[test]
    fn lock_left_by_a_dead_process_is_reclaimed() {
        if process_alive(std::process::id()) != Some(true) {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        // Above any kernel pid_max.
        fs::write(&path, format!("{}\n", u32::MAX)).unwrap();

        for _ in 0..3 {
            let lock = RunLock::acquire(&path, hour()).unwrap();
            assert_eq!(lock.path(), path.as_path());
            drop(lock);
            fs::write(&path, format!("{}\n", u32::MAX)).unwrap();
        }
    }

    #[test]
    fn old_lock_is_reclaimed_after_the_stale_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        // Own pid: alive, so only the age can release it.
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        assert!(matches!(
            RunLock::acquire(&path, hour()).unwrap_err(),
            RunError::RunInProgress(_)
        ));

        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - std::time::Duration::from_secs(2 * 3600))
            .unwrap();
        drop(file);

        let lock = RunLock::acquire(&path, hour()).unwrap();
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn unreadable_pid_falls_back_to_the_age_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, "").unwrap();

        assert!(matches!(
            RunLock::acquire(&path, hour()).unwrap_err(),
            RunError::RunInProgress(_)
        ));
    }
}
