//! RRP forecast core crate.
//!
//! Current implemented scope:
//! - landing-zone observation loading and weekly training-set curation
//! - calendar/lag features, horizon extension and windowed inference
//! - forecast/actual reconciliation into a generation-swapped store
//! - incremental ridge training with an atomically versioned registry
//! - spike scanning and the HTTP query surface

mod artifacts;
mod config;
mod features;
mod forecast_store;
mod inference;
mod model;
mod observability;
mod observations;
mod query;
mod reconcile;
mod registry;
mod runs;
mod spike;
mod training;

pub use artifacts::{
    sort_newest_first, ArtifactError, ArtifactStore, LocalArtifactStore, ObjectMeta,
    CHECKPOINT_PREFIX, CURATED_PREFIX, LANDING_PREFIX, LATEST_MODEL_KEY,
};
pub use config::{
    ConfigError, PipelineConfig, DEFAULT_ACTUAL_TAIL_LENGTH, DEFAULT_CURATION_LOOKBACK_DAYS,
    DEFAULT_HORIZON_LENGTH, DEFAULT_HORIZON_STEP_MINUTES, DEFAULT_LAG_OFFSET_MINUTES,
    DEFAULT_MARKET_TIMEZONE, DEFAULT_RIDGE_LAMBDA, DEFAULT_RUN_LOCK_STALE_MINUTES,
    DEFAULT_SOURCE_FILE_LIMIT, DEFAULT_SPIKE_THRESHOLD, DEFAULT_TTL_DAYS,
    DEFAULT_WRITE_CHUNK_SIZE, MAX_SPAN_DAYS,
};
pub use features::{
    build_feature_vector, build_feature_vectors, calendar_features, extend_timeline,
    feature_column_names, feature_fingerprint, CalendarFeatures, FeatureError, FeatureMatrix,
    FeatureVector, Horizon, HorizonPolicy, LagResolver, FEATURE_COLUMNS, FEATURE_SCHEMA_VERSION,
};
pub use forecast_store::{
    ForecastRecord, ForecastStore, PeriodType, ReplaceReport, SqliteForecastStore, StoreError,
};
pub use inference::{run_inference, InferenceError, InferenceOutput, InferenceSettings, PredictedRow};
pub use model::{
    evaluate, EvaluationMetrics, FitReport, ModelError, PriceModel, RidgeModel,
    MODEL_FORMAT_VERSION,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_run_finish, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError,
};
pub use observations::{
    format_settlement_timestamp, is_interval_aligned, load_observations,
    parse_settlement_timestamp, Observation, ObservationBatch, ObservationError,
    ObservationLoadReport, SourceSelection, PRICE_COLUMN, SETTLEMENT_FORMAT, TIMESTAMP_COLUMN,
};
pub use query::{query_router, QueryRequest, QueryState, QueryType, SpikeResponse};
pub use reconcile::{
    build_records, reconcile_and_publish, ReconcileError, ReconcileSettings, ReconcileSummary,
};
pub use registry::{model_id_for, ModelRegistry, ModelVersion, NewModelVersion, SqliteModelRegistry};
pub use runs::{
    inference_settings, load_latest_model, reconcile_settings, run_curation, run_forecast,
    run_forecast_with_model, run_training, training_settings, ForecastRunSummary, RunError,
    RunLock, RunOutcome,
};
pub use spike::{find_first_spike, market_local_now, scan_for_spike, SpikeResult};
pub use training::{
    checkpoint_key, curate_training_set, load_latest_checkpoint, parse_training_csv,
    train_model_version, training_data_prefix, training_week, CurationSummary, TrainingError,
    TrainingSettings, TrainingSummary, CURATED_FILE_NAME, METRIC_DECIMALS,
};
