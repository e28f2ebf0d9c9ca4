use std::process::ExitCode;

use chrono::Utc;
use rrp_forecast::{
    init_logging, log_app_start, log_run_finish, logging_config_from_env, run_training,
    LocalArtifactStore, PipelineConfig, RunError, RunOutcome, SqliteModelRegistry,
    TrainingSummary,
};

const COMPONENT: &str = "train_run";

fn main() -> ExitCode {
    let logging_cfg = logging_config_from_env();
    if let Err(err) = init_logging(&logging_cfg) {
        eprintln!("logging init failed: {err}");
        return ExitCode::FAILURE;
    }
    log_app_start(COMPONENT, &logging_cfg);

    let result = run();
    let message = match &result {
        Ok(summary) => format!(
            "Model trained and saved successfully as {}",
            summary.version.model_id
        ),
        Err(_) => String::new(),
    };
    let outcome = RunOutcome::from_result(&result, &message);
    log_run_finish(COMPONENT, &outcome);

    match serde_json::to_string(&outcome) {
        Ok(body) => println!("{body}"),
        Err(err) => eprintln!("outcome encode failed: {err}"),
    }
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run() -> Result<TrainingSummary, RunError> {
    let cfg = PipelineConfig::from_env()?;
    let artifacts = LocalArtifactStore::new(cfg.source_root.clone());
    let registry = SqliteModelRegistry::open(&cfg.metadata_store_path)
        .map_err(|err| RunError::Persistence(err.to_string()))?;
    run_training(&cfg, &artifacts, &registry, Utc::now())
}
