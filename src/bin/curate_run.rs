use std::process::ExitCode;

use chrono::Utc;
use rrp_forecast::{
    init_logging, log_app_start, log_run_finish, logging_config_from_env, run_curation,
    CurationSummary, LocalArtifactStore, PipelineConfig, RunError, RunOutcome,
};

const COMPONENT: &str = "curate_run";

fn main() -> ExitCode {
    let logging_cfg = logging_config_from_env();
    if let Err(err) = init_logging(&logging_cfg) {
        eprintln!("logging init failed: {err}");
        return ExitCode::FAILURE;
    }
    log_app_start(COMPONENT, &logging_cfg);

    let result = run();
    let message = match &result {
        Ok(summary) => format!("{} rows curated into {}", summary.rows_written, summary.key),
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

fn run() -> Result<CurationSummary, RunError> {
    let cfg = PipelineConfig::from_env()?;
    let artifacts = LocalArtifactStore::new(cfg.source_root.clone());
    run_curation(&cfg, &artifacts, Utc::now())
}
