use std::{net::SocketAddr, sync::Arc};

use rrp_forecast::{
    init_logging, log_app_bind, log_app_start, logging_config_from_env, query_router,
    ForecastStore, ModelRegistry, PipelineConfig, QueryState, SqliteForecastStore,
    SqliteModelRegistry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("query_server", &logging_cfg);

    let cfg = PipelineConfig::from_env()?;
    let addr: SocketAddr = std::env::var("RRP_QUERY_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let forecasts: Arc<dyn ForecastStore> =
        Arc::new(SqliteForecastStore::open(&cfg.forecast_store_path)?);
    let registry: Arc<dyn ModelRegistry> =
        Arc::new(SqliteModelRegistry::open(&cfg.metadata_store_path)?);
    let app = query_router(QueryState::new(
        forecasts,
        registry,
        cfg.spike_threshold,
        cfg.market_timezone,
    ));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
