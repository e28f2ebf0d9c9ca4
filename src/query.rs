//! HTTP query surface over the forecast store and model registry.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::forecast_store::{ForecastStore, StoreError};
use crate::registry::ModelRegistry;
use crate::spike::{scan_for_spike, SpikeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Forecast,
    Metadata,
    Spike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(rename = "queryType")]
    pub query_type: QueryType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeResponse {
    pub spike: Option<SpikeResult>,
    pub threshold: f64,
    pub message: String,
}

#[derive(Clone)]
pub struct QueryState {
    pub forecasts: Arc<dyn ForecastStore>,
    pub registry: Arc<dyn ModelRegistry>,
    pub spike_threshold: f64,
    pub market_timezone: Tz,
    pub clock: fn() -> DateTime<Utc>,
}

impl QueryState {
    pub fn new(
        forecasts: Arc<dyn ForecastStore>,
        registry: Arc<dyn ModelRegistry>,
        spike_threshold: f64,
        market_timezone: Tz,
    ) -> Self {
        Self {
            forecasts,
            registry,
            spike_threshold,
            market_timezone,
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }
}

pub fn query_router(state: QueryState) -> Router {
    Router::new()
        .route("/query", post(post_query))
        .route("/health", get(get_health))
        .with_state(state)
}

async fn get_health() -> &'static str {
    "ok"
}

async fn post_query(State(state): State<QueryState>, Json(req): Json<QueryRequest>) -> Response {
    let now = (state.clock)();
    let result = match req.query_type {
        QueryType::Forecast => state
            .forecasts
            .scan(now)
            .map(|records| Json(records).into_response()),
        QueryType::Metadata => state
            .registry
            .list_versions()
            .map(|versions| Json(versions).into_response()),
        QueryType::Spike => scan_for_spike(
            state.forecasts.as_ref(),
            now,
            state.market_timezone,
            state.spike_threshold,
        )
        .map(|spike| Json(spike_response(spike, state.spike_threshold)).into_response()),
    };

    match result {
        Ok(response) => {
            info!(
                component = "query",
                event = "query.served",
                query_type = ?req.query_type
            );
            response
        }
        Err(err) => store_failure(req.query_type, err),
    }
}

fn spike_response(spike: Option<SpikeResult>, threshold: f64) -> SpikeResponse {
    let message = match spike {
        Some(found) => format!(
            "price spike of {} forecast at {}",
            found.price, found.timestamp
        ),
        None => format!("no forecast price above {threshold}"),
    };
    SpikeResponse {
        spike,
        threshold,
        message,
    }
}

fn store_failure(query_type: QueryType, err: StoreError) -> Response {
    warn!(
        component = "query",
        event = "query.failed",
        query_type = ?query_type,
        error = %err
    );
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_type_parses_lowercase_names() {
        let req: QueryRequest = serde_json::from_str(r#"{"queryType":"spike"}"#).unwrap();
        assert_eq!(req.query_type, QueryType::Spike);
        assert!(serde_json::from_str::<QueryRequest>(r#"{"queryType":"Spike"}"#).is_err());
    }

    #[test]
    fn spike_message_names_the_threshold_when_nothing_found() {
        let response = spike_response(None, 150.0);
        assert_eq!(response.message, "no forecast price above 150");
        assert_eq!(
            serde_json::to_value(&response).unwrap()["spike"],
            serde_json::Value::Null
        );
    }
}
