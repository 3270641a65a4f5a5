use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::app_state::AppState;
use crate::broker::resilience::CircuitState;

/// A health probe should not sit through a whole reconnect cycle.
const BROKER_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub broker: BrokerHealth,
    pub providers: ProviderHealth,
}

#[derive(Serialize)]
pub struct BrokerHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
}

#[derive(Serialize)]
pub struct ProviderHealth {
    pub status: String,
    pub configured: usize,
    pub fallbacks: u64,
}

/// GET /health: broker connectivity and provider availability.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();
    let broker_ok = tokio::time::timeout(BROKER_CHECK_TIMEOUT, state.connection.check_connection())
        .await
        .unwrap_or(false);
    let circuit = state.connection.circuit();
    let broker = BrokerHealth {
        status: if broker_ok { "ok" } else { "error" }.to_string(),
        latency_ms: broker_ok.then(|| start.elapsed().as_millis() as u64),
        circuit_state: circuit.state,
        failure_count: circuit.failure_count,
    };

    let classifier = state.runner.batch().classifier();
    let configured = classifier.provider_count();
    let providers = ProviderHealth {
        status: if configured > 0 { "ok" } else { "error" }.to_string(),
        configured,
        fallbacks: classifier.fallback_count(),
    };

    let all_healthy = broker_ok && configured > 0;
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { broker, providers },
    };

    (status_code, Json(response))
}
