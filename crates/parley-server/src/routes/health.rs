//! Health check and stats endpoints.

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use parley_cache::{CacheServiceStats, HealthReport, HealthStatus};
use serde::Serialize;

use crate::registry::RegistryStats;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Cache layer probes.
    pub cache: HealthReport,
}

/// Stats response.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: RegistryStats,
    pub cache: CacheServiceStats,
}

/// GET /health. Answers 503 when the cache store is unreachable.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let cache = state.cache.health_check().await;
    let code = match cache.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };

    (
        code,
        Json(HealthResponse {
            status: cache.status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            cache,
        }),
    )
}

/// GET /stats.
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connections: state.registry.stats(),
        cache: state.cache.get_stats().await,
    })
}

/// Create health and stats routes.
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
}
