//! Status probes: rate limit standing and pool health.

use super::ApiState;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct LimitsQuery {
    user_id: String,
}

pub(super) async fn limits(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitsQuery>,
) -> Result<Json<crate::limiter::RateLimitStatus>, StatusCode> {
    state
        .limiter
        .check_limit(&query.user_id)
        .await
        .map(Json)
        .map_err(|error| {
            tracing::error!(%error, "limit check failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

pub(super) async fn pool_health(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<crate::pool::PoolHealth>, StatusCode> {
    state.pool.health().await.map(Json).map_err(|error| {
        tracing::error!(%error, "pool health probe failed");
        StatusCode::SERVICE_UNAVAILABLE
    })
}
