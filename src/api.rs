//! HTTP surface: turn submission, the SSE event stream, and status probes.

mod chat;
mod events;
mod status;

use crate::chat::ChatOrchestrator;
use crate::limiter::RateLimiter;
use crate::pool::PoolHandle;
use crate::realtime::EventBus;
use axum::Router;
use axum::routing::{get, post};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared state for API handlers.
pub struct ApiState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub bus: EventBus,
    pub limiter: RateLimiter,
    pub pool: PoolHandle,
    /// Root directory for uploaded dataset files.
    pub data_dir: PathBuf,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/chat", post(chat::chat_send))
        .route("/api/events", get(events::events))
        .route("/api/limits", get(status::limits))
        .route("/api/pool/health", get(status::pool_health))
        .with_state(state)
}
