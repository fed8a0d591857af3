//! Turn submission endpoint.

use super::ApiState;
use crate::DatasetRef;
use crate::chat::{TurnAdmission, TurnRequest};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct ChatSendRequest {
    user_id: String,
    conversation_id: String,
    message: String,
    #[serde(default)]
    dataset_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(super) enum ChatSendResponse {
    /// The turn is streaming; follow it on `/api/events`.
    Accepted { message_id: String },
    /// Rolling-window limit reached; no turn was started.
    Denied {
        resets_in_seconds: i64,
        usage_percent: f64,
    },
    /// The conversation already has a turn streaming.
    Busy,
}

/// Fire-and-forget turn submission: admission is checked synchronously, the
/// streamed response arrives via the event stream.
pub(super) async fn chat_send(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ChatSendRequest>,
) -> Result<Json<ChatSendResponse>, StatusCode> {
    let datasets = resolve_datasets(&state, &request.dataset_ids);
    let turn = TurnRequest {
        user_id: request.user_id,
        conversation_id: request.conversation_id,
        message: request.message,
        datasets,
    };

    let admission = state.orchestrator.clone().begin_turn(turn).await.map_err(|error| {
        tracing::error!(%error, "failed to start turn");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let response = match admission {
        TurnAdmission::Accepted { message_id } => ChatSendResponse::Accepted {
            message_id: message_id.to_string(),
        },
        TurnAdmission::Denied(status) => ChatSendResponse::Denied {
            resets_in_seconds: status.resets_in_seconds,
            usage_percent: status.usage_percent.min(100.0),
        },
        TurnAdmission::Busy => ChatSendResponse::Busy,
    };
    Ok(Json(response))
}

/// Dataset files live under `<data_dir>/datasets/<id>.db`; ingestion put
/// them there and is out of scope here.
fn resolve_datasets(state: &ApiState, dataset_ids: &[String]) -> Vec<DatasetRef> {
    dataset_ids
        .iter()
        .map(|id| DatasetRef {
            id: id.clone(),
            path: state.data_dir.join("datasets").join(format!("{id}.db")),
        })
        .collect()
}
