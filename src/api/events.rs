//! The per-session SSE event stream.
//!
//! One connection multiplexes every conversation of the session. The
//! optional `conversation_id` query narrows delivery to the session's active
//! conversation plus global events. It is the same filter clients apply,
//! enforced server-side to spare the wire.

use super::ApiState;
use crate::realtime::{RECONNECT_BASE_MS, event_applies};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

#[derive(Deserialize)]
pub(super) struct EventsQuery {
    conversation_id: Option<String>,
}

pub(super) async fn events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();
    let active = query.conversation_id;
    tracing::debug!(
        active_conversation = active.as_deref().unwrap_or("<all>"),
        "event stream connected"
    );

    let stream = BroadcastStream::new(rx).filter_map(move |item| {
        let event = match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                // A slow client misses events rather than backpressuring the
                // orchestrator; it reconnects and catches up from state.
                tracing::warn!(skipped, "event stream lagged, events dropped");
                return None;
            }
        };
        if !event_applies(&event, active.as_deref()) {
            return None;
        }
        match serde_json::to_string(&event) {
            Ok(json) => Some(Ok::<_, Infallible>(
                Event::default()
                    .data(json)
                    .retry(Duration::from_millis(RECONNECT_BASE_MS)),
            )),
            Err(error) => {
                tracing::error!(%error, "unserializable event");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
