//! Realtime event channel: a broadcast bus multiplexing all conversations
//! over one stream per connected session.
//!
//! Delivery is best-effort and ordered per connection. A slow or disconnected
//! receiver lags off the end of the broadcast buffer and simply misses those
//! events; the orchestrator never blocks on client consumption. Clients
//! reconnect with backoff (the SSE response carries a retry hint) and catch up
//! from persisted state, not from a server-side replay queue.

use crate::events::WsEvent;
use tokio::sync::broadcast;

/// Buffered events per receiver before lag starts dropping the oldest.
const BUS_CAPACITY: usize = 1024;

/// Reconnect hint sent to SSE clients, in milliseconds. Clients double this
/// up to [`RECONNECT_MAX_MS`] on repeated failures.
pub const RECONNECT_BASE_MS: u64 = 500;
pub const RECONNECT_MAX_MS: u64 = 15_000;

/// Shared event bus. Cheap to clone; all clones publish into the same stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WsEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Returns the number of live subscribers; zero is not
    /// an error; events for a fully disconnected session are dropped.
    pub fn publish(&self, event: WsEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => 0,
        }
    }

    /// Subscribe a new session connection.
    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Whether an event applies to a session whose active conversation is
/// `active`. Events without a conversation id are global and always apply;
/// events for a different conversation are dropped silently so a stale turn
/// cannot pollute the conversation the user switched to.
pub fn event_applies(event: &WsEvent, active: Option<&str>) -> bool {
    match event.conversation_id() {
        None => true,
        Some(cid) => active.is_some_and(|active| active == cid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WsEvent;

    fn token(cid: &str) -> WsEvent {
        WsEvent::AnswerToken {
            conversation_id: cid.into(),
            text: "x".into(),
        }
    }

    #[test]
    fn event_for_other_conversation_is_dropped() {
        let event = token("conv-A");
        assert!(event_applies(&event, Some("conv-A")));
        assert!(!event_applies(&event, Some("conv-B")));
    }

    #[test]
    fn global_events_apply_to_any_active_conversation() {
        let event = WsEvent::UsageUpdate {
            usage_tokens: 1,
            limit_tokens: 10,
            usage_percent: 10.0,
            remaining_tokens: 9,
        };
        assert!(event_applies(&event, Some("conv-A")));
        assert!(event_applies(&event, None));
    }

    #[test]
    fn session_without_active_conversation_gets_only_globals() {
        assert!(!event_applies(&token("conv-A"), None));
    }

    #[tokio::test]
    async fn bus_delivers_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(token("a"));
        bus.publish(token("b"));
        bus.publish(token("c"));

        for expected in ["a", "b", "c"] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.conversation_id(), Some(expected));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(token("a")), 0);
    }
}
