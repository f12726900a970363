//! Event relay for live session subscribers.
//!
//! Each session key owns a broadcast channel; every subscriber gets its own
//! receiver and events fan out to all of them. The relay owns the channel
//! map explicitly so teardown can enumerate and close every stream.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::debug;

/// Discrete events consumed by the push-stream layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A turn started; the assistant is working.
    ThinkingStart,
    /// Incremental output: response text, a block separator, or a tool
    /// status line.
    Token(String),
    /// The turn produced its final response.
    ThinkingEnd,
    /// Asynchronous failure (subprocess exit, inactivity timeout).
    StreamError(String),
    /// The session ended; no further events will arrive.
    Close,
}

/// Visual separator emitted between content blocks of one turn.
pub const BLOCK_SEPARATOR: &str = "\n\n---\n\n";

/// Fan-out hub mapping session keys to broadcast channels.
#[derive(Clone)]
pub struct EventRelay {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<RelayEvent>>>>,
    capacity: usize,
}

impl EventRelay {
    /// Create a relay whose per-session channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Create with the default channel capacity.
    pub fn with_defaults() -> Self {
        Self::new(256)
    }

    /// Subscribe to a session's event stream, creating the channel if the
    /// session has no subscribers yet.
    pub async fn subscribe(&self, session_key: &str) -> broadcast::Receiver<RelayEvent> {
        self.sender(session_key).await.subscribe()
    }

    /// Publish an event to a session's subscribers. Events published before
    /// anyone subscribes are dropped, matching broadcast semantics.
    pub async fn publish(&self, session_key: &str, event: RelayEvent) {
        let tx = self.sender(session_key).await;
        // send only errs when there are no receivers; that is fine.
        let _ = tx.send(event);
    }

    /// Publish `Close` and drop the session's channel.
    pub async fn close(&self, session_key: &str) {
        let removed = self.channels.write().await.remove(session_key);
        if let Some(tx) = removed {
            let _ = tx.send(RelayEvent::Close);
            debug!(session_key, "Relay channel closed");
        }
    }

    /// Number of sessions with an open channel.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    async fn sender(&self, session_key: &str) -> broadcast::Sender<RelayEvent> {
        {
            let channels = self.channels.read().await;
            if let Some(tx) = channels.get(session_key) {
                return tx.clone();
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(session_key.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let relay = EventRelay::with_defaults();
        let mut rx1 = relay.subscribe("s-1").await;
        let mut rx2 = relay.subscribe("s-1").await;

        relay.publish("s-1", RelayEvent::ThinkingStart).await;

        assert_eq!(rx1.recv().await.unwrap(), RelayEvent::ThinkingStart);
        assert_eq!(rx2.recv().await.unwrap(), RelayEvent::ThinkingStart);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let relay = EventRelay::with_defaults();
        let mut rx_other = relay.subscribe("s-2").await;

        relay
            .publish("s-1", RelayEvent::Token("hello".into()))
            .await;
        relay.publish("s-2", RelayEvent::ThinkingEnd).await;

        assert_eq!(rx_other.recv().await.unwrap(), RelayEvent::ThinkingEnd);
    }

    #[tokio::test]
    async fn close_delivers_close_and_removes_channel() {
        let relay = EventRelay::with_defaults();
        let mut rx = relay.subscribe("s-1").await;
        assert_eq!(relay.channel_count().await, 1);

        relay.close("s-1").await;

        assert_eq!(rx.recv().await.unwrap(), RelayEvent::Close);
        assert_eq!(relay.channel_count().await, 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let relay = EventRelay::with_defaults();
        relay.publish("s-1", RelayEvent::ThinkingStart).await;
        relay.close("ghost").await;
    }

    #[tokio::test]
    async fn order_is_preserved_per_session() {
        let relay = EventRelay::with_defaults();
        let mut rx = relay.subscribe("s-1").await;

        relay.publish("s-1", RelayEvent::ThinkingStart).await;
        relay.publish("s-1", RelayEvent::Token("a".into())).await;
        relay.publish("s-1", RelayEvent::Token("b".into())).await;
        relay.publish("s-1", RelayEvent::ThinkingEnd).await;

        assert_eq!(rx.recv().await.unwrap(), RelayEvent::ThinkingStart);
        assert_eq!(rx.recv().await.unwrap(), RelayEvent::Token("a".into()));
        assert_eq!(rx.recv().await.unwrap(), RelayEvent::Token("b".into()));
        assert_eq!(rx.recv().await.unwrap(), RelayEvent::ThinkingEnd);
    }
}
