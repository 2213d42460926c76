//! Dual-channel event delivery.
//!
//! All emission goes through one `EventBus::emit` call so ordering is
//! decided exactly once. The bus feeds:
//! - a pull-based unbounded mpsc channel (the primary consumer), and
//! - a `tokio::sync::broadcast` channel (legacy fan-out).
//!
//! Both channels receive every event in emission order. Neither can block
//! the other: the primary channel is unbounded and the broadcast channel
//! drops from lagging subscribers rather than applying backpressure.

use tokio::sync::{broadcast, mpsc};

use super::AgentEvent;

const BROADCAST_CAPACITY: usize = 256;

/// Single emission point for [`AgentEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    primary: mpsc::UnboundedSender<AgentEvent>,
    fanout: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Create a bus and the primary receiver that consumes it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        Self::with_capacity(BROADCAST_CAPACITY)
    }

    /// Create a bus with an explicit broadcast buffer capacity.
    pub fn with_capacity(fanout_capacity: usize) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (primary, primary_rx) = mpsc::unbounded_channel();
        let (fanout, _) = broadcast::channel(fanout_capacity);
        (Self { primary, fanout }, primary_rx)
    }

    /// Emit one event to both channels, primary first.
    ///
    /// A closed primary receiver or an absent broadcast subscriber is not
    /// an error: the loop keeps running and the remaining channel keeps
    /// receiving.
    pub fn emit(&self, event: AgentEvent) {
        tracing::trace!(event = event.wire_name(), result_id = event.result_id(), "emit");
        let _ = self.primary.send(event.clone());
        let _ = self.fanout.send(event);
    }

    /// Subscribe a legacy fan-out consumer. Only events emitted after the
    /// call are observed.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.fanout.subscribe()
    }

    /// Handle to the fan-out side alone, for consumers that must outlive
    /// the primary sender.
    pub(crate) fn fanout_handle(&self) -> broadcast::Sender<AgentEvent> {
        self.fanout.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> AgentEvent {
        AgentEvent::RunStarted {
            result_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn both_channels_see_every_event_in_order() {
        let (bus, mut primary) = EventBus::new();
        let mut fanout = bus.subscribe();

        bus.emit(started("a"));
        bus.emit(started("b"));
        bus.emit(started("c"));

        for expected in ["a", "b", "c"] {
            let event = primary.recv().await.unwrap();
            assert_eq!(event.result_id(), expected);
            let event = fanout.recv().await.unwrap();
            assert_eq!(event.result_id(), expected);
        }
    }

    #[tokio::test]
    async fn emission_survives_closed_primary() {
        let (bus, primary) = EventBus::new();
        let mut fanout = bus.subscribe();
        drop(primary);

        bus.emit(started("a"));
        assert_eq!(fanout.recv().await.unwrap().result_id(), "a");
    }

    #[tokio::test]
    async fn emission_survives_missing_subscribers() {
        let (bus, mut primary) = EventBus::new();

        // No broadcast subscriber at all.
        bus.emit(started("a"));
        assert_eq!(primary.recv().await.unwrap().result_id(), "a");
    }
}
