//! Outbound notification events
//!
//! The ledger and registry publish fire-and-forget events for delivery to a
//! remote display. Publishing never waits on delivery.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::PlayerId;

/// Events emitted by the economy services
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EconomyEvent {
    BalanceChanged {
        player: PlayerId,
        balance: Decimal,
    },
    TerritoryChanged {
        player: PlayerId,
        owner_name: Option<String>,
        claim_name: Option<String>,
    },
}

/// One-way publish capability of the notification collaborator
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: EconomyEvent);
}

/// Fire-and-forget fan-out over a broadcast channel. Slow receivers lag and
/// skip events; publishing never blocks.
pub struct EventBus {
    sender: broadcast::Sender<EconomyEvent>,
}

impl EventBus {
    const CAPACITY: usize = 1024;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EconomyEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for EventBus {
    fn publish(&self, event: EconomyEvent) {
        trace!(event = ?event, "Publishing economy event");
        // Send only fails when nobody is listening
        let _ = self.sender.send(event);
    }
}

/// Log every published event until the bus is dropped
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(EconomyEvent::BalanceChanged { player, balance }) => {
                    debug!(player = %player, balance = %balance, "Balance changed");
                }
                Ok(EconomyEvent::TerritoryChanged { player, claim_name, .. }) => {
                    debug!(player = %player, claim = ?claim_name, "Territory changed");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::time::{timeout, Duration};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        let player = Uuid::new_v4();

        bus.publish(EconomyEvent::BalanceChanged {
            player,
            balance: dec!(90),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        assert_eq!(
            event,
            EconomyEvent::BalanceChanged {
                player,
                balance: dec!(90)
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(EconomyEvent::TerritoryChanged {
            player: Uuid::new_v4(),
            owner_name: None,
            claim_name: None,
        });
    }

    #[tokio::test]
    async fn test_logging_listener_stops_with_bus() {
        let bus = Arc::new(EventBus::new());
        let listener = spawn_logging_listener(bus.clone());

        bus.publish(EconomyEvent::BalanceChanged {
            player: Uuid::new_v4(),
            balance: dec!(1),
        });
        drop(bus);

        timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener did not stop")
            .unwrap();
    }

    #[test]
    fn test_event_serialization() {
        let event = EconomyEvent::TerritoryChanged {
            player: Uuid::nil(),
            owner_name: Some("owner".into()),
            claim_name: Some("Claim #3".into()),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"territory_changed\""));
        assert!(json.contains("\"claim_name\":\"Claim #3\""));
    }
}
