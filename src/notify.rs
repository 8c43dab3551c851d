use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

/// A post-commit notification: who to tell, what happened, and a JSON
/// payload for the downstream delivery system.
#[derive(Debug, Clone)]
pub struct Notice {
    pub recipient: Ulid,
    pub event: &'static str,
    pub payload: serde_json::Value,
}

/// Broadcast hub keyed by recipient (owner or customer id). Dispatch is
/// fire-and-forget: a failed or unheard send is logged, never propagated
/// back into the state change that produced it.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notice: Notice) {
        if let Some(sender) = self.channels.get(&notice.recipient) {
            if let Err(e) = sender.send(notice) {
                tracing::debug!("notification dropped: {e}");
            }
        }
    }

    /// Remove a channel (e.g. when an owner is deleted).
    pub fn remove(&self, recipient: &Ulid) {
        self.channels.remove(recipient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let customer = Ulid::new();
        let mut rx = hub.subscribe(customer);

        hub.send(Notice {
            recipient: customer,
            event: "booking.confirmed",
            payload: serde_json::json!({ "slot_id": Ulid::new().to_string() }),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.recipient, customer);
        assert_eq!(received.event, "booking.confirmed");
        assert!(received.payload.is_object());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(Notice {
            recipient: Ulid::new(),
            event: "booking.cancelled",
            payload: serde_json::Value::Null,
        });
    }

    #[tokio::test]
    async fn removed_channel_stops_delivery() {
        let hub = NotifyHub::new();
        let owner = Ulid::new();
        let mut rx = hub.subscribe(owner);
        hub.remove(&owner);
        hub.send(Notice {
            recipient: owner,
            event: "booking.created",
            payload: serde_json::Value::Null,
        });
        // Sender side was dropped with the channel entry.
        assert!(rx.try_recv().is_err());
    }
}
