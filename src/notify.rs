use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for change notifications, one channel per space or pass.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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

    /// Subscribe to changes of a space or pass. Creates the channel if needed.
    pub fn subscribe(&self, record_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(record_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, record_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&record_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the channel of a deleted record; subscribers see the stream close.
    pub fn remove(&self, record_id: &Ulid) {
        self.channels.remove(record_id);
    }
}
