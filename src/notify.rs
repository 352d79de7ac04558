use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const CHANNEL_PREFIX: &str = "professional_";

/// LISTEN channel name for a professional's schedule.
pub fn channel_name(professional_id: Ulid) -> String {
    format!("{CHANNEL_PREFIX}{professional_id}")
}

/// Inverse of [`channel_name`]. `None` for anything that isn't `professional_<ulid>`.
pub fn parse_channel(channel: &str) -> Option<Ulid> {
    let id = channel.strip_prefix(CHANNEL_PREFIX)?;
    Ulid::from_string(id).ok()
}

/// NOTIFY payload: the event as a JSON object.
pub fn payload(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
}

/// Broadcast hub for LISTEN/NOTIFY, one channel per professional.
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

    /// Subscribe to a professional's schedule changes. Creates the channel if needed.
    pub fn subscribe(&self, professional_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(professional_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, professional_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&professional_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the channel once its last receiver is gone.
    pub fn prune(&self, professional_id: &Ulid) {
        self.channels
            .remove_if(professional_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
