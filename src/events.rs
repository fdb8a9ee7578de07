use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::chat::LogEntry;
use crate::types::ParticipantId;

/// Observable outputs of the core. The presentation layer subscribes; only
/// the coordinator publishes.
#[derive(Clone)]
pub struct Notifier {
    messages: broadcast::Sender<LogEntry>,
    peer_count: Arc<watch::Sender<usize>>,
    local_id: Arc<watch::Sender<Option<ParticipantId>>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(256);
        let (peer_count, _) = watch::channel(0);
        let (local_id, _) = watch::channel(None);
        Self {
            messages,
            peer_count: Arc::new(peer_count),
            local_id: Arc::new(local_id),
        }
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<LogEntry> {
        self.messages.subscribe()
    }

    pub fn peer_count(&self) -> watch::Receiver<usize> {
        self.peer_count.subscribe()
    }

    pub fn local_id(&self) -> watch::Receiver<Option<ParticipantId>> {
        self.local_id.subscribe()
    }

    pub(crate) fn message_appended(&self, entry: &LogEntry) {
        // No subscribers is fine.
        let _ = self.messages.send(entry.clone());
    }

    pub(crate) fn set_peer_count(&self, count: usize) {
        self.peer_count.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
    }

    pub(crate) fn set_local_id(&self, id: Option<ParticipantId>) {
        self.local_id.send_replace(id);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
