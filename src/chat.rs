use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::events::Notifier;
use crate::sessions::PeerSessionManager;
use crate::types::ParticipantId;

/// Wire payload carried on every peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub author: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    Peer(ParticipantId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub message: ChatMessage,
    pub origin: Origin,
    pub received_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(message: ChatMessage, origin: Origin) -> Self {
        Self {
            message,
            origin,
            received_at: Utc::now(),
        }
    }
}

/// Owns the local message log and fans chat text out to connected peers.
pub struct MessageBroadcaster {
    username: String,
    log: Vec<LogEntry>,
    notifier: Notifier,
}

impl MessageBroadcaster {
    pub fn new(username: impl Into<String>, notifier: Notifier) -> Self {
        Self {
            username: username.into(),
            log: Vec::new(),
            notifier,
        }
    }

    /// Append locally, then deliver to every connected session. Returns the
    /// peers whose delivery failed; the caller tears those sessions down.
    pub async fn send(&mut self, text: &str, sessions: &PeerSessionManager) -> Vec<ParticipantId> {
        if text.trim().is_empty() {
            debug!("ignoring blank chat text");
            return Vec::new();
        }
        let message = ChatMessage {
            author: self.username.clone(),
            text: text.to_string(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode chat message");
                return Vec::new();
            }
        };
        self.append(LogEntry::new(message, Origin::Local));

        let mut failed = Vec::new();
        for session in sessions.connected() {
            if let Err(err) = session.send_text(payload.clone()).await {
                warn!(peer = %session.peer_id(), error = %err, "chat delivery failed");
                failed.push(session.peer_id().clone());
            }
        }
        failed
    }

    /// Parse an inbound payload from `from` and append it. Malformed payloads
    /// are logged and dropped.
    pub fn receive(&mut self, from: &ParticipantId, payload: &[u8]) -> Option<&LogEntry> {
        let message = match decode(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(peer = %from, error = %err, "dropping malformed chat payload");
                return None;
            }
        };
        self.append(LogEntry::new(message, Origin::Peer(from.clone())));
        self.log.last()
    }

    pub fn history(&self) -> &[LogEntry] {
        &self.log
    }

    fn append(&mut self, entry: LogEntry) {
        self.notifier.message_appended(&entry);
        self.log.push(entry);
    }
}

fn decode(payload: &[u8]) -> Result<ChatMessage, ParseError> {
    let text = std::str::from_utf8(payload).map_err(|_| ParseError::NotUtf8)?;
    Ok(serde_json::from_str(text)?)
}
