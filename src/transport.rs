//! Seam between a peer session and the direct transport that carries it.
//!
//! Transports report everything that happens on their own tasks through
//! [`TransportEvents`]; the coordinator loop is the only consumer, so no
//! transport callback ever touches session state directly.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::types::{ParticipantId, Role};

/// One direct connection to a remote participant.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce the local offer (initiator only).
    async fn create_offer(&self) -> Result<Value, TransportError>;

    /// Apply a remote offer and produce the answer (responder only).
    async fn accept_offer(&self, offer: Value) -> Result<Value, TransportError>;

    /// Apply the remote answer (initiator only).
    async fn accept_answer(&self, answer: Value) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError>;

    async fn send_text(&self, payload: String) -> Result<(), TransportError>;

    /// Release the connection. Must be idempotent.
    async fn close(&self);
}

/// Builds a transport for a new session.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        role: Role,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// Locally gathered ICE candidate to trickle to the remote side
    LocalCandidate(Value),
    /// The transport can carry payloads
    Established,
    /// Connectivity lost; may still recover
    Interrupted,
    /// Unrecoverable failure
    Failed(String),
    /// Inbound payload
    Data(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub peer: ParticipantId,
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Event sink handed to a transport, stamped with the session it belongs to.
#[derive(Clone)]
pub struct TransportEvents {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub fn new(
        peer: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    /// Returns false once the coordinator is gone.
    pub fn emit(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                peer: self.peer.clone(),
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}
