use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::session::{PeerSession, SessionState};
use crate::transport::{TransportEvent, TransportEvents, TransportFactory};
use crate::types::{ParticipantId, Role};

/// Sole owner of the peer-id -> session map.
pub struct PeerSessionManager {
    sessions: HashMap<ParticipantId, PeerSession>,
    factory: Arc<dyn TransportFactory>,
    events: mpsc::UnboundedSender<TransportEvent>,
    next_generation: u64,
}

impl PeerSessionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            factory,
            events,
            next_generation: 1,
        }
    }

    /// Replace any existing session for `peer` with a fresh one in `role`.
    pub async fn get_or_create(
        &mut self,
        local: &ParticipantId,
        peer: &ParticipantId,
        role: Role,
    ) -> Result<&mut PeerSession, TransportError> {
        if self.remove(peer).await {
            debug!(peer = %peer, "replaced existing session");
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let events = TransportEvents::new(peer.clone(), generation, self.events.clone());
        let transport = self.factory.open(local, peer, role, events).await?;
        info!(peer = %peer, %role, generation, "session created");

        let session = PeerSession::new(peer.clone(), role, generation, transport);
        match self.sessions.entry(peer.clone()) {
            Entry::Vacant(slot) => Ok(slot.insert(session)),
            Entry::Occupied(mut slot) => {
                // Removed above and we hold &mut self, but never leak a transport.
                slot.get_mut().close().await;
                slot.insert(session);
                Ok(slot.into_mut())
            }
        }
    }

    /// Close and forget the session for `peer`. No-op for unknown ids.
    pub async fn remove(&mut self, peer: &ParticipantId) -> bool {
        match self.sessions.remove(peer) {
            Some(mut session) => {
                session.close().await;
                info!(
                    peer = %peer,
                    generation = session.generation(),
                    age_ms = session.created_at().elapsed().as_millis() as u64,
                    "session removed"
                );
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer: &ParticipantId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &ParticipantId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    /// The session for `peer` only if it is the instance stamped `generation`.
    pub fn current(&mut self, peer: &ParticipantId, generation: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer)
            .filter(|s| s.generation() == generation)
    }

    pub fn contains(&self, peer: &ParticipantId) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn connected(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions
            .values()
            .filter(|s| s.state() == SessionState::Connected)
    }

    pub fn connected_count(&self) -> usize {
        self.connected().count()
    }

    pub fn connected_peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<_> = self.connected().map(|s| s.peer_id().clone()).collect();
        peers.sort();
        peers
    }

    pub async fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close().await;
        }
    }
}
