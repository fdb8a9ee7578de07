//! Per-peer connection state machine.
//!
//! `Idle -> Negotiating -> Connected`, with `Closed` reachable from any state
//! and never left. A session that reaches `Closed` is discarded by its
//! manager; reconnecting always means a new session.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::signaling::SignalingClient;
use crate::transport::PeerTransport;
use crate::types::{ParticipantId, Role};
use crate::wsproto::OutboundSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

pub struct PeerSession {
    peer_id: ParticipantId,
    role: Role,
    state: SessionState,
    generation: u64,
    created_at: Instant,
    connected_at: Option<Instant>,
    interrupted_at: Option<Instant>,
    /// Bumped on every interruption; grace timers carry the value they armed for.
    interruptions: u64,
    /// Set while a glaring remote offer is being ignored; its candidates
    /// belong to a connection we will never answer.
    ignoring_remote_offer: bool,
    transport: Arc<dyn PeerTransport>,
    released: bool,
}

impl PeerSession {
    pub fn new(
        peer_id: ParticipantId,
        role: Role,
        generation: u64,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            peer_id,
            role,
            state: SessionState::Idle,
            generation,
            created_at: Instant::now(),
            connected_at: None,
            interrupted_at: None,
            interruptions: 0,
            ignoring_remote_offer: false,
            transport,
            released: false,
        }
    }

    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn is_live(&self) -> bool {
        self.state != SessionState::Closed
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted_at.is_some()
    }

    /// Still down from the interruption numbered `epoch`, with no recovery
    /// in between.
    pub fn interrupted_since(&self, epoch: u64) -> bool {
        self.is_interrupted() && self.interruptions == epoch
    }

    /// Forward-only transition. `Closed` is accepted from anywhere.
    fn advance(&mut self, next: SessionState) -> bool {
        if next <= self.state && next != SessionState::Closed {
            return false;
        }
        if self.state == SessionState::Closed {
            return false;
        }
        debug!(
            peer = %self.peer_id,
            generation = self.generation,
            from = %self.state,
            to = %next,
            "session state transition"
        );
        self.state = next;
        true
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        warn!(peer = %self.peer_id, generation = self.generation, error = %err, "session failed");
        self.advance(SessionState::Closed);
        err
    }

    /// Initiator: move to Negotiating and send the local offer.
    pub async fn begin(
        &mut self,
        local: &ParticipantId,
        signaling: &SignalingClient,
    ) -> Result<(), TransportError> {
        if self.role != Role::Initiator || self.state != SessionState::Idle {
            return Ok(());
        }
        self.advance(SessionState::Negotiating);
        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return Err(self.fail(err)),
        };
        signaling.send(OutboundSignal::Offer {
            sender: local.clone(),
            target: self.peer_id.clone(),
            signal: offer,
        });
        info!(peer = %self.peer_id, "sent offer");
        Ok(())
    }

    /// Responder: accept the remote offer and send the answer.
    pub async fn on_offer(
        &mut self,
        local: &ParticipantId,
        offer: Value,
        signaling: &SignalingClient,
    ) -> Result<(), TransportError> {
        if self.role != Role::Responder || self.state != SessionState::Idle {
            debug!(
                peer = %self.peer_id,
                role = %self.role,
                state = %self.state,
                "offer ignored in this role/state"
            );
            return Ok(());
        }
        self.advance(SessionState::Negotiating);
        let answer = match self.transport.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(err) => return Err(self.fail(err)),
        };
        signaling.send(OutboundSignal::Answer {
            sender: local.clone(),
            target: self.peer_id.clone(),
            signal: answer,
        });
        info!(peer = %self.peer_id, "sent answer");
        Ok(())
    }

    pub async fn on_answer(&mut self, answer: Value) -> Result<(), TransportError> {
        if self.role != Role::Initiator || self.state != SessionState::Negotiating {
            debug!(
                peer = %self.peer_id,
                role = %self.role,
                state = %self.state,
                "answer ignored in this role/state"
            );
            return Ok(());
        }
        self.ignoring_remote_offer = false;
        if let Err(err) = self.transport.accept_answer(answer).await {
            return Err(self.fail(err));
        }
        debug!(peer = %self.peer_id, "applied answer");
        Ok(())
    }

    /// Forward a remote candidate; dropped once closed.
    pub async fn on_candidate(&mut self, candidate: Value) -> Result<(), TransportError> {
        if !self.is_live() {
            return Ok(());
        }
        if self.ignoring_remote_offer {
            debug!(peer = %self.peer_id, "dropping candidate for ignored offer");
            return Ok(());
        }
        if let Err(err) = self.transport.add_candidate(candidate).await {
            return Err(self.fail(err));
        }
        Ok(())
    }

    /// Glare: the remote offered while our own offer is outstanding and we
    /// keep ours.
    pub fn ignore_remote_offer(&mut self) {
        self.ignoring_remote_offer = true;
    }

    /// Transport reports it can carry payloads. Returns true when this is a
    /// new connection or a recovery from an interruption.
    pub fn on_established(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        let recovered = self.interrupted_at.take().is_some();
        if self.advance(SessionState::Connected) {
            self.connected_at = Some(Instant::now());
            info!(peer = %self.peer_id, role = %self.role, "peer connected");
            return true;
        }
        if recovered {
            info!(peer = %self.peer_id, "peer connection recovered");
        }
        recovered
    }

    /// Returns the interruption epoch when this starts a new grace period.
    pub fn mark_interrupted(&mut self) -> Option<u64> {
        if !self.is_live() || self.interrupted_at.is_some() {
            return None;
        }
        self.interrupted_at = Some(Instant::now());
        self.interruptions += 1;
        Some(self.interruptions)
    }

    pub async fn send_text(&self, payload: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.transport.send_text(payload).await
    }

    /// Enter `Closed` and release the transport. Idempotent.
    pub async fn close(&mut self) {
        self.advance(SessionState::Closed);
        if !self.released {
            self.released = true;
            self.transport.close().await;
        }
    }
}
