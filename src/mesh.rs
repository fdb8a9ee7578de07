//! Mesh coordinator: one task that owns every session and the message log,
//! and reacts to signaling, transport, timer and user events one at a time.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::chat::{LogEntry, MessageBroadcaster};
use crate::error::TransportError;
use crate::events::Notifier;
use crate::sessions::PeerSessionManager;
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::transport::{TransportEvent, TransportEventKind, TransportFactory};
use crate::types::{ParticipantId, Role};
use crate::wsproto::{OutboundSignal, SignalingMessage};

#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub username: String,
    /// How long an interrupted session may stay before it is torn down.
    pub grace_period: Duration,
}

impl MeshOptions {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            grace_period: Duration::from_millis(crate::config::DEFAULT_GRACE_PERIOD_MS),
        }
    }
}

pub enum MeshCommand {
    Send {
        text: String,
        reply: oneshot::Sender<Vec<ParticipantId>>,
    },
    History(oneshot::Sender<Vec<LogEntry>>),
}

/// Presentation-side handle. Cheap to clone.
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<MeshCommand>,
    notifier: Notifier,
    shutdown: Arc<Notify>,
}

impl MeshHandle {
    /// Broadcast `text`. Resolves once the local log has the entry and every
    /// connected peer has been tried; yields the peers that failed.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<Vec<ParticipantId>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(MeshCommand::Send {
                text: text.into(),
                reply,
            })
            .map_err(|_| anyhow::anyhow!("mesh stopped"))?;
        rx.await.context("mesh stopped")
    }

    pub async fn history(&self) -> Result<Vec<LogEntry>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(MeshCommand::History(reply))
            .map_err(|_| anyhow::anyhow!("mesh stopped"))?;
        rx.await.context("mesh stopped")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.notifier.subscribe_messages()
    }

    pub fn peer_count(&self) -> watch::Receiver<usize> {
        self.notifier.peer_count()
    }

    pub fn local_id(&self) -> watch::Receiver<Option<ParticipantId>> {
        self.notifier.local_id()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[derive(Debug)]
struct GraceExpired {
    peer: ParticipantId,
    generation: u64,
    epoch: u64,
}

struct Inbox {
    signals: mpsc::UnboundedReceiver<SignalingEvent>,
    transport: mpsc::UnboundedReceiver<TransportEvent>,
    grace: mpsc::UnboundedReceiver<GraceExpired>,
    commands: mpsc::UnboundedReceiver<MeshCommand>,
    shutdown: Arc<Notify>,
}

pub struct MeshCoordinator {
    local_id: Option<ParticipantId>,
    signaling: SignalingClient,
    sessions: PeerSessionManager,
    chat: MessageBroadcaster,
    notifier: Notifier,
    grace_period: Duration,
    grace_tx: mpsc::UnboundedSender<GraceExpired>,
}

impl MeshCoordinator {
    /// Start the coordinator loop on the current runtime.
    pub fn spawn(
        signaling: SignalingClient,
        signals: mpsc::UnboundedReceiver<SignalingEvent>,
        factory: Arc<dyn TransportFactory>,
        opts: MeshOptions,
    ) -> (MeshHandle, JoinHandle<()>) {
        let (coordinator, transport, grace) = Self::new(signaling, factory, opts);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let handle = MeshHandle {
            commands: commands_tx,
            notifier: coordinator.notifier.clone(),
            shutdown: shutdown.clone(),
        };
        let inbox = Inbox {
            signals,
            transport,
            grace,
            commands,
            shutdown,
        };
        let join = tokio::spawn(coordinator.run(inbox));
        (handle, join)
    }

    fn new(
        signaling: SignalingClient,
        factory: Arc<dyn TransportFactory>,
        opts: MeshOptions,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedReceiver<GraceExpired>,
    ) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (grace_tx, grace_rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new();
        let coordinator = Self {
            local_id: None,
            signaling,
            sessions: PeerSessionManager::new(factory, transport_tx),
            chat: MessageBroadcaster::new(opts.username, notifier.clone()),
            notifier,
            grace_period: opts.grace_period,
            grace_tx,
        };
        (coordinator, transport_rx, grace_rx)
    }

    async fn run(mut self, mut inbox: Inbox) {
        let mut signals_open = true;
        loop {
            tokio::select! {
                _ = inbox.shutdown.notified() => break,
                ev = inbox.signals.recv(), if signals_open => match ev {
                    Some(ev) => self.handle_signal(ev).await,
                    None => {
                        warn!("signaling client stopped");
                        signals_open = false;
                        self.on_lost();
                    }
                },
                Some(ev) = inbox.transport.recv() => self.handle_transport_event(ev).await,
                Some(expired) = inbox.grace.recv() => {
                    self.handle_grace_expired(expired).await;
                }
                cmd = inbox.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
            }
        }

        let stats = self.signaling.stats();
        info!(
            frames_sent = stats.frames_sent,
            frames_recv = stats.frames_recv,
            frames_dropped = stats.frames_dropped,
            reconnects = stats.reconnects,
            last_error = %stats.last_error,
            "mesh shutting down"
        );
        self.sessions.close_all().await;
        self.publish_peer_count();
    }

    async fn handle_signal(&mut self, ev: SignalingEvent) {
        match ev {
            SignalingEvent::Connected => debug!("signaling connected, awaiting identity"),
            SignalingEvent::Lost => self.on_lost(),
            SignalingEvent::Message(msg) => {
                self.handle_message(msg).await;
                self.publish_peer_count();
            }
        }
    }

    async fn handle_message(&mut self, msg: SignalingMessage) {
        debug!(kind = msg.kind(), sender = ?msg.sender(), "signaling message");
        if let SignalingMessage::Init {
            id,
            other_client_ids,
        } = msg
        {
            self.on_init(id, other_client_ids).await;
            return;
        }
        let Some(local) = self.local_id.clone() else {
            debug!(kind = msg.kind(), "no local identity, ignoring signaling message");
            return;
        };
        match msg {
            SignalingMessage::Init { .. } => {}
            SignalingMessage::NewPeer { id } => self.on_new_peer(&local, id).await,
            SignalingMessage::Offer { sender, signal, .. } => {
                self.on_offer(&local, sender, signal).await
            }
            SignalingMessage::Answer { sender, signal, .. } => {
                self.on_answer(sender, signal).await
            }
            SignalingMessage::IceCandidate {
                sender, candidate, ..
            } => self.on_candidate(sender, candidate).await,
        }
    }

    async fn on_init(&mut self, id: ParticipantId, others: Vec<ParticipantId>) {
        info!(local = %id, peers = others.len(), "assigned identity");
        self.local_id = Some(id.clone());
        self.notifier.set_local_id(Some(id.clone()));

        let others: BTreeSet<_> = others.into_iter().filter(|p| *p != id).collect();
        for peer in others {
            // Survives a relay reconnect; don't tear down a working link.
            if self.sessions.get(&peer).is_some_and(|s| s.is_connected()) {
                debug!(peer = %peer, "already connected");
                continue;
            }
            self.initiate(&id, &peer).await;
        }
    }

    async fn on_new_peer(&mut self, local: &ParticipantId, id: ParticipantId) {
        if id == *local {
            return;
        }
        if *local < id {
            self.initiate(local, &id).await;
        } else {
            debug!(peer = %id, "awaiting offer from new peer");
        }
    }

    async fn initiate(&mut self, local: &ParticipantId, peer: &ParticipantId) {
        let outcome = match self
            .sessions
            .get_or_create(local, peer, Role::Initiator)
            .await
        {
            Ok(session) => session.begin(local, &self.signaling).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            self.discard(peer, err).await;
        }
    }

    async fn on_offer(&mut self, local: &ParticipantId, sender: ParticipantId, offer: Value) {
        if let Some(existing) = self.sessions.get_mut(&sender) {
            let glare = existing.role() == Role::Initiator
                && existing.is_live()
                && !existing.is_connected();
            if glare && *local < sender {
                info!(peer = %sender, "offer collision, keeping ours");
                existing.ignore_remote_offer();
                return;
            }
            if glare {
                info!(peer = %sender, "offer collision, yielding");
            }
        }

        let outcome = match self
            .sessions
            .get_or_create(local, &sender, Role::Responder)
            .await
        {
            Ok(session) => session.on_offer(local, offer, &self.signaling).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            self.discard(&sender, err).await;
        }
    }

    async fn on_answer(&mut self, sender: ParticipantId, answer: Value) {
        let Some(session) = self.sessions.get_mut(&sender) else {
            debug!(peer = %sender, "answer for unknown session");
            return;
        };
        if let Err(err) = session.on_answer(answer).await {
            self.discard(&sender, err).await;
        }
    }

    async fn on_candidate(&mut self, sender: ParticipantId, candidate: Value) {
        let Some(session) = self.sessions.get_mut(&sender) else {
            debug!(peer = %sender, "candidate for unknown session");
            return;
        };
        if let Err(err) = session.on_candidate(candidate).await {
            self.discard(&sender, err).await;
        }
    }

    fn on_lost(&mut self) {
        if self.local_id.take().is_some() {
            warn!("relay connection lost, identity cleared");
            self.notifier.set_local_id(None);
        }
    }

    async fn handle_transport_event(&mut self, ev: TransportEvent) {
        let TransportEvent {
            peer,
            generation,
            kind,
        } = ev;
        let Some(session) = self.sessions.current(&peer, generation) else {
            debug!(peer = %peer, generation, "stale transport event");
            return;
        };

        match kind {
            TransportEventKind::LocalCandidate(candidate) => match &self.local_id {
                Some(local) => self.signaling.send(OutboundSignal::IceCandidate {
                    sender: local.clone(),
                    target: peer,
                    candidate,
                }),
                None => debug!(peer = %peer, "no identity, local candidate dropped"),
            },
            TransportEventKind::Established => {
                session.on_established();
            }
            TransportEventKind::Interrupted => {
                if let Some(epoch) = session.mark_interrupted() {
                    warn!(
                        peer = %peer,
                        epoch,
                        grace_ms = self.grace_period.as_millis() as u64,
                        "peer connection interrupted"
                    );
                    self.arm_grace_timer(GraceExpired {
                        peer,
                        generation,
                        epoch,
                    });
                }
            }
            TransportEventKind::Failed(reason) => {
                warn!(peer = %peer, %reason, "peer connection failed");
                self.sessions.remove(&peer).await;
            }
            TransportEventKind::Data(payload) => {
                if let Some(entry) = self.chat.receive(&peer, &payload) {
                    debug!(peer = %peer, author = %entry.message.author, "chat message received");
                }
            }
        }
        self.publish_peer_count();
    }

    fn arm_grace_timer(&self, expiry: GraceExpired) {
        let tx = self.grace_tx.clone();
        let grace = self.grace_period;
        tokio::spawn(async move {
            sleep(grace).await;
            let _ = tx.send(expiry);
        });
    }

    /// Tears down only a session still down from the interruption that armed
    /// this timer. Replaced or recovered sessions are left alone.
    async fn handle_grace_expired(&mut self, expired: GraceExpired) {
        let GraceExpired {
            peer,
            generation,
            epoch,
        } = expired;
        let still_down = self
            .sessions
            .current(&peer, generation)
            .is_some_and(|s| s.interrupted_since(epoch));
        if still_down {
            info!(peer = %peer, generation, epoch, "grace period expired");
            self.sessions.remove(&peer).await;
            self.publish_peer_count();
        }
    }

    async fn handle_command(&mut self, cmd: MeshCommand) {
        match cmd {
            MeshCommand::Send { text, reply } => {
                let failed = self.chat.send(&text, &self.sessions).await;
                for peer in &failed {
                    self.sessions.remove(peer).await;
                }
                self.publish_peer_count();
                let _ = reply.send(failed);
            }
            MeshCommand::History(reply) => {
                let _ = reply.send(self.chat.history().to_vec());
            }
        }
    }

    async fn discard(&mut self, peer: &ParticipantId, err: TransportError) {
        warn!(peer = %peer, error = %err, "dropping session");
        self.sessions.remove(peer).await;
    }

    fn publish_peer_count(&self) {
        self.notifier.set_peer_count(self.sessions.connected_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Origin;
    use crate::session::tests::ScriptedTransport;
    use crate::session::SessionState;
    use crate::transport::{PeerTransport, TransportEvents};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    struct Opened {
        transport: Arc<ScriptedTransport>,
        events: TransportEvents,
    }

    #[derive(Default)]
    struct RecordingFactory {
        opened: Mutex<HashMap<ParticipantId, Opened>>,
    }

    impl RecordingFactory {
        fn events(&self, peer: &str) -> TransportEvents {
            self.opened.lock().unwrap()[&ParticipantId::from(peer)]
                .events
                .clone()
        }

        fn transport(&self, peer: &str) -> Arc<ScriptedTransport> {
            self.opened.lock().unwrap()[&ParticipantId::from(peer)]
                .transport
                .clone()
        }
    }

    #[async_trait]
    impl TransportFactory for RecordingFactory {
        async fn open(
            &self,
            _local: &ParticipantId,
            remote: &ParticipantId,
            _role: Role,
            events: TransportEvents,
        ) -> Result<Arc<dyn PeerTransport>, TransportError> {
            let transport = Arc::new(ScriptedTransport::default());
            self.opened.lock().unwrap().insert(
                remote.clone(),
                Opened {
                    transport: transport.clone(),
                    events,
                },
            );
            Ok(transport)
        }
    }

    struct Harness {
        mesh: MeshCoordinator,
        frames: mpsc::UnboundedReceiver<OutboundSignal>,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        factory: Arc<RecordingFactory>,
    }

    impl Harness {
        fn new() -> Self {
            let (signaling, frames) = SignalingClient::detached();
            let factory = Arc::new(RecordingFactory::default());
            let (mesh, transport_rx, _grace) =
                MeshCoordinator::new(signaling, factory.clone(), MeshOptions::new("bob"));
            Self {
                mesh,
                frames,
                transport_rx,
                factory,
            }
        }

        async fn signal(&mut self, msg: SignalingMessage) {
            self.mesh.handle_signal(SignalingEvent::Message(msg)).await;
        }

        async fn init(&mut self, id: &str, others: &[&str]) {
            self.signal(SignalingMessage::Init {
                id: id.into(),
                other_client_ids: others.iter().map(|p| ParticipantId::from(*p)).collect(),
            })
            .await;
        }

        fn drain(&mut self) -> Vec<(&'static str, String)> {
            let mut out = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                out.push((frame.kind(), frame.target().to_string()));
            }
            out
        }

        /// Feed everything the transports emitted back into the coordinator.
        async fn pump_transport(&mut self) {
            while let Ok(ev) = self.transport_rx.try_recv() {
                self.mesh.handle_transport_event(ev).await;
            }
        }

        fn role_of(&self, peer: &str) -> Option<Role> {
            self.mesh.sessions.get(&peer.into()).map(|s| s.role())
        }
    }

    fn offer(from: &str) -> SignalingMessage {
        SignalingMessage::Offer {
            sender: from.into(),
            target: None,
            signal: json!({"type": "offer", "sdp": "v=0"}),
        }
    }

    #[tokio::test]
    async fn join_scenario_elects_by_id_order() {
        let mut h = Harness::new();

        h.init("b3", &["a1", "c7"]).await;
        let mut frames = h.drain();
        frames.sort();
        assert_eq!(
            frames,
            vec![
                ("offer", "a1".to_string()),
                ("offer", "c7".to_string())
            ]
        );
        assert_eq!(h.role_of("a1"), Some(Role::Initiator));
        assert_eq!(h.role_of("c7"), Some(Role::Initiator));

        h.signal(SignalingMessage::NewPeer { id: "d2".into() }).await;
        assert_eq!(h.drain(), vec![("offer", "d2".to_string())]);

        h.signal(SignalingMessage::NewPeer { id: "a0".into() }).await;
        assert!(h.drain().is_empty());
        assert_eq!(h.role_of("a0"), None);

        h.signal(offer("a0")).await;
        assert_eq!(h.drain(), vec![("answer", "a0".to_string())]);
        assert_eq!(h.role_of("a0"), Some(Role::Responder));
    }

    #[tokio::test]
    async fn init_skips_self_and_duplicates() {
        let mut h = Harness::new();
        h.init("b3", &["a1", "b3", "a1"]).await;
        assert_eq!(h.drain(), vec![("offer", "a1".to_string())]);
        assert_eq!(h.mesh.sessions.len(), 1);
    }

    #[tokio::test]
    async fn nothing_happens_before_identity() {
        let mut h = Harness::new();
        h.signal(SignalingMessage::NewPeer { id: "z9".into() }).await;
        h.signal(offer("a1")).await;
        assert!(h.drain().is_empty());
        assert!(h.mesh.sessions.is_empty());
    }

    #[tokio::test]
    async fn glare_lower_id_keeps_its_offer() {
        let mut h = Harness::new();
        h.init("b3", &["c7"]).await;
        h.drain();

        h.signal(offer("c7")).await;
        assert!(h.drain().is_empty());
        assert_eq!(h.role_of("c7"), Some(Role::Initiator));

        // Candidates from the ignored offer never reach our transport.
        h.signal(SignalingMessage::IceCandidate {
            sender: "c7".into(),
            target: None,
            candidate: json!({"candidate": "stale"}),
        })
        .await;
        assert!(h.factory.transport("c7").candidates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn glare_higher_id_yields() {
        let mut h = Harness::new();
        h.init("b3", &["a1"]).await;
        h.drain();
        let first = h.factory.transport("a1");

        h.signal(offer("a1")).await;
        assert_eq!(h.drain(), vec![("answer", "a1".to_string())]);
        assert_eq!(h.role_of("a1"), Some(Role::Responder));
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn answers_and_candidates_for_unknown_peers_are_dropped() {
        let mut h = Harness::new();
        h.init("b3", &[]).await;
        h.signal(SignalingMessage::Answer {
            sender: "q1".into(),
            target: None,
            signal: json!({}),
        })
        .await;
        h.signal(SignalingMessage::IceCandidate {
            sender: "q1".into(),
            target: None,
            candidate: json!({}),
        })
        .await;
        assert!(h.mesh.sessions.is_empty());
    }

    #[tokio::test]
    async fn negotiation_failure_removes_only_that_session() {
        let mut h = Harness::new();
        h.init("b3", &["a1", "c7"]).await;
        h.drain();
        h.factory.transport("a1").fail.store(true, Ordering::SeqCst);

        h.signal(SignalingMessage::Answer {
            sender: "a1".into(),
            target: None,
            signal: json!({"type": "answer"}),
        })
        .await;
        assert!(!h.mesh.sessions.contains(&"a1".into()));
        assert!(h.mesh.sessions.contains(&"c7".into()));
    }

    #[tokio::test]
    async fn transport_events_drive_sessions_and_peer_count() {
        let mut h = Harness::new();
        let mut count = h.mesh.notifier.peer_count();
        h.init("b3", &["a1", "c7"]).await;

        h.factory.events("a1").emit(TransportEventKind::Established);
        h.factory.events("c7").emit(TransportEventKind::Established);
        h.pump_transport().await;
        assert_eq!(*count.borrow_and_update(), 2);

        h.factory.events("c7").emit(TransportEventKind::Failed("ice".into()));
        h.pump_transport().await;
        assert_eq!(*count.borrow_and_update(), 1);
        assert!(!h.mesh.sessions.contains(&"c7".into()));
    }

    #[tokio::test]
    async fn stale_generation_events_are_ignored() {
        let mut h = Harness::new();
        h.init("b3", &["a1"]).await;
        let old = h.factory.events("a1");

        // a1 re-offers; the initiator session is replaced.
        h.signal(offer("a1")).await;
        old.emit(TransportEventKind::Established);
        h.pump_transport().await;
        assert_eq!(
            h.mesh.sessions.get(&"a1".into()).unwrap().state(),
            SessionState::Negotiating
        );
    }

    #[tokio::test]
    async fn local_candidates_are_trickled_to_the_peer() {
        let mut h = Harness::new();
        h.init("b3", &["a1"]).await;
        h.drain();
        h.factory
            .events("a1")
            .emit(TransportEventKind::LocalCandidate(json!({"candidate": "c"})));
        h.pump_transport().await;
        assert_eq!(h.drain(), vec![("ice-candidate", "a1".to_string())]);
    }

    #[tokio::test]
    async fn inbound_data_lands_in_history() {
        let mut h = Harness::new();
        h.init("b3", &["a1"]).await;
        let events = h.factory.events("a1");
        events.emit(TransportEventKind::Established);
        events.emit(TransportEventKind::Data(b"garbage".to_vec()));
        events.emit(TransportEventKind::Data(
            br#"{"author":"alice","text":"hey"}"#.to_vec(),
        ));
        h.pump_transport().await;

        let history = h.mesh.chat.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].origin, Origin::Peer("a1".into()));
    }

    #[tokio::test]
    async fn send_command_tears_down_failed_peers() {
        let mut h = Harness::new();
        h.init("b3", &["a1", "c7"]).await;
        h.factory.events("a1").emit(TransportEventKind::Established);
        h.factory.events("c7").emit(TransportEventKind::Established);
        h.pump_transport().await;
        h.factory.transport("c7").fail.store(true, Ordering::SeqCst);

        let (reply, rx) = oneshot::channel();
        h.mesh
            .handle_command(MeshCommand::Send {
                text: "hello".into(),
                reply,
            })
            .await;
        assert_eq!(rx.await.unwrap(), vec![ParticipantId::from("c7")]);
        assert_eq!(h.mesh.sessions.connected_peers(), vec![ParticipantId::from("a1")]);
        assert_eq!(h.mesh.chat.history().len(), 1);
    }

    #[tokio::test]
    async fn lost_relay_clears_identity_but_keeps_sessions() {
        let mut h = Harness::new();
        let mut local = h.mesh.notifier.local_id();
        h.init("b3", &["a1"]).await;
        assert_eq!(local.borrow_and_update().as_ref().unwrap().as_str(), "b3");

        h.mesh.handle_signal(SignalingEvent::Lost).await;
        assert!(local.borrow_and_update().is_none());
        assert!(h.mesh.sessions.contains(&"a1".into()));

        h.signal(SignalingMessage::NewPeer { id: "z9".into() }).await;
        assert!(!h.mesh.sessions.contains(&"z9".into()));
    }

    async fn running_mesh(
        grace: Duration,
    ) -> (
        MeshHandle,
        mpsc::UnboundedSender<SignalingEvent>,
        Arc<RecordingFactory>,
    ) {
        let (signaling, _frames) = SignalingClient::detached();
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let factory = Arc::new(RecordingFactory::default());
        let mut opts = MeshOptions::new("bob");
        opts.grace_period = grace;
        let (handle, _join) = MeshCoordinator::spawn(signaling, signals, factory.clone(), opts);

        signals_tx
            .send(SignalingEvent::Message(SignalingMessage::Init {
                id: "b3".into(),
                other_client_ids: vec!["a1".into()],
            }))
            .unwrap();
        handle
            .local_id()
            .wait_for(|id| id.is_some())
            .await
            .unwrap();
        factory.events("a1").emit(TransportEventKind::Established);
        handle.peer_count().wait_for(|c| *c == 1).await.unwrap();
        (handle, signals_tx, factory)
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_peer_is_removed_after_grace() {
        let grace = Duration::from_secs(3);
        let (handle, _signals, factory) = running_mesh(grace).await;

        let started = tokio::time::Instant::now();
        factory.events("a1").emit(TransportEventKind::Interrupted);
        handle.peer_count().wait_for(|c| *c == 0).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= grace, "removed after {waited:?}");
        assert!(waited < grace + Duration::from_millis(100), "removed after {waited:?}");
        assert_eq!(factory.transport("a1").closes.load(Ordering::SeqCst), 1);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn second_interruption_gets_a_full_grace_period() {
        let grace = Duration::from_secs(3);
        let (handle, _signals, factory) = running_mesh(grace).await;
        let events = factory.events("a1");

        events.emit(TransportEventKind::Interrupted);
        sleep(Duration::from_millis(2900)).await;
        events.emit(TransportEventKind::Established);
        sleep(Duration::from_millis(50)).await;
        let second = tokio::time::Instant::now();
        events.emit(TransportEventKind::Interrupted);

        // The first timer fires here and must not touch the new interruption.
        sleep(Duration::from_millis(200)).await;
        handle.history().await.unwrap();
        assert_eq!(*handle.peer_count().borrow(), 1);
        assert_eq!(factory.transport("a1").closes.load(Ordering::SeqCst), 0);

        handle.peer_count().wait_for(|c| *c == 0).await.unwrap();
        assert!(second.elapsed() >= grace);
        assert_eq!(factory.transport("a1").closes.load(Ordering::SeqCst), 1);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_session_survives_old_grace_timer() {
        let grace = Duration::from_secs(3);
        let (handle, signals, factory) = running_mesh(grace).await;
        let old = factory.transport("a1");

        factory.events("a1").emit(TransportEventKind::Interrupted);
        signals
            .send(SignalingEvent::Message(offer("a1")))
            .unwrap();
        while Arc::ptr_eq(&factory.transport("a1"), &old) {
            tokio::task::yield_now().await;
        }
        assert_eq!(old.closes.load(Ordering::SeqCst), 1);

        factory.events("a1").emit(TransportEventKind::Established);
        handle.peer_count().wait_for(|c| *c == 1).await.unwrap();

        sleep(grace * 2).await;
        handle.history().await.unwrap();
        assert_eq!(*handle.peer_count().borrow(), 1);
        assert_eq!(factory.transport("a1").closes.load(Ordering::SeqCst), 0);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_peer_survives_grace() {
        let grace = Duration::from_secs(3);
        let (handle, _signals, factory) = running_mesh(grace).await;

        let events = factory.events("a1");
        events.emit(TransportEventKind::Interrupted);
        events.emit(TransportEventKind::Established);
        sleep(grace * 2).await;

        // Round-trip through the loop so every queued event is handled.
        handle.history().await.unwrap();
        assert_eq!(*handle.peer_count().borrow(), 1);
        assert_eq!(factory.transport("a1").closes.load(Ordering::SeqCst), 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn handle_send_and_history_round_trip() {
        let (handle, _signals, factory) = running_mesh(Duration::from_secs(3)).await;
        let mut appended = handle.subscribe();

        assert!(handle.send_text("hi all").await.unwrap().is_empty());
        assert_eq!(appended.recv().await.unwrap().message.text, "hi all");
        assert_eq!(handle.history().await.unwrap().len(), 1);
        assert_eq!(factory.transport("a1").sent.lock().unwrap().len(), 1);

        handle.shutdown();
        // After shutdown the loop drains and the handle reports the stop.
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.history().await.is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
