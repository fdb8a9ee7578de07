//! WebRTC data-channel transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::TransportError;
use crate::transport::{PeerTransport, TransportEventKind, TransportEvents, TransportFactory};
use crate::types::{ParticipantId, Role};

pub const DATA_CHANNEL_LABEL: &str = "meshchat";

pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>, include_loopback_candidates: bool) -> Self {
        let mut settings = SettingEngine::default();
        settings.set_include_loopback_candidate(include_loopback_candidates);
        let api = APIBuilder::new().with_setting_engine(settings).build();
        Self { api, ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn open(
        &self,
        _local: &ParticipantId,
        remote: &ParticipantId,
        role: Role,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = self
            .api
            .new_peer_connection(self.configuration())
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        let transport = Arc::new(WebRtcTransport {
            peer: remote.clone(),
            pc: Arc::new(pc),
            channel: Arc::new(Mutex::new(None)),
            channel_open: Arc::new(AtomicBool::new(false)),
            pending_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events,
        });
        transport.install_handlers();

        if role == Role::Initiator {
            let dc = transport
                .pc
                .create_data_channel(DATA_CHANNEL_LABEL, None)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?;
            transport.attach_channel(dc);
        }
        Ok(transport)
    }
}

pub struct WebRtcTransport {
    peer: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    channel_open: Arc<AtomicBool>,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    closed: AtomicBool,
    events: TransportEvents,
}

impl WebRtcTransport {
    fn install_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json().map(|init| serde_json::to_value(init)) {
                        Ok(Ok(value)) => {
                            events.emit(TransportEventKind::LocalCandidate(value));
                        }
                        Ok(Err(err)) => warn!(error = %err, "encode local candidate"),
                        Err(err) => warn!(error = %err, "serialize local candidate"),
                    }
                })
            }));

        let events = self.events.clone();
        let channel_open = self.channel_open.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let channel_open = channel_open.clone();
                Box::pin(async move {
                    debug!(peer = %events.peer(), ?state, "peer connection state");
                    match state {
                        // Recovery after a disconnect; the channel survives it.
                        RTCPeerConnectionState::Connected => {
                            if channel_open.load(Ordering::SeqCst) {
                                events.emit(TransportEventKind::Established);
                            }
                        }
                        RTCPeerConnectionState::Disconnected => {
                            events.emit(TransportEventKind::Interrupted);
                        }
                        RTCPeerConnectionState::Failed => {
                            events.emit(TransportEventKind::Failed("ice failed".into()));
                        }
                        _ => {}
                    }
                })
            }));

        let events = self.events.clone();
        let channel = self.channel.clone();
        let channel_open = self.channel_open.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                let channel = channel.clone();
                let channel_open = channel_open.clone();
                Box::pin(async move {
                    // Other implementations pick their own label; adopt the
                    // first channel the remote opens and ignore the rest.
                    if lock(&channel).is_some() {
                        debug!(peer = %events.peer(), label = dc.label(), "ignoring extra data channel");
                        return;
                    }
                    if dc.label() != DATA_CHANNEL_LABEL {
                        debug!(peer = %events.peer(), label = dc.label(), "adopting foreign data channel");
                    }
                    setup_channel(dc, &channel, channel_open, events);
                })
            }));
    }

    fn attach_channel(&self, dc: Arc<RTCDataChannel>) {
        setup_channel(
            dc,
            &self.channel,
            self.channel_open.clone(),
            self.events.clone(),
        );
    }

    async fn set_remote(&self, desc: RTCSessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;

        let pending = std::mem::take(&mut *lock(&self.pending_candidates));
        if !pending.is_empty() {
            debug!(peer = %self.peer, count = pending.len(), "applying buffered candidates");
        }
        for candidate in pending {
            self.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| TransportError::Candidate(e.to_string()))?;
        }
        Ok(())
    }
}

fn setup_channel(
    dc: Arc<RTCDataChannel>,
    slot: &Mutex<Option<Arc<RTCDataChannel>>>,
    open: Arc<AtomicBool>,
    events: TransportEvents,
) {
    let on_open_events = events.clone();
    let on_open_flag = open.clone();
    dc.on_open(Box::new(move || {
        info!(peer = %on_open_events.peer(), "data channel open");
        on_open_flag.store(true, Ordering::SeqCst);
        on_open_events.emit(TransportEventKind::Established);
        Box::pin(async {})
    }));

    let on_close_events = events.clone();
    dc.on_close(Box::new(move || {
        open.store(false, Ordering::SeqCst);
        on_close_events.emit(TransportEventKind::Failed("data channel closed".into()));
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        trace!(peer = %events.peer(), bytes = msg.data.len(), "data channel message");
        events.emit(TransportEventKind::Data(msg.data.to_vec()));
        Box::pin(async {})
    }));

    *lock(slot) = Some(dc);
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn sdp_of(desc: &Value) -> Result<String, TransportError> {
    desc.get("sdp")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TransportError::Negotiation("missing sdp".into()))
}

fn describe(desc: &RTCSessionDescription) -> Value {
    json!({
        "type": desc.sdp_type.to_string(),
        "sdp": desc.sdp,
    })
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<Value, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        Ok(describe(&offer))
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value, TransportError> {
        let desc = RTCSessionDescription::offer(sdp_of(&offer)?)
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        self.set_remote(desc).await?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        Ok(describe(&answer))
    }

    async fn accept_answer(&self, answer: Value) -> Result<(), TransportError> {
        let desc = RTCSessionDescription::answer(sdp_of(&answer)?)
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        self.set_remote(desc).await
    }

    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|e| TransportError::Candidate(e.to_string()))?;
        if init.candidate.is_empty() {
            // end-of-candidates
            return Ok(());
        }
        if self.pc.remote_description().await.is_none() {
            lock(&self.pending_candidates).push(init);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn send_text(&self, payload: String) -> Result<(), TransportError> {
        let dc = lock(&self.channel).clone();
        let Some(dc) = dc else {
            return Err(TransportError::Closed);
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::Closed);
        }
        dc.send_text(payload)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            debug!(peer = %self.peer, error = %err, "peer connection close");
        }
    }
}
