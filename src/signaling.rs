//! WebSocket client for the rendezvous relay.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ConnectionError, ParseError};
use crate::telemetry::{SignalingStats, SignalingStatsSnapshot};
use crate::wsproto::{self, OutboundSignal, SignalingMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// A (re)connection to the relay succeeded; no identity yet.
    Connected,
    Message(SignalingMessage),
    /// The relay connection dropped; a reconnect is pending.
    Lost,
}

#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub reconnect_delay: Duration,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(crate::config::DEFAULT_RECONNECT_DELAY_MS),
        }
    }
}

/// Handle for sending negotiation frames to the relay. Cheap to clone.
#[derive(Clone)]
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<OutboundSignal>,
    stats: Arc<SignalingStats>,
}

impl SignalingClient {
    /// Open the relay connection. Inbound messages arrive on the returned
    /// receiver in the order the relay sent them.
    ///
    /// Only a malformed url is an error. An unreachable relay is logged and
    /// retried every `reconnect_delay`; the client is usable meanwhile and
    /// frames sent before the first connection are discarded.
    pub async fn connect(
        url: &str,
        opts: SignalingOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), ConnectionError> {
        let parsed = parse_relay_url(url)?;
        let stats = Arc::new(SignalingStats::default());
        let first = match connect_async(parsed.as_str()).await {
            Ok((stream, _)) => {
                info!(url = %parsed, "connected to signaling relay");
                Some(stream)
            }
            Err(err) => {
                let err = ConnectionError::Unreachable {
                    url: url.to_string(),
                    reason: err.to_string(),
                };
                warn!(error = %err, "relay unreachable, will retry");
                stats.set_last_error(&err);
                None
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(
            parsed.to_string(),
            first,
            outbound_rx,
            events_tx,
            stats.clone(),
            opts.reconnect_delay,
        ));

        Ok((Self { outbound, stats }, events_rx))
    }

    /// A client with no relay behind it; sent frames surface on the receiver.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<OutboundSignal>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let client = Self {
            outbound,
            stats: Arc::new(SignalingStats::default()),
        };
        (client, rx)
    }

    /// Best-effort send; failures are logged and counted, never returned.
    pub fn send(&self, msg: OutboundSignal) {
        let kind = msg.kind();
        let target = msg.target().clone();
        match self.outbound.send(msg) {
            Ok(()) => {
                self.stats.on_send();
                debug!(kind, target = %target, "queued signaling frame");
            }
            Err(_) => {
                self.stats.on_drop();
                warn!(kind, target = %target, "signaling connection closed, frame dropped");
            }
        }
    }

    pub fn stats(&self) -> SignalingStatsSnapshot {
        self.stats.snapshot()
    }
}

fn parse_relay_url(url: &str) -> Result<Url, ConnectionError> {
    let parsed = Url::parse(url).map_err(|e| ConnectionError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(ConnectionError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    Ok(parsed)
}

enum PumpExit {
    /// The relay went away
    Lost,
    /// Our side dropped the client or the event receiver
    Shutdown,
}

async fn run_connection(
    url: String,
    first: Option<WsStream>,
    mut outbound: mpsc::UnboundedReceiver<OutboundSignal>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    stats: Arc<SignalingStats>,
    reconnect_delay: Duration,
) {
    let mut connected_once = first.is_some();
    let mut next = first;
    loop {
        let stream = match next.take() {
            Some(stream) => stream,
            None => {
                sleep(reconnect_delay).await;
                if events.is_closed() {
                    return;
                }
                match connect_async(url.as_str()).await {
                    Ok((stream, _)) => {
                        if connected_once {
                            stats.on_reconnect();
                            info!(url = %url, "reconnected to signaling relay");
                        } else {
                            info!(url = %url, "connected to signaling relay");
                        }
                        connected_once = true;
                        stream
                    }
                    Err(err) => {
                        debug!(url = %url, error = %err, "relay reconnect failed");
                        stats.set_last_error(&err);
                        continue;
                    }
                }
            }
        };

        // Frames queued while disconnected target a previous identity.
        let mut stale = 0usize;
        loop {
            match outbound.try_recv() {
                Ok(_) => stale += 1,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }
        if stale > 0 {
            debug!(stale, "discarded frames queued while disconnected");
        }

        if events.send(SignalingEvent::Connected).is_err() {
            return;
        }
        match pump(stream, &mut outbound, &events, &stats).await {
            PumpExit::Lost => {
                warn!(url = %url, "signaling connection lost");
                if events.send(SignalingEvent::Lost).is_err() {
                    return;
                }
            }
            PumpExit::Shutdown => return,
        }
    }
}

async fn pump(
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<OutboundSignal>,
    events: &mpsc::UnboundedSender<SignalingEvent>,
    stats: &SignalingStats,
) -> PumpExit {
    let (mut write, mut read) = stream.split();
    let mut identified = false;

    loop {
        tokio::select! {
            out = outbound.recv() => {
                let Some(msg) = out else {
                    let _ = write.close().await;
                    return PumpExit::Shutdown;
                };
                let text = match wsproto::encode(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode signaling frame");
                        stats.on_drop();
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Text(text)).await {
                    warn!(error = %err, "ws send error");
                    stats.on_drop();
                    stats.set_last_error(&err);
                    return PumpExit::Lost;
                }
            }
            frame = read.next() => {
                let decoded = match frame {
                    Some(Ok(Message::Text(txt))) => wsproto::decode_text(&txt),
                    Some(Ok(Message::Binary(bin))) => wsproto::decode_binary(&bin),
                    Some(Ok(Message::Close(_))) | None => return PumpExit::Lost,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(error = %err, "ws read error");
                        stats.set_last_error(&err);
                        return PumpExit::Lost;
                    }
                };
                stats.on_recv();
                if let Some(msg) = admit(decoded, &mut identified, stats) {
                    if events.send(SignalingEvent::Message(msg)).is_err() {
                        return PumpExit::Shutdown;
                    }
                }
            }
        }
    }
}

/// Drops malformed frames and anything that arrives before Init.
fn admit(
    decoded: Result<SignalingMessage, ParseError>,
    identified: &mut bool,
    stats: &SignalingStats,
) -> Option<SignalingMessage> {
    let msg = match decoded {
        Ok(msg) => msg,
        Err(err) => {
            warn!(error = %err, "dropping malformed signaling frame");
            stats.on_drop();
            stats.set_last_error(&err);
            return None;
        }
    };
    match msg {
        SignalingMessage::Init { .. } => {
            *identified = true;
            Some(msg)
        }
        _ if *identified => Some(msg),
        _ => {
            debug!(kind = msg.kind(), "ignoring signaling message before init");
            stats.on_drop();
            None
        }
    }
}
