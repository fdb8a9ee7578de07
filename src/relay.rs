//! Rendezvous relay: hands out participant ids, announces joins and forwards
//! negotiation frames between connected clients. It never interprets the
//! negotiation payloads themselves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const FORWARDED_TYPES: [&str; 3] = ["offer", "answer", "ice-candidate"];

#[derive(Clone, Default)]
struct RelayState {
    clients: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>,
}

impl RelayState {
    fn clients(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<String>>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct RelayServer {
    bound_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RelayServer {
    /// Bind `addr` (numeric ip:port, port 0 allowed) and serve until
    /// `shutdown` is notified.
    pub async fn start(addr: &str, shutdown: Option<Arc<Notify>>) -> Result<Self> {
        let requested: SocketAddr = addr.parse().with_context(|| {
            format!("invalid relay address '{addr}' (use numeric IP, not hostname)")
        })?;
        let listener = tokio::net::TcpListener::bind(requested)
            .await
            .with_context(|| format!("bind relay on {requested}"))?;
        let bound_addr = listener.local_addr()?;

        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(RelayState::default());

        let task = tokio::spawn(async move {
            let result = match shutdown {
                Some(shutdown) => {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move { shutdown.notified().await })
                        .await
                }
                None => axum::serve(listener, app).await,
            };
            if let Err(err) = result {
                error!(error = %err, "relay server error");
            }
            info!("relay server stopped");
        });

        info!(addr = %bound_addr, "relay listening");
        Ok(Self { bound_addr, task })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.bound_addr)
    }

    pub async fn wait(self) {
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = Uuid::new_v4().to_string();

    {
        let mut clients = state.clients();
        let others: Vec<String> = clients.keys().cloned().collect();
        // Queued before anything else can reach this client.
        let _ = tx.send(json!({"type": "init", "id": id, "otherClientIds": others}).to_string());
        let announce = json!({"type": "new-peer", "id": id}).to_string();
        for peer in clients.values() {
            let _ = peer.send(announce.clone());
        }
        clients.insert(id.clone(), tx);
        info!(client = %id, peers = others.len(), "client joined");
    }

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(client = %id, error = %err, "websocket error");
                break;
            }
        };
        forward(&state, &id, &text);
    }

    state.clients().remove(&id);
    send_task.abort();
    info!(client = %id, "client left");
}

/// Rewrite `sender` to the authenticated connection id and hand the frame
/// to its target. Anything else is dropped.
fn forward(state: &RelayState, from: &str, text: &str) {
    let mut frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(client = %from, error = %err, "dropping malformed frame");
            return;
        }
    };
    let kind = frame.get("type").and_then(Value::as_str).unwrap_or_default();
    if !FORWARDED_TYPES.contains(&kind) {
        debug!(client = %from, kind, "dropping unforwardable frame");
        return;
    }
    let Some(target) = frame.get("target").and_then(Value::as_str).map(str::to_string) else {
        debug!(client = %from, kind, "dropping frame without target");
        return;
    };
    let Some(obj) = frame.as_object_mut() else {
        return;
    };
    obj.insert("sender".into(), Value::String(from.to_string()));

    match state.clients().get(&target) {
        Some(peer) => {
            let _ = peer.send(frame.to_string());
        }
        None => debug!(client = %from, target = %target, "target not connected"),
    }
}
