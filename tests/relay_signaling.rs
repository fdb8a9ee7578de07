use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meshchat::relay::RelayServer;
use meshchat::signaling::{SignalingClient, SignalingEvent, SignalingOptions};
use meshchat::wsproto::{OutboundSignal, SignalingMessage};
use meshchat::ParticipantId;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;

async fn next_event(rx: &mut UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("signaling event in time")
        .expect("signaling client alive")
}

async fn next_message(rx: &mut UnboundedReceiver<SignalingEvent>) -> SignalingMessage {
    loop {
        if let SignalingEvent::Message(msg) = next_event(rx).await {
            return msg;
        }
    }
}

async fn join(url: &str) -> (SignalingClient, UnboundedReceiver<SignalingEvent>, ParticipantId, Vec<ParticipantId>) {
    let (client, mut events) = SignalingClient::connect(url, SignalingOptions::default())
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
    match next_message(&mut events).await {
        SignalingMessage::Init {
            id,
            other_client_ids,
        } => (client, events, id, other_client_ids),
        other => panic!("expected init, got {other:?}"),
    }
}

#[tokio::test]
async fn clients_discover_each_other_and_exchange_offers() {
    let relay = RelayServer::start("127.0.0.1:0", None).await.unwrap();
    let url = relay.url();

    let (_a, mut a_events, a_id, a_others) = join(&url).await;
    assert!(a_others.is_empty());

    let (b, _b_events, b_id, b_others) = join(&url).await;
    assert_eq!(b_others, vec![a_id.clone()]);
    assert_eq!(
        next_message(&mut a_events).await,
        SignalingMessage::NewPeer { id: b_id.clone() }
    );

    b.send(OutboundSignal::Offer {
        sender: b_id.clone(),
        target: a_id.clone(),
        signal: json!({"type": "offer", "sdp": "v=0"}),
    });
    match next_message(&mut a_events).await {
        SignalingMessage::Offer { sender, signal, .. } => {
            assert_eq!(sender, b_id);
            assert_eq!(signal["sdp"], "v=0");
        }
        other => panic!("expected offer, got {other:?}"),
    }

    b.send(OutboundSignal::IceCandidate {
        sender: b_id.clone(),
        target: a_id.clone(),
        candidate: json!({"candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host"}),
    });
    assert_eq!(next_message(&mut a_events).await.kind(), "ice-candidate");
    assert_eq!(b.stats().frames_sent, 2);

    relay.abort();
}

#[tokio::test]
async fn client_joins_once_a_late_relay_comes_up() {
    let vacant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = vacant.local_addr().unwrap();
    drop(vacant);

    let (client, mut events) = SignalingClient::connect(
        &format!("ws://{addr}"),
        SignalingOptions {
            reconnect_delay: Duration::from_millis(50),
        },
    )
    .await
    .unwrap();
    assert!(!client.stats().last_error.is_empty());

    let relay = RelayServer::start(&addr.to_string(), None).await.unwrap();
    assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
    assert_eq!(next_message(&mut events).await.kind(), "init");
    // The first successful connection is not a reconnect.
    assert_eq!(client.stats().reconnects, 0);

    relay.abort();
}

/// A scripted relay: each connection gets an init, then garbage, then a
/// valid frame, then the socket is dropped.
#[tokio::test]
async fn client_drops_garbage_and_reconnects_after_loss() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for n in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Before init: must be ignored.
            ws.send(Message::Text(json!({"type": "new-peer", "id": "early"}).to_string()))
                .await
                .unwrap();
            ws.send(Message::Text(
                json!({"type": "init", "id": format!("me{n}"), "otherClientIds": []}).to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text("{not json".into())).await.unwrap();
            ws.send(Message::Text(json!({"type": "bogus"}).to_string()))
                .await
                .unwrap();
            ws.send(Message::Binary(
                json!({"type": "new-peer", "id": format!("peer{n}")})
                    .to_string()
                    .into_bytes(),
            ))
            .await
            .unwrap();
            let _ = ws.close(None).await;
        }
    });

    let (client, mut events) = SignalingClient::connect(
        &format!("ws://{addr}"),
        SignalingOptions {
            reconnect_delay: Duration::from_millis(50),
        },
    )
    .await
    .unwrap();

    for n in 0..2 {
        assert_eq!(next_event(&mut events).await, SignalingEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::Message(SignalingMessage::Init {
                id: format!("me{n}").as_str().into(),
                other_client_ids: vec![],
            })
        );
        assert_eq!(
            next_event(&mut events).await,
            SignalingEvent::Message(SignalingMessage::NewPeer {
                id: format!("peer{n}").as_str().into(),
            })
        );
        assert_eq!(next_event(&mut events).await, SignalingEvent::Lost);
    }

    let stats = client.stats();
    assert_eq!(stats.reconnects, 1);
    // early + garbage + bogus, twice
    assert_eq!(stats.frames_dropped, 6);
}
