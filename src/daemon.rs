use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::mesh::{MeshCoordinator, MeshHandle, MeshOptions};
use crate::rtc::WebRtcFactory;
use crate::signaling::{SignalingClient, SignalingOptions};
use crate::transport::TransportFactory;

/// Connect to the relay and start a coordinator on the current runtime.
/// The handle is live as soon as this returns; the identity arrives later.
/// An unreachable relay is retried in the background, so only a malformed
/// relay url fails here.
pub async fn start_node(
    cfg: &Config,
    factory: Arc<dyn TransportFactory>,
) -> Result<(MeshHandle, JoinHandle<()>)> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        username = %cfg.username,
        relay = %cfg.relay_url,
        "node start"
    );
    let (signaling, signals) = SignalingClient::connect(
        &cfg.relay_url,
        SignalingOptions {
            reconnect_delay: cfg.reconnect_delay(),
        },
    )
    .await
    .with_context(|| format!("connect to relay {}", cfg.relay_url))?;

    let mut opts = MeshOptions::new(cfg.username.clone());
    opts.grace_period = cfg.grace_period();
    Ok(MeshCoordinator::spawn(signaling, signals, factory, opts))
}

/// The production transport, configured from `cfg`.
pub fn webrtc_factory(cfg: &Config) -> Arc<dyn TransportFactory> {
    Arc::new(WebRtcFactory::new(
        cfg.ice_servers.clone(),
        cfg.include_loopback_candidates,
    ))
}
