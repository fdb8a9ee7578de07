use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use meshchat::chat::LogEntry;
use meshchat::config::{Config, ConfigOverrides};
use meshchat::daemon::{start_node, webrtc_factory};
use meshchat::logging;
use meshchat::relay::RelayServer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshchat", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Join the mesh and chat over stdin/stdout
    Chat {
        #[arg(long)]
        username: Option<String>,
        /// Relay websocket url (ws:// or wss://)
        #[arg(long)]
        relay: Option<String>,
        /// Log file path
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Run the rendezvous relay
    Relay {
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
        /// Log file path
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat {
            username,
            relay,
            log,
        } => {
            let cfg = Config::load_with_overrides(
                cli.config.as_deref(),
                ConfigOverrides {
                    username,
                    relay_url: relay,
                },
            )?;
            let log_path = log.unwrap_or_else(|| logging::default_log_path(cfg.config_path.as_deref()));
            logging::init_log_file(&log_path)?;
            run_chat(cfg).await
        }
        Commands::Relay { addr, log } => {
            let log_path = log.unwrap_or_else(|| logging::default_log_path(cli.config.as_deref()));
            logging::init_log_file(&log_path)?;
            run_relay(&addr).await
        }
    }
}

async fn run_chat(cfg: Config) -> Result<()> {
    let (handle, join) = start_node(&cfg, webrtc_factory(&cfg)).await?;

    let mut appended = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match appended.recv().await {
                Ok(entry) => println!("{}", render(&entry)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "display fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut peers = handle.peer_count();
    tokio::spawn(async move {
        while peers.changed().await.is_ok() {
            let count = *peers.borrow_and_update();
            println!("-- {count} peer(s) connected");
        }
    });

    let mut local_id = handle.local_id();
    tokio::spawn(async move {
        while local_id.changed().await.is_ok() {
            match local_id.borrow_and_update().as_ref() {
                Some(id) => println!("-- joined as {}", id.short()),
                None => println!("-- relay lost, reconnecting"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(err) = handle.send_text(line).await {
                        warn!(error = %err, "send failed");
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "stdin read failed");
                    break;
                }
            },
        }
    }

    handle.shutdown();
    let _ = join.await;
    info!("chat exited");
    Ok(())
}

fn render(entry: &LogEntry) -> String {
    let at = entry
        .received_at
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S");
    format!("{at} <{}> {}", entry.message.author, entry.message.text)
}

async fn run_relay(addr: &str) -> Result<()> {
    let shutdown = Arc::new(Notify::new());
    let relay = RelayServer::start(addr, Some(shutdown.clone())).await?;
    println!("relay listening on {}", relay.url());
    tokio::signal::ctrl_c().await?;
    shutdown.notify_one();
    relay.wait().await;
    Ok(())
}
