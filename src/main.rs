//! ClipLink service entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cliplink::auth::{PairingAuthority, SessionStore};
use cliplink::clipboard::MemoryClipboard;
use cliplink::codec::MessageCodec;
use cliplink::crypto::CryptoEngine;
use cliplink::hub::ClipboardHub;
use cliplink::sync::{ContentFilter, SyncCoordinator};
use cliplink::transport::{WebSocketServer, WebSocketTransport};
use cliplink::Config;

#[derive(Parser)]
#[command(name = "cliplink", version, about = "Secure clipboard sync service")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync service
    Start {
        /// Display a pairing PIN at startup
        #[arg(long)]
        pair: bool,
    },

    /// Write a default configuration file
    GenerateConfig,

    /// Print the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).context("failed to load config")?,
        None => Config::load_default().context("failed to load default config")?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    match cli.command {
        Commands::Start { pair } => start(config, pair).await,
        Commands::GenerateConfig => generate_config(),
        Commands::Status => status(&config),
    }
}

async fn start(config: Config, pair: bool) -> Result<()> {
    info!(version = cliplink::VERSION, device_id = %config.device_id, "Starting ClipLink");

    let sessions = Arc::new(SessionStore::new(Duration::from_secs(
        config.pairing.session_ttl_secs,
    )));
    let pairing = Arc::new(PairingAuthority::new(
        Arc::clone(&sessions),
        Duration::from_secs(config.pairing.pin_ttl_secs),
    ));
    let _session_sweeper =
        sessions.spawn_sweeper(Duration::from_secs(config.pairing.session_sweep_secs));

    if pair {
        let pin = pairing.generate_pin().await;
        // The PIN surface is exactly four ASCII digits
        println!("Pairing PIN: {}", pin.code);
        println!("Valid until: {}", pin.expires_at);
    }

    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(256);
    let server = WebSocketServer::bind(&config.listen_addr, frame_tx, true)
        .await
        .context("failed to bind socket transport")?;
    let transport = Arc::new(WebSocketTransport::new(&server));

    // Platform clipboard integrations plug in at this seam; the in-memory
    // provider keeps headless runs functional
    let clipboard = Arc::new(MemoryClipboard::new());
    let (change_tx, change_rx) = cliplink::clipboard::change_channel(64);
    let _local_changes = change_tx;

    let hub = Arc::new(ClipboardHub::new(config.hub.capacity));
    // A successful pairing rekeys the codec with the session token's key;
    // until then inbound sealed frames fail decryption and are dropped
    let bootstrap_key = CryptoEngine::derive_key(&config.device_id);
    let codec = MessageCodec::new(
        bootstrap_key,
        Duration::from_secs(config.sync.reassembly_staleness_secs),
    );

    let coordinator = Arc::new(SyncCoordinator::new(
        config.device_id.clone(),
        config.sync.clone(),
        ContentFilter::new(&config.filter),
        codec,
        transport,
        clipboard,
        hub,
        pairing,
        sessions,
    ));

    let server_task = tokio::spawn(server.run());
    let run_task = tokio::spawn(Arc::clone(&coordinator).run(change_rx, frame_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    coordinator.stop().await?;
    run_task.abort();
    let _ = server_task.await;
    Ok(())
}

fn generate_config() -> Result<()> {
    let config = Config::default();
    let path = Config::default_path().context("no config directory available")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, toml::to_string_pretty(&config)?)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    println!("cliplink {}", cliplink::VERSION);
    println!("device_id:    {}", config.device_id);
    println!("device_name:  {}", config.device_name);
    println!("listen_addr:  {}", config.listen_addr);
    println!("hub capacity: {}", config.hub.capacity);
    Ok(())
}
