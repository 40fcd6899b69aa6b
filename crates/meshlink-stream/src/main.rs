//! meshlink - stream captured meshes to a server
//!
//! Runs the streaming pipeline against a configured server using the
//! synthetic capture source, or writes a default configuration file.

use anyhow::Result;
use clap::Parser;
use meshlink_stream::{config, logging, MeshStreamer, SyntheticCapture};
use meshlink_transport::{StreamingTransport, TransportEvent};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshlink")]
#[command(about = "Stream surface meshes and anchor poses to a meshlink server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "meshlink.toml")]
    config: PathBuf,

    /// Server base URL (overrides the configuration file)
    #[arg(short, long)]
    server: Option<String>,

    /// Session id (random when omitted)
    #[arg(long)]
    session: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of synthetic frames to stream
    #[arg(long, default_value_t = 100)]
    frames: u64,

    /// Milliseconds between frames
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Grid size of the synthetic surface
    #[arg(long, default_value_t = 32)]
    grid: u32,

    /// Write a default configuration file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init_config {
        config::save_default_config(&args.config)?;
        println!("Wrote default configuration to {}", args.config.display());
        return Ok(());
    }

    let mut config = config::load_config(&args.config)?;
    if let Some(server) = args.server {
        config.transport.server_url = server;
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    logging::init_logging(&level)?;

    info!("meshlink v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let session = args
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(
        server = %config.transport.server_url,
        session = %session,
        "Configuration loaded"
    );

    let transport = StreamingTransport::new(config.transport.clone());
    let mut events = transport.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::ServerError(message)) => warn!(message = %message, "Server error"),
                Ok(TransportEvent::Message(envelope)) => {
                    info!(message_type = %envelope.message_type, "Server message")
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    transport.connect(session.as_str()).await?;
    let streamer = MeshStreamer::spawn(&config, transport.clone());
    let mut capture = SyntheticCapture::new("synthetic-anchor", args.grid, 0.05);

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    while capture.frame() < args.frames {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
        for event in capture.next_events() {
            streamer.submit(event).await?;
        }
    }

    let stats = streamer.shutdown().await?;

    // Give queued updates a chance to go out before closing
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while transport.queued_len().await > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let transport_stats = transport.stats().await;
    transport.stop().await;

    println!(
        "Streamed {} frames: {} full meshes, {} deltas, {} unchanged, {} poses, {} failed",
        capture.frame(),
        stats.meshes_full,
        stats.meshes_delta,
        stats.meshes_unchanged,
        stats.poses,
        stats.failures
    );
    println!(
        "Transport: {} messages / {} bytes sent, {} dropped",
        transport_stats.messages_sent, transport_stats.bytes_sent, transport_stats.messages_dropped
    );

    Ok(())
}
