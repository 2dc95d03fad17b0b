//! CoE Node - CAN-over-Ethernet bridge daemon
//!
//! This binary runs a CoE bridge with:
//! - a UDP listener for pages sent by CMI devices
//! - periodic resend of written channels to the configured CMIs
//! - availability checks of the configured CMIs
//!
//! Channel updates are rendered as topic/payload pairs and logged.

mod publisher;

use clap::Parser;
use coe_bridge::{BridgeConfig, CoeBridge, CoeVersion, PeerConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use publisher::LogPublisher;

#[derive(Parser)]
#[command(name = "coe-node")]
#[command(about = "CAN-over-Ethernet bridge for CMI devices")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen address (overrides the configuration file)
    #[arg(long, short)]
    listen: Option<SocketAddr>,

    /// Additional CMI peer (protocol version 1, port 5441); repeatable
    #[arg(long = "peer")]
    peers: Vec<IpAddr>,

    /// Protocol version assumed for senders that are not configured peers
    #[arg(long, value_parser = parse_version)]
    default_version: Option<CoeVersion>,

    /// Interval between statistics log lines (e.g. "1m", "30s")
    #[arg(long, value_parser = humantime_duration, default_value = "5m")]
    stats_interval: Duration,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

fn parse_version(s: &str) -> Result<CoeVersion, String> {
    match s.to_ascii_lowercase().as_str() {
        "v1" | "1" => Ok(CoeVersion::V1),
        "v2" | "2" => Ok(CoeVersion::V2),
        other => Err(format!("unknown CoE version '{}' (expected v1 or v2)", other)),
    }
}

fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

impl Args {
    fn bridge_config(&self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::from_json_file(path)?,
            None => BridgeConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(version) = self.default_version {
            config.default_version = version;
        }
        for address in &self.peers {
            if config.peer(*address).is_none() {
                config.peers.push(PeerConfig::new(*address));
            }
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose when set
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder().with_max_level(level);
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    let config = args.bridge_config()?;
    info!("Starting CoE node {}", coe_bridge::VERSION);
    for peer in &config.peers {
        info!(
            "CMI peer {} at {} (protocol {})",
            peer.name,
            peer.socket_addr(),
            peer.version
        );
    }

    let bridge = CoeBridge::new(config, Arc::new(LogPublisher)).await?;
    bridge.start().await?;

    info!("═══════════════════════════════════════════════════════════");
    info!("  CoE bridge listening on {}", bridge.local_addr()?);
    info!("═══════════════════════════════════════════════════════════");

    let mut stats_ticker =
        tokio::time::interval(args.stats_interval.max(Duration::from_secs(1)));
    stats_ticker.tick().await;
    loop {
        tokio::select! {
            _ = stats_ticker.tick() => {
                let stats = bridge.stats();
                info!(
                    "Bridge stats: received={}, decode_errors={}, published={}, dropped={}, sent={}, send_failures={}",
                    stats.datagrams_received,
                    stats.decode_errors,
                    stats.events_published,
                    stats.events_dropped,
                    stats.datagrams_sent,
                    stats.send_failures
                );
            }

            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown requested");
                break;
            }
        }
    }

    bridge.shutdown().await;
    Ok(())
}
