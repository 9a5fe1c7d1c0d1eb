//! meshscope Command-Line Interface
//!
//! This CLI provides tools for:
//! - Collecting Meshtastic traffic from an MQTT broker into a topology database
//! - Decoding single captured envelopes offline
//! - Querying nodes, links and packets from the database

mod config;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use meshscope_core::mesh::proto::PortNum;
use meshscope_core::mesh::{decode_envelope, CryptoContext, DecryptOutcome, Payload};
use meshscope_core::{BroadcastPublisher, Ingestor, MqttListener, NodeId, Store};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshscope")]
#[command(author, version, about = "Meshtastic MQTT topology collector", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: ~/.config/meshscope/config.toml, /etc/meshscope/config.toml)
    #[arg(short, long, global = true, env = "MESHSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overrides the configured path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to the broker and ingest until Ctrl+C
    Listen {
        /// Broker host
        #[arg(long)]
        broker: Option<String>,

        /// Broker port
        #[arg(long)]
        port: Option<u16>,

        /// Root topic, e.g. msh/EU_868/2/e/LongFast/
        #[arg(long)]
        root_topic: Option<String>,

        /// Print each published packet as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Decode one service envelope without touching the database
    Decode {
        /// Envelope as hex
        #[arg(long, conflicts_with_all = ["base64", "file"])]
        hex: Option<String>,

        /// Envelope as base64
        #[arg(long, conflicts_with = "file")]
        base64: Option<String>,

        /// File holding the raw envelope bytes
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// List nodes seen recently
    Nodes {
        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        since_hours: i64,

        /// Only nodes heard by this gateway (e.g. !a1b2c3d4)
        #[arg(long)]
        gateway: Option<String>,
    },

    /// List inferred direct links
    Links {
        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        since_hours: i64,

        /// Only links into or out of this node
        #[arg(long)]
        node: Option<String>,
    },

    /// Show one packet and every gateway that heard it
    Packet {
        /// Packet id (hex with 0x prefix, or decimal)
        #[arg(long)]
        id: String,

        /// Sender node id
        #[arg(long)]
        from: String,

        /// Destination node id
        #[arg(long, default_value = "!ffffffff")]
        to: String,
    },
}

fn parse_node(value: &str) -> Result<NodeId> {
    value
        .parse::<NodeId>()
        .with_context(|| format!("Invalid node id: {}", value))
}

fn parse_packet_id(value: &str) -> Result<u32> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.with_context(|| format!("Invalid packet id: {}", value))
}

fn since(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}

async fn open_store(db: &Path) -> Result<Store> {
    Store::open(db)
        .await
        .with_context(|| format!("Failed to open database {}", db.display()))
}

async fn cmd_listen(
    mut config: config::Config,
    broker: Option<String>,
    port: Option<u16>,
    root_topic: Option<String>,
    json: bool,
) -> Result<()> {
    if let Some(broker) = broker {
        config.mqtt_broker = broker;
    }
    if let Some(port) = port {
        config.mqtt_port = port;
    }
    if let Some(root_topic) = root_topic {
        config.root_topic = root_topic;
    }

    let store = open_store(&config.db_path).await?;
    let publisher = BroadcastPublisher::new(256);

    let printer = if json {
        let mut rx = publisher.subscribe();
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(packet) => match serde_json::to_string(&*packet) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Failed to serialize packet: {}", e),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "JSON output fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    } else {
        None
    };

    // Setup Ctrl+C handler
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        c.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let listener = MqttListener::new(config.listener_config());
    let mut ingestor = Ingestor::new(store, publisher);

    eprintln!(
        "Listening on {}:{} topic {} (Press Ctrl+C to stop)",
        config.mqtt_broker,
        config.mqtt_port,
        listener.config().subscription()
    );

    let result = listener.run(&mut ingestor, cancel).await;

    let stats = ingestor.stats();
    let store = ingestor.store().clone();
    drop(ingestor);
    if let Some(printer) = printer {
        join_printer(printer).await;
    }
    store.close().await;

    eprintln!(
        "Processed {} messages ({} duplicates, {} dropped, {} failed)",
        stats.processed, stats.duplicates, stats.dropped, stats.failed
    );
    result.context("Ingestion stopped on a storage failure")
}

/// Wait for the JSON printer to drain; returns false if it panicked or was aborted
async fn join_printer(printer: JoinHandle<()>) -> bool {
    match printer.await {
        Ok(()) => true,
        Err(e) => {
            warn!("JSON output task failed: {}", e);
            false
        }
    }
}

fn read_envelope(
    hex_text: Option<String>,
    b64_text: Option<String>,
    file: Option<PathBuf>,
) -> Result<Vec<u8>> {
    match (hex_text, b64_text, file) {
        (Some(h), _, _) => {
            let cleaned: String = h.chars().filter(|c| !c.is_whitespace()).collect();
            hex::decode(cleaned).context("Invalid hex input")
        }
        (_, Some(b), _) => BASE64.decode(b.trim()).context("Invalid base64 input"),
        (_, _, Some(path)) => std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => bail!("Provide one of --hex, --base64 or --file"),
    }
}

fn cmd_decode(hex: Option<String>, b64: Option<String>, file: Option<PathBuf>) -> Result<()> {
    let bytes = read_envelope(hex, b64, file)?;
    let mut envelope = decode_envelope(&bytes).context("Failed to decode service envelope")?;
    let outcome = envelope.decrypt(&CryptoContext::with_default_psk());
    let packet = &envelope.packet;

    println!("=== Service Envelope ===");
    println!();
    println!("Gateway:        !{}", envelope.gateway);
    println!("Channel:        {}", envelope.channel_id);
    println!("Packet ID:      {:08x}", packet.id);
    println!("From:           !{}", packet.from);
    println!("To:             !{}", packet.to);
    println!("Hop start:      {}", packet.hop_start);
    println!("Hop limit:      {}", packet.hop_limit);
    println!("RSSI:           {} dBm", packet.rx_rssi);
    println!("SNR:            {:.2} dB", packet.rx_snr);
    println!("Want ACK:       {}", if packet.want_ack { "Yes" } else { "No" });
    println!("Via MQTT:       {}", if packet.via_mqtt { "Yes" } else { "No" });
    if let Some(relay) = packet.relay_node {
        println!("Relay node:     ..{:02x}", relay);
    }
    println!(
        "Encryption:     {}",
        match &outcome {
            DecryptOutcome::AlreadyDecoded => "none".to_string(),
            DecryptOutcome::Decrypted => "default key".to_string(),
            DecryptOutcome::Failed(reason) => format!("unknown key ({})", reason),
            DecryptOutcome::NoPayload => "no payload".to_string(),
        }
    );

    let Some(data) = packet.body.data() else {
        println!("Port:           UNKNOWN");
        return Ok(());
    };
    println!("Port:           {}", PortNum::name_of(data.portnum));
    println!();

    let payload = Payload::from_data(data);
    println!("Payload:");
    println!("{}", serde_json::to_string_pretty(&payload.to_json())?);

    let neighbors = payload.neighbor_links(packet.from);
    if !neighbors.is_empty() {
        println!();
        println!("Neighbor links:");
        for link in neighbors {
            println!("  {} -> {}  SNR {:.2} dB", link.from, link.to, link.snr);
        }
    }

    if let Some(report) = payload.route_report(packet.from, packet.to) {
        println!();
        print!("{}", report.format());
        println!();
        println!("Traceroute links:");
        for link in report.links() {
            let snr = link
                .snr
                .map(|s| format!("{:.2} dB", s))
                .unwrap_or_else(|| "unknown".into());
            println!("  {} -> {}  SNR {}  ({})", link.from, link.to, snr, link.direction);
        }
    }

    Ok(())
}

async fn cmd_nodes(db: &Path, since_hours: i64, gateway: Option<String>) -> Result<()> {
    let gateway = gateway.as_deref().map(parse_node).transpose()?;
    let store = open_store(db).await?;
    let nodes = store.nodes_since(since(since_hours), gateway).await?;

    println!(
        "{:<10} {:<25} {:>4} {:>7} {:<6} {}",
        "Node", "Last seen", "Hops", "Msgs", "Legacy", "Name"
    );
    for node in &nodes {
        let name = node
            .info
            .as_ref()
            .and_then(|info| info.get("long_name"))
            .and_then(|n| n.as_str())
            .unwrap_or("");
        println!(
            "{:<10} {:<25} {:>4} {:>7} {:<6} {}",
            format!("!{}", node.id),
            node.last_seen.format("%Y-%m-%d %H:%M:%S UTC"),
            node.hop_limit.map(|h| h.to_string()).unwrap_or_else(|| "-".into()),
            node.message_count,
            if node.legacy { "yes" } else { "no" },
            name
        );
    }
    println!();
    println!("{} nodes in the last {} hours", nodes.len(), since_hours);

    store.close().await;
    Ok(())
}

async fn cmd_links(db: &Path, since_hours: i64, node: Option<String>) -> Result<()> {
    let node = node.as_deref().map(parse_node).transpose()?;
    let store = open_store(db).await?;
    let links = match node {
        Some(node) => store.links_for_node(node, since(since_hours)).await?,
        None => store.direct_links_since(since(since_hours)).await?,
    };

    println!(
        "{:<10} {:<10} {:>8} {:>6} {:<12} {:>5} {}",
        "From", "To", "SNR", "RSSI", "Source", "Count", "Last seen"
    );
    for link in &links {
        println!(
            "{:<10} {:<10} {:>8} {:>6} {:<12} {:>5} {}",
            format!("!{}", link.from_node_id),
            format!("!{}", link.to_node_id),
            link.last_snr.map(|s| format!("{:.2}", s)).unwrap_or_else(|| "-".into()),
            link.last_rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            link.source,
            link.observation_count,
            link.last_seen.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    println!();
    println!("{} links", links.len());

    store.close().await;
    Ok(())
}

async fn cmd_packet(db: &Path, id: String, from: String, to: String) -> Result<()> {
    let id = parse_packet_id(&id)?;
    let from = parse_node(&from)?;
    let to = parse_node(&to)?;

    let store = open_store(db).await?;
    let Some(packet) = store.packet(id, from, to).await? else {
        bail!("No packet {:08x} from !{} to !{}", id, from, to);
    };
    let hops = store.packet_hops(id, from, to).await?;

    println!("=== Packet {:08x} ===", packet.id);
    println!();
    println!("From:           !{}", packet.from_id);
    println!("To:             !{}", packet.to_id);
    println!("First seen:     {}", packet.first_seen.format("%Y-%m-%d %H:%M:%S%.3f UTC"));
    println!(
        "Port:           {}",
        packet
            .portnum
            .map(PortNum::name_of)
            .unwrap_or("UNKNOWN")
    );
    println!("Length:         {}", packet.length);
    println!("Hop start:      {}", packet.hop_start);
    println!();
    println!("Observations ({}):", hops.len());
    for hop in &hops {
        println!(
            "  !{}  hop limit {}  RSSI {} dBm  SNR {:.2} dB  relay {}  at {}",
            hop.gateway_id,
            hop.hop_limit,
            hop.rssi,
            hop.snr,
            hop.relay_node
                .map(|r| format!("..{:02x}", r))
                .unwrap_or_else(|| "-".into()),
            hop.seen_at.format("%H:%M:%S%.3f"),
        );
    }

    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    info!(db = %config.db_path.display(), "configuration loaded");

    match cli.command {
        Commands::Listen {
            broker,
            port,
            root_topic,
            json,
        } => cmd_listen(config, broker, port, root_topic, json).await,

        Commands::Decode { hex, base64, file } => cmd_decode(hex, base64, file),

        Commands::Nodes {
            since_hours,
            gateway,
        } => cmd_nodes(&config.db_path, since_hours, gateway).await,

        Commands::Links { since_hours, node } => {
            cmd_links(&config.db_path, since_hours, node).await
        }

        Commands::Packet { id, from, to } => cmd_packet(&config.db_path, id, from, to).await,
    }
}
