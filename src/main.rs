// Garden Node - Main Entry Point
//
// Runs a garden mesh node on a host and offers helpers for operators:
// - run: setup mode, then the node loop, fed by serial lines on stdin
// - encrypt: seal a command for one node or for every node
// - inspect: validate a captured radio packet

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use garden_node::command::fields;
use garden_node::config::{Config, DEFAULT_CONFIG_FILE};
use garden_node::mesh::crypto::SecureChannel;
use garden_node::mesh::packet::PacketCodec;
use garden_node::mesh::peers::PeerAddress;
use garden_node::mesh::transport::{broadcast_marker, destination_marker, MAX_ADDRESSED_COMMAND};
use garden_node::node::{Node, NodeContext, NodeInputs, Shutdown};
use garden_node::platform::host::{
    spawn_line_reader, HostSystem, HostTelemetry, HostUpdater, LoggingRadio,
};
use garden_node::platform::{ConfigStore, FileStore, RadioEvents};

/// Garden Node: secure mesh runtime for garden sensor modules
#[derive(Parser, Debug)]
#[command(name = "garden-node")]
#[command(author = "Garden Contributors")]
#[command(version)]
#[command(about = "Secure mesh transport and command protocol for garden sensor nodes", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a node, reading serial commands from stdin
    Run {
        /// Path to the host configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Override the configuration store directory
        #[arg(long)]
        store: Option<PathBuf>,

        /// Stay in setup mode even if the node is configured
        #[arg(long)]
        setup: bool,
    },
    /// Seal a command with the mesh key
    Encrypt {
        /// Mesh root key
        #[arg(long)]
        key: String,

        /// Command document to seal
        #[arg(long)]
        command: String,

        /// Node identifier (12 hex digits) to address the command to
        #[arg(long, conflicts_with = "broadcast")]
        destination: Option<String>,

        /// Address the command to every node
        #[arg(long)]
        broadcast: bool,
    },
    /// Validate a captured 250 byte packet
    Inspect {
        /// Mesh root key
        #[arg(long)]
        key: String,

        /// Packet bytes as hex
        #[arg(long)]
        packet: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Run {
            config,
            store,
            setup,
        }) => {
            let mut config = Config::load_from_path(&config)?;
            if let Some(store) = store {
                config.node.store_path = store;
            }
            init_tracing(args.verbose, &config)?;
            run_node(config, setup).await?;
        }
        Some(Commands::Encrypt {
            key,
            command,
            destination,
            broadcast,
        }) => {
            init_tracing(args.verbose, &Config::default())?;
            let target = if broadcast {
                Some(broadcast_marker())
            } else {
                destination
                    .map(|id| {
                        PeerAddress::from_identifier(&id)
                            .map(|address| destination_marker(&address.identifier()))
                            .with_context(|| format!("Invalid destination: {}", id))
                    })
                    .transpose()?
            };
            println!("{}", encrypt_command(&key, &command, target.as_deref())?);
        }
        Some(Commands::Inspect { key, packet }) => {
            init_tracing(args.verbose, &Config::default())?;
            println!("{}", inspect_packet(&key, &packet)?);
        }
        None => {
            println!("No command specified. Use \"garden-node --help\" for usage.");
        }
    }

    Ok(())
}

/// Initialize tracing on stderr, keeping stdout for command output.
fn init_tracing(verbose: bool, config: &Config) -> Result<()> {
    let filter = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(filter.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }

    Ok(())
}

/// Run a node on this host until it restarts, sleeps or stdin closes.
async fn run_node(config: Config, force_setup: bool) -> Result<()> {
    let identity = config.node_address()?;
    let store = FileStore::open(&config.node.store_path).with_context(|| {
        format!(
            "Failed to open configuration store at {:?}",
            config.node.store_path
        )
    })?;

    info!("garden node {} v{} starting", identity, env!("CARGO_PKG_VERSION"));

    let mut node = host_node(&config, identity, Box::new(store));

    let mut serial = spawn_line_reader(tokio::io::stdin(), config.node.radio_queue_depth);

    if let Some(shutdown) = node.setup(&mut serial, force_setup).await {
        report(&shutdown);
        return Ok(());
    }

    let settings = node.start().context("Failed to start mesh transport")?;
    info!("node started as {} on channel {}", settings.role, settings.channel);

    // No radio hardware on a host; the queue closes immediately.
    let (_, radio) = RadioEvents::channel(config.node.radio_queue_depth);

    let shutdown = node
        .run(NodeInputs {
            serial,
            radio,
            broker: None,
        })
        .await;
    report(&shutdown);

    Ok(())
}

/// Assemble a node from the host collaborators.
fn host_node(config: &Config, identity: PeerAddress, store: Box<dyn ConfigStore>) -> Node {
    let ctx = NodeContext::new(
        identity,
        store,
        Box::new(LoggingRadio::new()),
        Box::new(HostSystem),
        Box::new(HostUpdater),
        config.ota_settings(),
    );
    Node::new(ctx).with_telemetry(Box::new(HostTelemetry::new()), config.telemetry_interval())
}

fn report(shutdown: &Shutdown) {
    match shutdown {
        Shutdown::Restart(reason) => info!("node stopped for restart: {}", reason),
        Shutdown::Sleep(period) => info!("node entered deep sleep for {}s", period.as_secs()),
        Shutdown::InputClosed => warn!("input closed, node stopped"),
    }
}

/// Seal `command` and render it for delivery.
///
/// Without a destination the sealed frame is printed as hex. With one, a
/// `Publish` document is produced that a controller can relay.
fn encrypt_command(key: &str, command: &str, destination: Option<&str>) -> Result<String> {
    let channel = SecureChannel::new(key.as_bytes()).context("Invalid mesh key")?;
    let frame = channel
        .encrypt(command.as_bytes())
        .context("Failed to seal command")?
        .to_frame();

    let Some(destination) = destination else {
        return Ok(hex::encode(frame));
    };

    if command.len() > MAX_ADDRESSED_COMMAND {
        anyhow::bail!(
            "Command of {} bytes is too large to address; the limit is {} bytes",
            command.len(),
            MAX_ADDRESSED_COMMAND
        );
    }

    let mut addressed = destination.as_bytes().to_vec();
    addressed.extend_from_slice(&frame);

    let document = json!({
        fields::COMMAND: "Publish",
        fields::PAYLOAD: format!("h{}", hex::encode(addressed)),
    });
    Ok(document.to_string())
}

/// Describe a captured packet, or why it was rejected.
fn inspect_packet(key: &str, packet: &str) -> Result<String> {
    let channel = SecureChannel::new(key.as_bytes()).context("Invalid mesh key")?;
    let raw = hex::decode(packet.trim()).context("Packet is not valid hex")?;

    let packet = match PacketCodec::new(&channel).unframe(&raw) {
        Ok(packet) => packet,
        Err(e) => return Ok(format!("rejected: {}", e)),
    };

    let header = packet.header();
    let payload = packet.trimmed_payload();
    Ok(format!(
        "correlation: {:08x}\nfragment: {}/{}\npayload: {}",
        header.correlation,
        header.sequence,
        header.total,
        String::from_utf8_lossy(payload)
    ))
}
