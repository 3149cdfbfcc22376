//! Mesh Master command line
//!
//! # Usage
//!
//! ```bash
//! # Run the controller against a UDP mesh gateway
//! mesh-master --config master.toml run --gateway 127.0.0.1:4403
//!
//! # Dump stored records of one peer for a UTC day
//! mesh-master --config master.toml records --peer '!a1b2c3d4' --day 2024-05-01
//!
//! # Summarize the record store
//! mesh-master --config master.toml stats
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mesh_master::network::CommandProvisioner;
use mesh_master::util::format_unix;
use mesh_master::{BatchStore, Config, MasterController, PeerId, SqliteStore, TimeRange, UdpTransport};

#[derive(Parser, Debug)]
#[command(name = "mesh-master")]
#[command(about = "Master controller for field devices on a private mesh channel", long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path, overriding the configured one
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the mesh gateway and run the controller
    Run {
        /// Gateway address, overriding device.address
        #[arg(short, long)]
        gateway: Option<String>,

        /// Local UDP address to bind
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: String,

        /// Write a JSON snapshot of peers and stats on exit
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Print stored records as JSON lines
    Records {
        /// Peer id (e.g. '!a1b2c3d4'); all peers when omitted
        #[arg(short, long)]
        peer: Option<String>,

        /// Start of the range, unix seconds
        #[arg(long)]
        from: Option<u64>,

        /// End of the range, unix seconds (inclusive)
        #[arg(long)]
        to: Option<u64>,

        /// UTC calendar day (YYYY-MM-DD), replacing --from/--to
        #[arg(long, conflicts_with_all = ["from", "to"])]
        day: Option<NaiveDate>,
    },
    /// Summarize the record store
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(db) = &args.db {
        config.storage.path = db.clone();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let store = Arc::new(SqliteStore::open(&config.storage.path, config.storage.query_page_size)?);

    match args.command {
        Commands::Run { gateway, bind, export } => run(config, store, gateway, bind, export).await,
        Commands::Records { peer, from, to, day } => {
            let peer = parse_peer(peer)?;
            let range = match day {
                Some(day) => TimeRange::day(day),
                None => TimeRange::new(from.unwrap_or(0), to.unwrap_or(u64::MAX)),
            };
            for record in store.records_in_range(peer.as_ref(), range)? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
        Commands::Stats => {
            println!("Database: {}", config.storage.path);
            println!("Records: {}", store.record_count(None)?);
            for peer in store.peer_ids()? {
                let count = store.record_count(Some(&peer))?;
                match store.time_span(Some(&peer))? {
                    Some((first, last)) => println!(
                        "  {}: {} records, {} .. {}",
                        peer,
                        count,
                        format_unix(first),
                        format_unix(last)
                    ),
                    None => println!("  {}: {} records", peer, count),
                }
            }
            Ok(())
        }
    }
}

fn parse_peer(peer: Option<String>) -> Result<Option<PeerId>> {
    match peer {
        Some(raw) => match PeerId::new(raw) {
            Some(id) => Ok(Some(id)),
            None => bail!("peer id must not be empty"),
        },
        None => Ok(None),
    }
}

async fn run(
    mut config: Config,
    store: Arc<SqliteStore>,
    gateway: Option<String>,
    bind: String,
    export: Option<PathBuf>,
) -> Result<()> {
    if let Some(gateway) = gateway {
        config.device.address = gateway;
    }
    if config.device.address.is_empty() {
        bail!("no gateway address: set device.address or pass --gateway");
    }

    let transport = UdpTransport::from_addresses(&bind, &config.device.address)?;
    let provisioner = CommandProvisioner::from_config(&config);

    let mut controller = MasterController::new(config, transport, store)?;
    if let Some(provisioner) = provisioner {
        controller = controller.with_provisioner(Arc::new(provisioner));
    }
    let controller = Arc::new(controller);

    tracing::info!(
        gateway = %controller.config().device.address,
        channel = controller.config().channel.private_channel_index,
        port = controller.config().channel.private_port,
        version = mesh_master::VERSION,
        protocol = mesh_master::core::PROTOCOL_VERSION,
        "Mesh master starting"
    );

    controller.initialize().await.context("initializing the controller")?;

    let signal = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
        }
        signal.shutdown();
    });

    controller.run().await?;

    if let Some(path) = export {
        controller.export_json(&path)?;
    }
    let stats = controller.stats();
    tracing::info!(
        peers = stats.peers.total_peers,
        batches = stats.peers.total_batches,
        errors = stats.peers.total_errors,
        "Mesh master stopped"
    );
    Ok(())
}
