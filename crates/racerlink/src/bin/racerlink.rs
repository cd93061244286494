//! racerlink - command line bridge to a StageRacer routing grid
//!
//! Subcommands:
//! - `racerlink watch` - follow status and topology until Ctrl-C
//! - `racerlink ports` - print the flat port table
//! - `racerlink nodes` - print nodes and telemetry
//! - `racerlink route <src> <dst>` / `disconnect <dst>` / `rename <key> <name>`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use racerconf::{ConfigSources, RacerConfig};
use racerlink::{Bridge, GridSnapshot, QueueOutcome, SessionState};

/// How long one-shot commands wait for the first topology.
const TOPOLOGY_TIMEOUT: Duration = Duration::from_secs(15);

/// How long one-shot commands wait for a command to be confirmed by a poll.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "racerlink")]
#[command(about = "Control and monitoring bridge for StageRacer routing grids")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./racerlink.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Matrix host, overrides the config file
    #[arg(long, global = true)]
    host: Option<String>,

    /// API token, overrides the config file
    #[arg(long, global = true, env = "RACERLINK_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Use plain HTTP
    #[arg(long, global = true)]
    http: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow session status and topology changes
    Watch,

    /// Print the flat port table
    Ports {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print nodes and their telemetry
    Nodes,

    /// Route a source to a destination
    Route {
        /// Source port key (e.g. E3_SDI_1)
        src: String,
        /// Destination port key
        dst: String,
    },

    /// Disconnect whatever feeds a destination
    Disconnect {
        /// Destination port key
        dst: String,
    },

    /// Rename a port
    Rename {
        /// Port key
        key: String,
        /// New name
        name: String,
    },
}

fn load_config(cli: &Cli) -> Result<(RacerConfig, ConfigSources)> {
    let (mut config, sources) =
        RacerConfig::load_with_sources_from(cli.config.as_deref()).context("Failed to load config")?;

    if let Some(host) = &cli.host {
        config.link.connection.host = host.clone();
    }
    if let Some(token) = &cli.token {
        config.link.connection.api_token = token.clone();
    }
    if cli.http {
        config.link.connection.use_https = false;
    }

    Ok((config, sources))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = load_config(&cli)?;

    let filter = EnvFilter::try_new(&config.link.telemetry.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for file in &sources.files {
        info!("config: {}", file.display());
    }
    for var in &sources.env_overrides {
        info!("config override: {}", var);
    }

    if let Err(e) = config.link.connection.validate() {
        warn!("{}", e);
    }

    let mut bridge = Bridge::new(config).context("Failed to create matrix client")?;

    let result = match cli.command {
        Commands::Watch => watch(&bridge).await,
        Commands::Ports { json } => ports(&bridge, json).await,
        Commands::Nodes => nodes(&bridge).await,
        Commands::Route { src, dst } => route(&mut bridge, &src, &dst).await,
        Commands::Disconnect { dst } => disconnect(&mut bridge, &dst).await,
        Commands::Rename { key, name } => rename(&bridge, &key, &name).await,
    };

    bridge.shutdown().await;
    result
}

/// Wait until the first topology has been published.
async fn first_topology(bridge: &Bridge) -> Result<Arc<GridSnapshot>> {
    tokio::time::timeout(TOPOLOGY_TIMEOUT, wait_for_topology(bridge))
        .await
        .context("Timed out waiting for the grid topology")?
}

async fn wait_for_topology(bridge: &Bridge) -> Result<Arc<GridSnapshot>> {
    let mut snapshots = bridge.subscribe();
    let mut status = bridge.subscribe_status();

    loop {
        if snapshots.borrow_and_update().topology_revision > 0 {
            return Ok(bridge.snapshot());
        }
        tokio::select! {
            changed = snapshots.changed() => changed.context("session stopped")?,
            changed = status.changed() => {
                changed.context("session stopped")?;
                let current = status.borrow_and_update().clone();
                if current.state == SessionState::Disconnected {
                    bail!("{}", current);
                }
            }
        }
    }
}

/// Wait for the poll that follows an issued command.
async fn confirm(bridge: &Bridge) -> Result<()> {
    let mut snapshots = bridge.subscribe();
    snapshots.borrow_and_update();
    tokio::time::timeout(CONFIRM_TIMEOUT, snapshots.changed())
        .await
        .context("Timed out waiting for confirmation")?
        .context("session stopped")?;
    Ok(())
}

async fn watch(bridge: &Bridge) -> Result<()> {
    let mut snapshots = bridge.subscribe();
    let mut status = bridge.subscribe_status();
    let mut revision = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            changed = status.changed() => {
                changed.context("session stopped")?;
                println!("status: {}", *status.borrow_and_update());
            }
            changed = snapshots.changed() => {
                changed.context("session stopped")?;
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.topology_revision != revision {
                    revision = snapshot.topology_revision;
                    println!(
                        "topology #{}: {} nodes, {} ports",
                        revision,
                        snapshot.nodes.len(),
                        snapshot.table.len()
                    );
                }
            }
        }
    }
}

async fn ports(bridge: &Bridge, json: bool) -> Result<()> {
    let snapshot = first_topology(bridge).await?;

    if json {
        let ports: Vec<_> = snapshot.table.iter().collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    for io in snapshot.table.iter() {
        let source = io.src_key.as_ref().map(|k| k.as_str()).unwrap_or("-");
        let active = if snapshot.activity.is_io_active(io) { "*" } else { " " };
        println!(
            "{} {:<24} {:<4} {:<10} {:<28} <- {}",
            active,
            io.key.as_str(),
            io.direction.as_str(),
            io.display_proto(),
            io.name,
            source
        );
    }
    Ok(())
}

async fn nodes(bridge: &Bridge) -> Result<()> {
    let snapshot = first_topology(bridge).await?;

    for node in &snapshot.nodes {
        println!("{} ({}, E{})", node.name, node.id, node.ember_id);
        let Some(status) = &node.status else {
            continue;
        };
        for t in &status.temperatures {
            println!("  temp  {:<16} {:.1} C", t.name, t.celsius);
        }
        for psu in &status.psus {
            println!("  psu   {:<16} {:.2} V", psu.name, psu.volts);
        }
        for trunk in &status.trunks {
            match trunk.popt_dbm {
                Some(dbm) => println!("  trunk {:<16} {:.1} dBm", trunk.index, dbm),
                None => println!("  trunk {:<16} -", trunk.index),
            }
        }
    }
    Ok(())
}

async fn route(bridge: &mut Bridge, src: &str, dst: &str) -> Result<()> {
    first_topology(bridge).await?;
    bridge.set_take(false);

    match bridge.queue_route(src, dst) {
        QueueOutcome::Issued => confirm(bridge).await,
        QueueOutcome::Incompatible => bail!("{} cannot be routed to {}", src, dst),
        QueueOutcome::Unresolved => bail!("unknown port {} or {}", src, dst),
        other => bail!("route not issued: {:?}", other),
    }
}

async fn disconnect(bridge: &mut Bridge, dst: &str) -> Result<()> {
    first_topology(bridge).await?;
    bridge.set_take(false);

    match bridge.queue_disconnect(dst) {
        QueueOutcome::Issued => confirm(bridge).await,
        QueueOutcome::Unresolved => bail!("unknown port {}", dst),
        other => bail!("disconnect not issued: {:?}", other),
    }
}

async fn rename(bridge: &Bridge, key: &str, name: &str) -> Result<()> {
    first_topology(bridge).await?;

    if !bridge.rename_io(key, name) {
        bail!("unknown port {}", key);
    }
    confirm(bridge).await
}
