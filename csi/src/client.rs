//! Administrative CLI driving the controller service directly against
//! a configured appliance. Useful for lab bring-up and for inspecting
//! state without going through the orchestrator.

use byte_unit::Byte;
use clap::{Parser, Subcommand};
use csi::{
    config::Config,
    controller::{ControllerService, CreateVolumeRequest},
    events::LogEventSink,
    snapshot::SnapshotFilter,
    volume::{AccessMode, AccessType, FsType, VolumeCapability},
};
use rds::{RdsClient, RdsOps};
use std::{collections::HashMap, path::PathBuf, sync::Arc};

#[derive(Parser)]
#[command(name = "rds-csi-client", version, about = "RDS CSI admin client")]
struct Cli {
    /// driver configuration file (YAML)
    #[arg(short, long, env = "RDS_CSI_CONFIG")]
    config: Option<PathBuf>,
    /// appliance address, overriding the configuration
    #[arg(long)]
    address: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Volume operations
    #[command(subcommand)]
    Volume(VolumeCmd),
    /// Snapshot operations
    #[command(subcommand)]
    Snapshot(SnapshotCmd),
    /// Report free capacity on the appliance
    Capacity,
    /// Probe the appliance command channel
    Probe,
}

#[derive(Subcommand)]
enum VolumeCmd {
    /// Provision a volume
    Create {
        /// volume name; the id is derived from it deterministically
        #[arg(long)]
        name: String,
        /// capacity, e.g. 10GiB
        #[arg(long)]
        size: String,
        /// filesystem type, or "block" for raw block volumes
        #[arg(long, default_value = "ext4")]
        mode: String,
        /// restore from this snapshot id
        #[arg(long)]
        from_snapshot: Option<String>,
    },
    /// Show one volume
    Get {
        #[arg(long)]
        id: String,
    },
    /// List volumes
    List,
    /// Delete a volume
    Delete {
        #[arg(long)]
        id: String,
    },
    /// Grow a volume
    Resize {
        #[arg(long)]
        id: String,
        #[arg(long)]
        size: String,
    },
}

#[derive(Subcommand)]
enum SnapshotCmd {
    /// Snapshot a volume
    Create {
        #[arg(long)]
        name: String,
        /// source volume id
        #[arg(long)]
        volume: String,
    },
    /// List snapshots
    List {
        /// only snapshots of this source volume
        #[arg(long)]
        volume: Option<String>,
    },
    /// Delete a snapshot
    Delete {
        #[arg(long)]
        id: String,
    },
}

fn parse_size(value: &str) -> Result<u64, String> {
    value
        .parse::<Byte>()
        .map(|byte| byte.get_bytes() as u64)
        .map_err(|error| format!("invalid size '{}': {}", value, error))
}

fn capability(mode: &str) -> Result<VolumeCapability, String> {
    let access_type = match mode {
        "block" => AccessType::Block,
        other => AccessType::Filesystem(
            FsType::parse(other).map_err(|error| error.to_string())?,
        ),
    };
    Ok(VolumeCapability {
        access_type,
        access_mode: AccessMode::SingleWriter,
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("error: {}", error);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            Config::from_file(path).map_err(|error| error.to_string())?
        }
        None => Config::default(),
    };
    if let Some(address) = cli.address {
        config.rds.address = address;
    }

    let rds: Arc<dyn RdsOps> =
        Arc::new(RdsClient::new(config.rds.clone()));
    let service = ControllerService::new(
        config,
        rds.clone(),
        Arc::new(LogEventSink),
    );

    match cli.command {
        Command::Capacity => {
            let free = service
                .get_capacity()
                .await
                .map_err(|error| error.to_string())?;
            println!("{} bytes free", free);
        }
        Command::Probe => {
            rds.probe().await.map_err(|error| error.to_string())?;
            println!("appliance is reachable");
        }
        Command::Volume(cmd) => run_volume(&service, cmd).await?,
        Command::Snapshot(cmd) => run_snapshot(&service, cmd).await?,
    }
    Ok(())
}

async fn run_volume(
    service: &ControllerService,
    cmd: VolumeCmd,
) -> Result<(), String> {
    match cmd {
        VolumeCmd::Create {
            name,
            size,
            mode,
            from_snapshot,
        } => {
            let volume = service
                .create_volume(CreateVolumeRequest {
                    name,
                    required_bytes: parse_size(&size)?,
                    limit_bytes: 0,
                    capabilities: vec![capability(&mode)?],
                    snapshot_source: from_snapshot,
                    parameters: HashMap::new(),
                })
                .await
                .map_err(|error| error.to_string())?;
            println!("{} ({} bytes)", volume.id, volume.capacity);
            for (key, value) in &volume.context {
                println!("  {} = {}", key, value);
            }
        }
        VolumeCmd::Get { id } => {
            let (volumes, _) = service
                .list_volumes(0, "")
                .await
                .map_err(|error| error.to_string())?;
            match volumes.into_iter().find(|entry| entry.id == id) {
                Some(entry) => {
                    println!("{} ({} bytes)", entry.id, entry.capacity)
                }
                None => return Err(format!("volume {} not found", id)),
            }
        }
        VolumeCmd::List => {
            let (volumes, _) = service
                .list_volumes(0, "")
                .await
                .map_err(|error| error.to_string())?;
            for entry in volumes {
                println!("{} ({} bytes)", entry.id, entry.capacity);
            }
        }
        VolumeCmd::Delete { id } => {
            service
                .delete_volume(&id)
                .await
                .map_err(|error| error.to_string())?;
            println!("deleted {}", id);
        }
        VolumeCmd::Resize { id, size } => {
            let response = service
                .expand_volume(&id, parse_size(&size)?, None)
                .await
                .map_err(|error| error.to_string())?;
            println!("{} now {} bytes", id, response.capacity);
        }
    }
    Ok(())
}

async fn run_snapshot(
    service: &ControllerService,
    cmd: SnapshotCmd,
) -> Result<(), String> {
    match cmd {
        SnapshotCmd::Create { name, volume } => {
            let snapshot = service
                .create_snapshot(&name, &volume)
                .await
                .map_err(|error| error.to_string())?;
            println!(
                "{} (source {}, {} bytes)",
                snapshot.id, snapshot.source_volume_id, snapshot.size
            );
        }
        SnapshotCmd::List { volume } => {
            let (snapshots, _) = service
                .list_snapshots(
                    SnapshotFilter {
                        snapshot_id: None,
                        source_volume_id: volume,
                    },
                    0,
                    "",
                )
                .await
                .map_err(|error| error.to_string())?;
            for snapshot in snapshots {
                println!(
                    "{} (source {}, {} bytes)",
                    snapshot.id, snapshot.source_volume_id, snapshot.size
                );
            }
        }
        SnapshotCmd::Delete { id } => {
            service
                .delete_snapshot(&id)
                .await
                .map_err(|error| error.to_string())?;
            println!("deleted {}", id);
        }
    }
    Ok(())
}
