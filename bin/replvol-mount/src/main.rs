#![allow(clippy::result_large_err)]
//! ReplVol mount daemon
//!
//! Registers volume records in the metadata store, attaches volumes against
//! their replica sets and exports them over NBD until interrupted.

mod nbd;
mod store;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replvol_common::{
    ReadLevel, ReplicaId, ReplicaSet, VolumeConfig, VolumeDescriptor, VolumeName, WriteLevel,
    format_size, parse_size,
};
use replvol_volume::{
    FaultEvent, MemoryReplica, Metadata, MetadataService, TcpConnector, VolumeCoordinator,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::nbd::NbdServer;
use crate::store::RedbKv;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "replvol-mount", about = "ReplVol volume attach and NBD export")]
struct Args {
    /// Metadata store (Redb file)
    #[arg(
        long,
        env = "REPLVOL_METADATA_PATH",
        default_value = "./replvol-meta.redb",
        global = true
    )]
    metadata_path: PathBuf,

    /// Log filter (level or directives, e.g. `replvol_volume=debug,info`)
    #[arg(long, env = "REPLVOL_LOG", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a volume record in the metadata store
    Init {
        /// Volume name
        name: String,

        /// Block size (e.g. 4KiB)
        #[arg(long, default_value = "4KiB", value_parser = parse_size)]
        block_size: u64,

        /// Number of blocks
        #[arg(long)]
        block_count: u64,

        /// Replica endpoint (host:port), in priority order; repeat per replica
        #[arg(long = "replica", required = true)]
        replicas: Vec<String>,
    },

    /// Attach volumes and export them over NBD
    Nbd {
        /// Volumes to attach
        #[arg(required = true)]
        volumes: Vec<String>,

        /// NBD TCP listen address
        #[arg(long, default_value = "0.0.0.0:10809")]
        listen: SocketAddr,

        #[command(flatten)]
        io: IoArgs,
    },

    /// Serve an in-memory replica over the replica protocol
    Replica {
        /// Replica listen address
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: SocketAddr,

        /// Block size of the volumes it backs
        #[arg(long, default_value = "4KiB", value_parser = parse_size)]
        block_size: u64,
    },
}

#[derive(Debug, clap::Args)]
struct IoArgs {
    /// Write-back cache size per volume
    #[arg(long, env = "REPLVOL_WRITE_CACHE_SIZE", default_value = "128MiB", value_parser = parse_size)]
    write_cache_size: u64,

    /// Read cache size per volume
    #[arg(long, env = "REPLVOL_READ_CACHE_SIZE", default_value = "20MiB", value_parser = parse_size)]
    read_cache_size: u64,

    /// Read level (spread / seq / block)
    #[arg(long, env = "REPLVOL_READLEVEL", default_value = "block")]
    readlevel: ReadLevel,

    /// Write level (all / one / local)
    #[arg(long, env = "REPLVOL_WRITELEVEL", default_value = "all")]
    writelevel: WriteLevel,

    /// Background flush interval in seconds
    #[arg(long, default_value_t = 5)]
    flush_interval_s: u64,

    /// Upper bound on the flush at detach, in seconds
    #[arg(long, default_value_t = 30)]
    detach_timeout_s: u64,
}

impl IoArgs {
    fn volume_config(&self) -> VolumeConfig {
        VolumeConfig {
            write_cache_bytes: self.write_cache_size,
            read_cache_bytes: self.read_cache_size,
            read_level: self.readlevel,
            write_level: self.writelevel,
            flush_interval: Duration::from_secs(self.flush_interval_s),
            detach_timeout: Duration::from_secs(self.detach_timeout_s),
            ..VolumeConfig::default()
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Command::Init {
            name,
            block_size,
            block_count,
            replicas,
        } => init(&args.metadata_path, name, block_size, block_count, replicas).await,
        Command::Nbd {
            volumes,
            listen,
            io,
        } => serve_nbd(&args.metadata_path, &volumes, listen, &io).await,
        Command::Replica { listen, block_size } => serve_replica(listen, block_size).await,
    }
}

async fn init(
    metadata_path: &Path,
    name: String,
    block_size: u64,
    block_count: u64,
    replicas: Vec<String>,
) -> Result<()> {
    let metadata = Metadata::new(RedbKv::open(metadata_path).context("open metadata store")?);
    let descriptor = VolumeDescriptor {
        name: VolumeName::new(name).context("volume name")?,
        block_size,
        block_count,
        replicas: ReplicaSet::new(replicas.into_iter().map(ReplicaId::new).collect())
            .context("replica set")?,
    };
    metadata
        .register_volume(&descriptor)
        .await
        .with_context(|| format!("register volume {}", descriptor.name))?;

    info!(
        "Registered volume {} ({} x {} = {}) on {} replicas",
        descriptor.name,
        descriptor.block_count,
        format_size(descriptor.block_size),
        format_size(descriptor.size_bytes()),
        descriptor.replicas.len()
    );
    Ok(())
}

async fn serve_nbd(
    metadata_path: &Path,
    volumes: &[String],
    listen: SocketAddr,
    io: &IoArgs,
) -> Result<()> {
    info!("Starting ReplVol NBD export");

    let metadata: Arc<dyn MetadataService> = Arc::new(Metadata::new(
        RedbKv::open(metadata_path).context("open metadata store")?,
    ));
    let config = io.volume_config();
    let server = Arc::new(NbdServer::new());

    // ── Attach ────────────────────────────────────────────────────────────────
    let mut attached = Vec::with_capacity(volumes.len());
    for name in volumes {
        let name = VolumeName::new(name.as_str()).context("volume name")?;
        let volume =
            VolumeCoordinator::attach(&name, config.clone(), Arc::clone(&metadata), &TcpConnector)
                .await
                .with_context(|| format!("attach volume {name}"))?;
        tokio::spawn(log_faults(name.clone(), volume.faults()));
        server.register(Arc::clone(&volume));
        attached.push(volume);
    }

    // ── NBD TCP listener ──────────────────────────────────────────────────────
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind NBD listener on {listen}"))?;
    let nbd = tokio::spawn(Arc::clone(&server).serve(listener));

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("Shutting down");
    nbd.abort();

    // ── Detach ────────────────────────────────────────────────────────────────
    for volume in attached {
        server.unregister(volume.name().as_str());
        match volume.detach().await {
            Ok(report) if report.is_clean() => info!("Detached {}", volume.name()),
            Ok(report) => warn!(
                "Detached {} with {} dirty and {} lagging blocks (lease released: {})",
                volume.name(),
                report.dirty_blocks,
                report.lagging_blocks,
                report.lease_released
            ),
            Err(e) => error!("Failed to detach {}: {e}", volume.name()),
        }
    }
    Ok(())
}

/// Surface faults no caller was waiting for
async fn log_faults(volume: VolumeName, mut faults: broadcast::Receiver<FaultEvent>) {
    loop {
        match faults.recv().await {
            Ok(event) => warn!(volume = %volume, "fault: {event:?}"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(volume = %volume, "fault log lagged, {missed} events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn serve_replica(listen: SocketAddr, block_size: u64) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind replica listener on {listen}"))?;
    let replica = Arc::new(MemoryReplica::new(ReplicaId::new(listen.to_string()), block_size));
    info!(
        "Serving in-memory replica on {listen} (block size {})",
        format_size(block_size)
    );

    tokio::select! {
        () = replvol_volume::tcp::serve(listener, replica) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("wait for shutdown signal")?;
            info!("Shutting down");
        }
    }
    Ok(())
}
