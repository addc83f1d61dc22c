//! Metanode
//!
//! This binary hosts the extent-deletion state of one or more metadata
//! partitions on a single replica. Each partition gets a loopback
//! replication group led by this node.

use anyhow::{Context, Result};
use clap::Parser;
use metanode_common::{ConcurrencyLimiter, NodeConfig};
use metanode_partition::{LocalReplicator, MetaPartition, NodeContext, Replicator, StatvfsDiskUsage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "metanode")]
#[command(about = "Metanode extent deletion service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/metanode/metanode.toml")]
    config: String,

    /// Node ID (overrides the configuration file)
    #[arg(long)]
    node_id: Option<u64>,

    /// Data directory (overrides the configuration file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Partitions to host, comma separated (overrides the configuration file)
    #[arg(long, value_delimiter = ',')]
    partitions: Vec<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// File, then `METANODE__<SECTION>__<KEY>` environment, then CLI flags
fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config: NodeConfig = config::Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(
            config::Environment::with_prefix("METANODE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("node.partitions"),
        )
        .build()
        .with_context(|| format!("Failed to load configuration from {}", args.config))?
        .try_deserialize()
        .context("Invalid configuration")?;

    if let Some(node_id) = args.node_id {
        config.node.node_id = node_id;
    }
    if let Some(data_dir) = &args.data_dir {
        config.node.data_dir.clone_from(data_dir);
    }
    if !args.partitions.is_empty() {
        config.node.partitions.clone_from(&args.partitions);
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Metanode");

    let config = load_config(&args)?;
    let node_id = config.node.node_id;
    info!(
        "Node {} hosting partitions {:?} under {:?}",
        node_id, config.node.partitions, config.node.data_dir
    );

    let ctx = NodeContext {
        node_id,
        limiter: Arc::new(ConcurrencyLimiter::new(config.limiter.max_concurrency)),
        disk: Arc::new(StatvfsDiskUsage),
    };

    let mut partitions = Vec::with_capacity(config.node.partitions.len());
    for &partition_id in &config.node.partitions {
        let replicator = Arc::new(LocalReplicator::new(Some(node_id)));
        let partition = MetaPartition::open(
            partition_id,
            config.node.partition_dir(partition_id),
            &config,
            &ctx,
            Arc::clone(&replicator) as Arc<dyn Replicator>,
        )
        .with_context(|| format!("Failed to open partition {partition_id}"))?;
        replicator.register(&partition.as_state_machine());
        partition.start()?;
        partitions.push((partition, replicator));
    }

    info!("Metanode ready with {} partitions", partitions.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for (partition, _) in &partitions {
        partition.shutdown().await;
    }
    ctx.limiter.close();

    info!("Metanode shut down gracefully");

    Ok(())
}
