//! Beacon Agent
//!
//! Registers this process as a discoverable node, or inspects the nodes
//! registered by others.

mod observability;

use anyhow::Context;
use beacon_core::Node;
use beacon_discovery::config::parse_endpoints;
use beacon_discovery::{
    CoordinationStore, DiscoveryConfig, EtcdStore, LeaseSupervisor, MemoryStore, NodeRegistry,
    StoreClient, WatchProjector,
};
use clap::{Parser, Subcommand, ValueEnum};
use observability::tracing::{init_tracing, TracingConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "beacon-agent")]
#[command(about = "Register and discover service nodes over etcd")]
struct Cli {
    /// Coordination store backend
    #[arg(long, value_enum, default_value_t = StoreKind::Etcd)]
    store: StoreKind,

    /// etcd endpoints (comma-separated)
    #[arg(long, env = "BEACON_ETCD_ENDPOINTS", default_value = "http://127.0.0.1:2379")]
    endpoints: String,

    /// Key namespace
    #[arg(long, env = "BEACON_NAMESPACE", default_value = "/beacon")]
    namespace: String,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "BEACON_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Etcd,
    /// Process-local store, useful for dry runs
    Memory,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this process and keep it registered until Ctrl-C
    Register {
        #[arg(long)]
        service_type: String,
        #[arg(long)]
        id: u32,
        #[arg(long, default_value = "")]
        uri: String,
        #[arg(long, default_value = "")]
        bind_interface: String,
        /// Lease TTL in seconds; 0 selects the default
        #[arg(long, default_value_t = 0)]
        ttl: i64,
        /// Revoke the lease on exit instead of letting it expire
        #[arg(long)]
        revoke_on_exit: bool,
    },
    /// Print node events under a directory as JSON lines
    Watch {
        #[arg(long, default_value = "/")]
        dir: String,
    },
    /// Print the nodes registered under a directory
    List {
        #[arg(long, default_value = "/")]
        dir: String,
    },
    /// Delete a node's key
    Deregister {
        #[arg(long)]
        service_type: String,
        #[arg(long)]
        id: u32,
    },
    /// Print the remaining TTL of a lease
    LeaseTtl {
        #[arg(long)]
        lease_id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingConfig::from_env());

    if let Some(addr) = cli.metrics_addr {
        observability::metrics::init_metrics(addr)?;
    }

    let mut config = DiscoveryConfig::from_env();
    config.endpoints = parse_endpoints(&cli.endpoints);
    config.namespace = cli.namespace.clone();
    config.validate()?;

    let store = open_store(cli.store, &config).await?;
    let client = StoreClient::new(store, &config);

    match cli.command {
        Commands::Register {
            service_type,
            id,
            uri,
            bind_interface,
            ttl,
            revoke_on_exit,
        } => {
            let node = Node::new(service_type, id)
                .with_process_id(i64::from(std::process::id()))
                .with_host(std::env::var("HOSTNAME").unwrap_or_default())
                .with_bind_interface(bind_interface)
                .with_uri(uri);
            run_register(client, &config, node, ttl, revoke_on_exit).await
        }
        Commands::Watch { dir } => run_watch(client, &config, &dir).await,
        Commands::List { dir } => {
            let nodes = client.list(&dir).await?;
            println!("{}", serde_json::to_string_pretty(&nodes)?);
            Ok(())
        }
        Commands::Deregister { service_type, id } => {
            let name = Node::new(service_type, id).registration_name();
            client
                .delete(&name)
                .await
                .with_context(|| format!("failed to deregister {name}"))?;
            info!(name = %name, "Node deregistered");
            Ok(())
        }
        Commands::LeaseTtl { lease_id } => {
            let ttl = client.lease_ttl(lease_id).await?;
            println!("{ttl}");
            Ok(())
        }
    }
}

async fn open_store(
    kind: StoreKind,
    config: &DiscoveryConfig,
) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    match kind {
        StoreKind::Etcd => {
            info!(endpoints = ?config.endpoints, "Connecting to etcd");
            let store = EtcdStore::connect(config)
                .await
                .context("failed to connect to etcd")?;
            info!("Connected to etcd");
            Ok(Arc::new(store))
        }
        StoreKind::Memory => {
            warn!("Using process-local memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run_register(
    client: StoreClient,
    config: &DiscoveryConfig,
    node: Node,
    ttl: i64,
    revoke_on_exit: bool,
) -> anyhow::Result<()> {
    let supervisor = LeaseSupervisor::new(client, config);
    let shutdown = CancellationToken::new();
    let name = node.registration_name();

    let handle = supervisor.register_and_keep_alive_forever(name, node, ttl, &shutdown);
    info!(key = %handle.key(), ttl = handle.ttl(), "Registration started, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    if revoke_on_exit {
        supervisor.revoke(&handle).await?;
        info!(key = %handle.key(), "Lease revoked");
    } else {
        shutdown.cancel();
        if let Some(lease_id) = handle.lease_id() {
            info!(key = %handle.key(), lease_id = lease_id, "Leaving lease to expire");
        }
    }
    Ok(())
}

async fn run_watch(client: StoreClient, config: &DiscoveryConfig, dir: &str) -> anyhow::Result<()> {
    let projector = WatchProjector::new(client.clone(), config);
    let registry = NodeRegistry::new();
    let shutdown = CancellationToken::new();

    // Subscribe before listing so nothing between the two is missed
    let mut events = projector.watch(dir, &shutdown).await?;
    registry.seed(client.list(dir).await?).await;
    info!(root = %events.root(), nodes = registry.count().await, "Watching");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                shutdown.cancel();
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    warn!(root = %events.root(), dropped = events.dropped(), "Watch ended");
                    break;
                };
                println!("{}", serde_json::to_string(&event)?);
                registry.apply(&event).await;
                info!(nodes = registry.count().await, types = ?registry.types().await, "Registry updated");
            }
        }
    }
    Ok(())
}
