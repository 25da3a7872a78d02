use choral::platform::{DependentReconciler, InMemoryPlatform, NoopDependent, StaticDiscovery};
use choral::runtime::{default_logger, StandaloneLeadership};
use choral::{ClusterKey, ClusterSpec, OperatorConfig, OperatorRuntime, TopologyMode};
use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "choral")]
#[command(about = "Topology control plane for clustered relational databases", long_about = None)]
struct Args {
    /// Number of parallel reconciliation workers
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Consecutive failed primary probes before an automatic failover
    #[arg(long, default_value_t = 3)]
    failover_probe_threshold: u32,

    /// Timeout in seconds for admin commands against instances
    #[arg(long, default_value_t = 10)]
    admin_timeout: u64,

    /// Instance count of the demo cluster
    #[arg(long, default_value_t = 3)]
    demo_replicas: u32,

    /// Topology of the demo cluster (multi-master, primary-replica, none)
    #[arg(long, default_value = "multi-master")]
    demo_topology: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let topology = match args.demo_topology.as_str() {
        "multi-master" => TopologyMode::MultiMaster,
        "primary-replica" => TopologyMode::PrimaryReplica,
        "none" => TopologyMode::None,
        other => {
            error!("Unknown topology '{}'", other);
            return Err(format!("unknown topology '{}'", other).into());
        }
    };

    let config = OperatorConfig::default()
        .with_workers(args.workers)
        .with_failover_probe_threshold(args.failover_probe_threshold)
        .with_admin_timeout(Duration::from_secs(args.admin_timeout));

    // Demo deployment against the in-memory platform: one cluster,
    // stubbed dependent objects.
    let platform = InMemoryPlatform::new();
    let key = ClusterKey::new("demo");
    platform.add_cluster(key.clone(), ClusterSpec::new(args.demo_replicas, topology));

    let dependents: Vec<Arc<dyn DependentReconciler>> = [
        "credentials",
        "config",
        "service",
        "endpoints",
        "compute",
        "rbac",
        "monitoring",
        "jobs",
    ]
    .into_iter()
    .map(|name| Arc::new(NoopDependent::new(name)) as Arc<dyn DependentReconciler>)
    .collect();

    let runtime = OperatorRuntime::new(
        Arc::new(platform.clone()),
        Arc::new(platform.admin()),
        dependents,
        Arc::new(StaticDiscovery { monitoring: false }),
        config,
        default_logger(),
    )?;

    let (event_tx, event_rx) = mpsc::channel(64);
    runtime.start(event_rx, Arc::new(StandaloneLeadership)).await?;
    info!("choral running, press ctrl-c to stop");

    signal::ctrl_c().await?;
    info!("Received shutdown signal");

    drop(event_tx);
    runtime.shutdown().await;
    Ok(())
}
