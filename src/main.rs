use clap::Parser;
use dac_cluster::apps;
use dac_cluster::config::EngineConfig;
use dac_cluster::engine::jobs::JobRegistry;
use dac_cluster::engine::types::Invocation;
use dac_cluster::engine::worker::Worker;
use dac_cluster::error::EngineError;
use dac_cluster::membership::service::MembershipService;
use dac_cluster::membership::types::NodeId;
use dac_cluster::transport::http::HttpTransport;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dac-node", about = "Divide-and-conquer cluster node")]
struct Cli {
    /// Gossip (UDP) address. The HTTP endpoint listens on port + 1000.
    #[arg(long)]
    bind: SocketAddr,

    /// Gossip address of an existing member. Repeatable.
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    /// Cluster label used by cluster-aware victim selection.
    #[arg(long, default_value = "default")]
    cluster: String,

    /// TOML engine configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gossip address of the node running the root. Defaults to this node.
    #[arg(long)]
    master: Option<SocketAddr>,

    /// Job the master runs as the root.
    #[arg(long, default_value = apps::FIB)]
    job: String,

    /// JSON arguments of the root job.
    #[arg(long, default_value = "30")]
    arg: String,

    /// Alive members the master waits for before starting the root.
    #[arg(long, default_value_t = 1)]
    wait_for: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!("Starting node on {}", cli.bind);
    if !cli.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", cli.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let http_addr = SocketAddr::new(cli.bind.ip(), cli.bind.port() + 1000);
    let membership = MembershipService::new(cli.bind, http_addr, &cli.cluster, cli.seeds.clone()).await?;
    tracing::info!("Node ID: {}", membership.local_node.id);

    {
        let service = membership.clone();
        tokio::spawn(async move {
            service.start().await;
        });
    }

    // 2. Transport (HTTP):
    let (router, inbox, loopback) = HttpTransport::inbound();
    let transport = HttpTransport::new(membership.clone(), loopback);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!("HTTP server listening on {}", http_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("HTTP server stopped: {}", e);
        }
    });

    // 3. Engine:
    let jobs = JobRegistry::new();
    apps::register_all(&jobs);

    let master = match cli.master {
        Some(addr) => NodeId::named(&addr.to_string()),
        None => membership.local_node.id.clone(),
    };
    let stats_interval = Duration::from_secs(config.stats_interval_secs.max(1));
    let worker = Worker::new(config, master, jobs, transport, membership.clone());
    apps::create_shared(worker.replicator())?;
    let _pump = worker.start(inbox);

    // 4. Stats reporter:
    {
        let worker = worker.clone();
        let membership = membership.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            loop {
                interval.tick().await;
                let alive = membership.get_alive_members();
                tracing::info!("Cluster stats: {} alive nodes", alive.len());
                for node in alive {
                    tracing::info!(
                        "  - {} cluster={} http={} (inc={})",
                        node.id,
                        node.cluster,
                        node.http_addr,
                        node.incarnation
                    );
                }
                worker.stats().log_summary(worker.id());
            }
        });
    }

    // 5. Run:
    if worker.is_master() {
        while membership.get_alive_members().len() < cli.wait_for {
            tracing::info!(
                "Waiting for {} members ({} alive)",
                cli.wait_for,
                membership.get_alive_members().len()
            );
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let args: serde_json::Value = serde_json::from_str(&cli.arg)?;
        let invocation = Invocation::new(&cli.job, args);
        match worker.spawn_root(invocation).await? {
            Ok(value) => tracing::info!("Result of {}({}): {}", cli.job, cli.arg, value),
            Err(e) => tracing::error!("Root task failed: {}", e),
        }
        // Let the exit broadcast drain.
        tokio::time::sleep(Duration::from_millis(500)).await;
    } else {
        match worker.spawn_idle_loop().await? {
            Ok(()) => tracing::info!("Computation finished"),
            Err(EngineError::RootLost(master)) => {
                tracing::error!("Master {} died, giving up", master)
            }
            Err(e) => tracing::error!("Worker stopped: {}", e),
        }
    }

    membership.leave().await;
    Ok(())
}
