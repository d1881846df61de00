use clap::Parser;
use distributed_scheduler::config::NodeArgs;
use distributed_scheduler::forwarding::handlers::router;
use distributed_scheduler::membership::{GossipMembership, MembershipProvider};
use distributed_scheduler::poller::{LoggingRetriever, PollerFactory};
use distributed_scheduler::store::memory::InMemoryClusterStore;
use distributed_scheduler::supervisor::Supervisor;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = NodeArgs::parse();
    let http_addr = args.http_addr();
    let apps = args.demo_apps()?;

    tracing::info!("Starting node on {} (rpc {})", args.bind, http_addr);
    if !args.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", args.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip + ring):
    let membership = match GossipMembership::new(args.bind, http_addr, &args.cluster).await {
        Ok(membership) => Arc::new(membership),
        Err(e) => {
            tracing::error!("Cannot create membership session: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Node ID: {:?}", membership.service().local_node.id);

    // Subscribed before bootstrap so no departure is missed during boot.
    let events = membership.subscribe();

    let seeds: Vec<String> = args.seeds.iter().map(|s| s.to_string()).collect();
    if let Err(e) = membership.bootstrap(&seeds, args.join_size).await {
        tracing::error!("Bootstrap failed: {}", e);
        std::process::exit(1);
    }

    // 2. Store & entities:
    let store = Arc::new(InMemoryClusterStore::new(args.history_max_len));
    for app in &apps {
        store.put_app(app.clone());
    }
    let factory = Arc::new(PollerFactory::new(
        store.clone(),
        Arc::new(LoggingRetriever::new()),
        args.poll_interval(),
    ));

    let supervisor = Supervisor::new(
        membership.clone(),
        store.clone(),
        factory,
        args.supervisor_config(),
    );

    // 3. Membership events:
    let watcher = supervisor.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher.watch_membership(events).await {
            tracing::error!("Terminating: {}", e);
            std::process::exit(1);
        }
    });

    // 4. RPC server:
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let app = router(supervisor.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("RPC server stopped: {}", e);
        }
    });
    tracing::info!("RPC server listening on {}", http_addr);

    // 5. Boot; a half-booted node must not serve:
    if let Err(e) = supervisor.boot().await {
        tracing::error!("Boot failed: {}", e);
        std::process::exit(1);
    }

    for app in &apps {
        if let Err(e) = supervisor.activate_app(app).await {
            tracing::warn!("Activating {} failed: {}", app.app_id, e);
        }
    }

    // 6. Spawn stats reporter:
    let stats_supervisor = supervisor.clone();
    let stats_membership = membership.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let stats = stats_supervisor.stats();
            let members = stats_membership.reachable_members().unwrap_or_default();
            tracing::info!(
                "Node {} [{}]: {} entities ({} running, {} failed, {} restarts), {} members",
                stats.node,
                stats.state,
                stats.registered,
                stats.running,
                stats.failed,
                stats.recovered,
                members.len()
            );
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    supervisor.stop_node().await;
    membership.shutdown().await;

    Ok(())
}
