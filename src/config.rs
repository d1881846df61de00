//! Node and supervisor configuration.

use crate::forwarding::protocol::ForwardOptions;
use crate::store::types::App;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Tunables of the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Replay missed work after taking over a departed node's entities.
    pub reconciliation_enabled: bool,

    /// How many one-minute buckets back from now to replay.
    pub reconciliation_offset_minutes: u32,

    /// Byte budget of the persisted `{node:status}` history of an entity.
    pub history_max_len: usize,

    pub restart: RestartPolicy,

    pub forward: ForwardOptions,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconciliation_enabled: true,
            reconciliation_offset_minutes: 3,
            history_max_len: 256,
            restart: RestartPolicy::default(),
            forward: ForwardOptions::default(),
        }
    }
}

/// Restart budget of a crashing entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Consecutive restarts allowed before the entity is marked failed.
    pub max_restarts: u32,

    /// Delay before the first restart; doubled on each further crash.
    pub initial_backoff: Duration,

    /// Cap on the delay. A run that lasts at least this long resets the budget.
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Command line of the node binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "distributed_scheduler", about = "Schedule poller cluster node")]
pub struct NodeArgs {
    /// Gossip (UDP) bind address. The RPC server listens on the same IP.
    #[arg(long, env = "SCHEDULER_BIND")]
    pub bind: SocketAddr,

    /// Seed node gossip addresses. Omit to found a new cluster.
    #[arg(long = "seed", env = "SCHEDULER_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<SocketAddr>,

    /// Nodes only gossip with members announcing the same cluster name.
    #[arg(long, env = "SCHEDULER_CLUSTER", default_value = "scheduler")]
    pub cluster: String,

    /// Number of seeds to send join requests to.
    #[arg(long, default_value_t = 3)]
    pub join_size: usize,

    /// RPC port = gossip port + offset.
    #[arg(long, default_value_t = 1000)]
    pub http_port_offset: u16,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub reconciliation: bool,

    #[arg(long, default_value_t = 3)]
    pub reconciliation_offset: u32,

    #[arg(long, default_value_t = 256)]
    pub history_max_len: usize,

    /// Apps to register and activate after boot, as `name:partitions`.
    #[arg(long = "app", env = "SCHEDULER_APPS", value_delimiter = ',')]
    pub apps: Vec<String>,

    /// Seconds between two ticks of a schedule poller.
    #[arg(long, default_value_t = 60)]
    pub poll_interval_secs: u64,
}

impl NodeArgs {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            reconciliation_enabled: self.reconciliation,
            reconciliation_offset_minutes: self.reconciliation_offset,
            history_max_len: self.history_max_len,
            ..SupervisorConfig::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn demo_apps(&self) -> anyhow::Result<Vec<App>> {
        self.apps.iter().map(|spec| parse_app(spec)).collect()
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.bind.ip(),
            self.bind.port().saturating_add(self.http_port_offset),
        )
    }
}

fn parse_app(spec: &str) -> anyhow::Result<App> {
    let (name, partitions) = spec
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("app '{}' is not in name:partitions form", spec))?;
    let partitions: u32 = partitions
        .parse()
        .map_err(|e| anyhow::anyhow!("app '{}' has a bad partition count: {}", spec, e))?;
    if name.is_empty() || partitions == 0 {
        anyhow::bail!("app '{}' needs a name and at least one partition", spec);
    }
    Ok(App::new(name, partitions, true))
}
