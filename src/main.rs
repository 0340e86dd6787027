//! `replimond`: run the cluster monitor against a set of backends.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use replimon::{ClusterMonitor, MonitorConfig, ServerAddress};

#[derive(Debug, Parser)]
#[command(name = "replimond", about = "MariaDB replication monitor")]
struct Args {
    /// Monitored backend, as [name=]host[:port]. Repeat for each server.
    #[arg(long = "server", required = true)]
    servers: Vec<ServerAddress>,

    /// Monitor user.
    #[arg(long)]
    user: String,

    /// Monitor password.
    #[arg(long, env = "REPLIMON_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Seconds between monitor passes.
    #[arg(long, default_value_t = 2)]
    tick_interval: u64,

    /// Per-statement timeout in seconds.
    #[arg(long, default_value_t = 5)]
    query_timeout: u64,

    /// Match replication edges by server id instead of host:port.
    #[arg(long)]
    shared_hostnames: bool,

    /// Do not manage scheduled server events across role swaps.
    #[arg(long)]
    no_events: bool,

    /// Refresh all backends concurrently.
    #[arg(long)]
    parallel_update: bool,

    /// Replication user for CHANGE MASTER; defaults to the monitor user.
    #[arg(long)]
    replication_user: Option<String>,

    /// Replication password; defaults to the monitor password.
    #[arg(long, env = "REPLIMON_REPLICATION_PASSWORD", hide_env_values = true)]
    replication_password: Option<String>,

    /// Use SSL on created replication connections.
    #[arg(long)]
    replication_ssl: bool,

    /// Time budget in seconds for a switchover.
    #[arg(long, default_value_t = 90)]
    switchover_timeout: u64,

    /// Time budget in seconds for a failover.
    #[arg(long, default_value_t = 90)]
    failover_timeout: u64,
}

impl Args {
    fn into_config(self) -> MonitorConfig {
        MonitorConfig {
            servers: self.servers,
            user: self.user,
            password: self.password,
            tick_interval_secs: self.tick_interval,
            query_timeout_secs: self.query_timeout,
            assume_unique_hostnames: !self.shared_hostnames,
            handle_events: !self.no_events,
            parallel_update: self.parallel_update,
            replication_user: self.replication_user,
            replication_password: self.replication_password,
            replication_ssl: self.replication_ssl,
            switchover_timeout_secs: self.switchover_timeout,
            failover_timeout_secs: self.failover_timeout,
            ..MonitorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Args::parse().into_config();
    let mut monitor = ClusterMonitor::new(config)
        .map_err(anyhow::Error::msg)
        .context("invalid monitor configuration")?;

    let stop = monitor.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    monitor.run().await;
    Ok(())
}
