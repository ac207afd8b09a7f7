//! FlexDS: translates service-discovery state into Envoy configuration
//! served over ADS.
//!
//! Wires the pipeline together: discovery sources feed the aggregator,
//! which rebuilds snapshots into the cache, which the ADS server streams
//! to connected proxies. An admin HTTP server exposes metrics and a
//! liveness probe.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flexds_build::SnapshotManager;
use flexds_cache::SnapshotCache;
use flexds_discovery::consul::{ConsulConfig, ConsulSource, WatcherKind};
use flexds_discovery::marathon::{MarathonConfig, MarathonSource};
use flexds_discovery::{file, ServiceAggregator};
use flexds_server::{admin, shutdown, XdsServer};

/// How long task teardown may take before remaining tasks are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "flexds", version, about)]
struct Cli {
    /// ADS gRPC port.
    #[arg(long, default_value_t = 18000)]
    ads_port: u16,

    /// Admin HTTP port (metrics and liveness).
    #[arg(long, default_value_t = 19005)]
    admin_port: u16,

    /// Log level: debug, info, warn, or error.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Use Consul for service discovery.
    #[arg(long)]
    consul: bool,

    /// Consul HTTP address (host:port).
    #[arg(long, default_value = "localhost:8500")]
    consul_addr: String,

    /// Consul watcher strategy: immediate, debounce, or batch.
    #[arg(long, default_value = "immediate")]
    consul_watcher_strategy: WatcherKind,

    /// Use a YAML file for service discovery.
    #[arg(long)]
    yaml: bool,

    /// Path to the YAML service file (required with --yaml).
    #[arg(long)]
    yaml_file: Option<PathBuf>,

    /// Use Marathon for service discovery.
    #[arg(long)]
    marathon: bool,

    /// Marathon HTTP address.
    #[arg(long, default_value = "http://localhost:8080")]
    marathon_addr: String,

    /// Path to a file containing Marathon credentials (username:password).
    #[arg(long)]
    marathon_creds_path: Option<PathBuf>,

    /// Interval between Marathon service polls.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    marathon_poll_interval: Duration,

    /// Comma-separated list of listener ports.
    #[arg(long, default_value = "18080", value_delimiter = ',')]
    listener_ports: Vec<u16>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level)
                .map_err(|err| eyre::eyre!("invalid log level {:?}: {err}", cli.log_level))?,
        )
        .init();

    if !cli.consul && !cli.yaml && !cli.marathon {
        eyre::bail!("at least one discovery source must be enabled: --consul, --yaml, or --marathon");
    }
    if cli.yaml && cli.yaml_file.is_none() {
        eyre::bail!("--yaml-file must be specified when using --yaml");
    }

    let cache = Arc::new(SnapshotCache::new());
    let manager = SnapshotManager::new(Arc::clone(&cache), cli.listener_ports.clone());
    let aggregator = Arc::new(ServiceAggregator::new(manager));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let ads_addr = SocketAddr::from(([0, 0, 0, 0], cli.ads_port));
    let server = XdsServer::new(Arc::clone(&cache));
    {
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(error) = server.serve(ads_addr, rx).await {
                error!(%error, "ADS server failed");
            }
        });
    }

    let admin_addr = SocketAddr::from(([0, 0, 0, 0], cli.admin_port));
    {
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(error) = admin::serve(admin_addr, rx).await {
                error!(%error, "admin server failed");
            }
        });
    }

    if cli.consul {
        let config = ConsulConfig::new(&cli.consul_addr, cli.consul_watcher_strategy);
        let source = ConsulSource::new(config, Arc::clone(&aggregator))?;
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(error) = source.run(rx).await {
                error!(%error, "consul source failed");
            }
        });
    }

    if cli.yaml {
        let path = cli.yaml_file.as_ref().expect("validated above");
        file::load(path, &aggregator)?;
    }

    if cli.marathon {
        let config = MarathonConfig {
            url: cli.marathon_addr.clone(),
            credentials_path: cli.marathon_creds_path.clone(),
            interval: cli.marathon_poll_interval,
        };
        let source = MarathonSource::new(config, Arc::clone(&aggregator))?;
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(error) = source.run(rx).await {
                error!(%error, "marathon source failed");
            }
        });
    }

    shutdown::wait_for_signal().await;
    info!("shutdown signal received, stopping services");
    let _ = shutdown_tx.send(true);

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period exceeded, aborting remaining tasks");
        tasks.shutdown().await;
    }

    info!("exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["flexds", "--yaml", "--yaml-file", "svc.yaml"]).unwrap();
        assert_eq!(cli.ads_port, 18000);
        assert_eq!(cli.admin_port, 19005);
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.consul_watcher_strategy, WatcherKind::Immediate);
        assert_eq!(cli.marathon_poll_interval, Duration::from_secs(30));
        assert_eq!(cli.listener_ports, [18080]);
    }

    #[test]
    fn listener_ports_split_on_commas() {
        let cli = Cli::try_parse_from([
            "flexds",
            "--consul",
            "--listener-ports",
            "18080,18081,9090",
        ])
        .unwrap();
        assert_eq!(cli.listener_ports, [18080, 18081, 9090]);
    }

    #[test]
    fn watcher_strategy_parses() {
        let cli = Cli::try_parse_from([
            "flexds",
            "--consul",
            "--consul-watcher-strategy",
            "debounce",
        ])
        .unwrap();
        assert!(matches!(
            cli.consul_watcher_strategy,
            WatcherKind::Debounce(_)
        ));

        assert!(Cli::try_parse_from([
            "flexds",
            "--consul",
            "--consul-watcher-strategy",
            "eager",
        ])
        .is_err());
    }

    #[test]
    fn poll_interval_accepts_duration_strings() {
        let cli = Cli::try_parse_from([
            "flexds",
            "--marathon",
            "--marathon-poll-interval",
            "2m",
        ])
        .unwrap();
        assert_eq!(cli.marathon_poll_interval, Duration::from_secs(120));
    }
}
