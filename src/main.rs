use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gw_failover::{
    ensure_privileged, FailoverConfig, FailoverController, FileConfig, IcmpPinger, IpRouteTable,
    PrometheusSink, DEFAULT_CONFIG_PATH,
};

/// Gateway Failover - keeps only reachable gateways in the default route set
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
struct Args {
    /// Path to configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Log decisions without modifying the routing table
    #[clap(long)]
    dry_run: bool,

    /// Only manage IPv4 default routes
    #[clap(long)]
    no_ipv6: bool,

    /// Metric penalty applied to inactive routes
    #[clap(long)]
    inactive_route_metric: Option<u32>,

    /// Seconds without replies before a route is deactivated
    #[clap(long)]
    deactivate_threshold: Option<u64>,

    /// Seconds of steady replies before a route is activated again
    #[clap(long)]
    activate_threshold: Option<u64>,

    /// Ping interval in milliseconds
    #[clap(long)]
    ping_interval: Option<u64>,

    /// Seconds to wait for an echo reply
    #[clap(long)]
    reply_timeout: Option<u64>,

    /// Routing protocol tag of the managed default routes
    #[clap(long)]
    protocol: Option<String>,

    /// Use unprivileged ICMP (ping) sockets
    #[clap(long)]
    unprivileged_ping: bool,

    /// Address to serve Prometheus metrics on
    #[clap(long)]
    metrics_listen: Option<SocketAddr>,
}

/// Precedence: Args -> Config File -> Defaults
fn load_config(args: &Args) -> Result<FailoverConfig> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = FailoverConfig::default();
    if config_path.exists() {
        debug!("Reading configuration from {:?}", config_path);
        let file = FileConfig::load(&config_path)
            .with_context(|| format!("Failed to load config file {:?}", config_path))?;
        config.apply_file(file);
    } else if args.config.is_some() {
        anyhow::bail!("Config file {:?} does not exist", config_path);
    } else {
        debug!("No configuration file at {:?}, using defaults", config_path);
    }

    if args.dry_run {
        config.dry_run = true;
    }
    if args.no_ipv6 {
        config.ipv6 = false;
    }
    if let Some(metric) = args.inactive_route_metric {
        config.inactive_route_metric = metric;
    }
    if let Some(secs) = args.deactivate_threshold {
        config.deactivate_threshold = Duration::from_secs(secs);
    }
    if let Some(secs) = args.activate_threshold {
        config.activate_threshold = Duration::from_secs(secs);
    }
    if let Some(ms) = args.ping_interval {
        config.ping_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = args.reply_timeout {
        config.reply_timeout = Duration::from_secs(secs);
    }
    if let Some(protocol) = &args.protocol {
        config.route_protocol = protocol.clone();
    }
    if args.unprivileged_ping {
        config.privileged_ping = false;
    }
    if let Some(listen) = args.metrics_listen {
        config.metrics_listen = Some(listen);
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    // RUST_LOG=debug shows every command and per-tick statistics
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    debug!("Effective configuration: {:?}", config);

    ensure_privileged()?;

    info!(
        "Starting gateway failover (dry run: {}, IPv6: {})",
        config.dry_run, config.ipv6
    );
    info!(
        "Thresholds - deactivate: {:?}, activate: {:?}, reply timeout: {:?}",
        config.deactivate_threshold, config.activate_threshold, config.reply_timeout
    );

    let sink = Arc::new(PrometheusSink::install(config.metrics_listen)?);
    let table = Arc::new(IpRouteTable::new(
        config.route_protocol.clone(),
        config.command_timeout,
    ));
    let pinger = Arc::new(IcmpPinger::new(config.privileged_ping));

    let mut controller = FailoverController::discover(Arc::new(config), table, pinger, sink)
        .context("Route discovery failed")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("Failed to install signal handler")?;
    }

    controller.run(&shutdown)?;
    Ok(())
}
