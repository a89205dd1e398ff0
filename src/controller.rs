//! Startup discovery of default routes and the supervisory check loop.

use log::{debug, error, info, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config::FailoverConfig;
use crate::errors::{FailoverError, FailoverResult};
use crate::external_ip::ExternalIpWatcher;
use crate::icmp::is_unicast_link_local;
use crate::monitor::{DiscoveredRoute, RouteMonitor};
use crate::network::{AddressFamily, InterfaceAddress, KernelRoute, RouteIdentity, RouteTable};
use crate::prober::Pinger;
use crate::telemetry::{describe_routes, MetricsSink, RouteStatus};

/// Find every default route worth failing over between.
///
/// Routes are returned ordered by metric (penalty removed), ties in the order
/// the kernel listed them. A family with fewer than two routes is left out
/// unless running dry. Routes installed by another protocol are skipped before
/// that count is taken.
pub fn discover_routes(
    table: &dyn RouteTable,
    config: &FailoverConfig,
) -> FailoverResult<Vec<DiscoveredRoute>> {
    let mut families = vec![AddressFamily::V4];
    if config.ipv6 {
        families.push(AddressFamily::V6);
    }

    let mut discovered = Vec::new();
    for family in families {
        let mut routes = Vec::new();
        for kernel_route in table.list_default_routes(family)? {
            let Some(route) = resolve_route(table, config, &kernel_route)? else {
                continue;
            };
            debug!("Found {} default route {} metric {}", family, route, kernel_route.metric);
            routes.push(DiscoveredRoute::from_kernel_metric(
                route,
                kernel_route.metric,
                config.inactive_route_metric,
            ));
        }

        if routes.len() < 2 {
            if config.dry_run && !routes.is_empty() {
                warn!(
                    "Only {} {} default route found, keeping it for dry run",
                    routes.len(),
                    family
                );
            } else {
                if !routes.is_empty() {
                    warn!(
                        "Only {} {} default route found, nothing to fail over to",
                        routes.len(),
                        family
                    );
                }
                continue;
            }
        }
        discovered.extend(routes);
    }

    if discovered.is_empty() {
        return Err(FailoverError::NoUsableRoutes);
    }

    // Stable sort keeps discovery order among equal metrics
    discovered.sort_by_key(|route| route.metric);
    Ok(discovered)
}

fn resolve_route(
    table: &dyn RouteTable,
    config: &FailoverConfig,
    kernel_route: &KernelRoute,
) -> FailoverResult<Option<RouteIdentity>> {
    let foreign = kernel_route.protocol != config.route_protocol;
    // Another daemon's routes are left alone whatever their shape
    if foreign && !config.dry_run {
        warn!(
            "Skipping {} default route via {} with protocol {:?}, only {:?} routes are managed",
            kernel_route.family,
            describe_hop(kernel_route),
            kernel_route.protocol,
            config.route_protocol
        );
        return Ok(None);
    }

    if kernel_route.multipath {
        return Err(FailoverError::UnsupportedRoute(format!(
            "{} multipath default route",
            kernel_route.family
        )));
    }
    let (interface, gateway) = match (&kernel_route.interface, kernel_route.gateway) {
        (Some(interface), Some(gateway)) => (interface.clone(), gateway),
        (Some(interface), None) => {
            return Err(FailoverError::UnsupportedRoute(format!(
                "default route on {} has no gateway",
                interface
            )))
        }
        _ => {
            return Err(FailoverError::UnsupportedRoute(format!(
                "{} default route has no interface",
                kernel_route.family
            )))
        }
    };
    let name = format!("{}@{}", gateway, interface);

    if foreign {
        warn!(
            "Default route {} has protocol {:?} instead of {:?}, kept for dry run",
            name, kernel_route.protocol, config.route_protocol
        );
    }

    let source = match kernel_route.source {
        Some(source) => source,
        None => {
            let addresses = table.interface_addresses(&interface)?;
            select_source(&addresses, &gateway).ok_or(FailoverError::NoSourceAddress(name))?
        }
    };

    Ok(Some(RouteIdentity {
        family: kernel_route.family,
        interface,
        gateway,
        source,
    }))
}

fn describe_hop(route: &KernelRoute) -> String {
    match (&route.interface, route.gateway) {
        (Some(interface), Some(gateway)) => format!("{}@{}", gateway, interface),
        (Some(interface), None) => interface.clone(),
        _ if route.multipath => "multiple next hops".to_string(),
        _ => "unknown next hop".to_string(),
    }
}

/// Pick the interface address the gateway is reachable from
pub fn select_source(addresses: &[InterfaceAddress], gateway: &IpAddr) -> Option<IpAddr> {
    if let IpAddr::V6(gw) = gateway {
        if is_unicast_link_local(gw) {
            return addresses
                .iter()
                .find(|a| a.address.is_ipv6() && a.is_link())
                .map(|a| a.address);
        }
    }
    addresses
        .iter()
        .find(|a| a.is_global() && a.contains(gateway))
        .map(|a| a.address)
}

/// Owns every route monitor and drives the periodic checks
pub struct FailoverController {
    config: Arc<FailoverConfig>,
    sink: Arc<dyn MetricsSink>,
    monitors: Vec<RouteMonitor>,
    external_ip: Option<ExternalIpWatcher>,
}

impl FailoverController {
    /// Discover the default routes and build a monitor for each
    pub fn discover(
        config: Arc<FailoverConfig>,
        table: Arc<dyn RouteTable>,
        pinger: Arc<dyn Pinger>,
        sink: Arc<dyn MetricsSink>,
    ) -> FailoverResult<Self> {
        let monitors = discover_routes(table.as_ref(), &config)?
            .into_iter()
            .map(|route| {
                RouteMonitor::new(
                    route,
                    Arc::clone(&config),
                    Arc::clone(&table),
                    Arc::clone(&pinger),
                    Arc::clone(&sink),
                )
            })
            .collect();

        Ok(FailoverController {
            config,
            sink,
            monitors,
            external_ip: None,
        })
    }

    pub fn monitors(&self) -> &[RouteMonitor] {
        &self.monitors
    }

    pub fn snapshot(&self) -> Vec<RouteStatus> {
        self.monitors.iter().map(RouteMonitor::status).collect()
    }

    /// Start probing every route; on any failure nothing is left running
    pub fn start(&mut self) -> FailoverResult<()> {
        for index in 0..self.monitors.len() {
            if let Err(e) = self.monitors[index].start_pinging() {
                self.stop();
                return Err(e);
            }
        }

        if let Some(url) = &self.config.external_ip_url {
            let routes = self.monitors.iter().map(|m| m.route().clone()).collect();
            let watcher = ExternalIpWatcher::spawn(
                routes,
                url.clone(),
                self.config.external_ip_interval,
                self.config.external_ip_timeout,
                Arc::clone(&self.sink),
            );
            match watcher {
                Ok(watcher) => self.external_ip = Some(watcher),
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Stop every prober. The routing table is left as it is.
    pub fn stop(&mut self) {
        if let Some(watcher) = self.external_ip.take() {
            watcher.stop();
        }
        for monitor in &mut self.monitors {
            monitor.stop_pinging();
        }
    }

    /// Check every route once; true if any of them changed state
    pub fn check_all(&mut self) -> bool {
        let mut changed = false;
        for monitor in &mut self.monitors {
            match monitor.check() {
                Ok(true) => changed = true,
                Ok(false) => {}
                Err(e) => error!("Failed to update route {}: {}", monitor.route(), e),
            }
        }
        changed
    }

    /// Start probing and check all routes every tick until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> FailoverResult<()> {
        info!("{}", describe_routes(&self.snapshot()));
        self.start()?;

        while !shutdown.load(Ordering::SeqCst) {
            thread::sleep(self.config.check_interval);
            if self.check_all() {
                info!("{}", describe_routes(&self.snapshot()));
            }
        }

        info!("Shutting down, leaving routes as they are");
        self.stop();
        Ok(())
    }
}

impl Drop for FailoverController {
    fn drop(&mut self) {
        self.stop();
    }
}
