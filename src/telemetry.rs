//! Observability for monitored routes.
//!
//! Monitors report through a [`MetricsSink`] handed to them at construction.
//! [`PrometheusSink`] forwards to the `metrics` facade and, when a listen
//! address is configured, exposes the values over HTTP.

use chrono::{DateTime, Local};
use ::metrics::{describe_counter, describe_gauge, gauge, increment_counter, increment_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::errors::{FailoverError, FailoverResult};
use crate::network::RouteIdentity;

/// Receives per-route observations
pub trait MetricsSink: Send + Sync {
    /// The route's activation state or metric changed
    fn route_state(&self, route: &RouteIdentity, active: bool, metric: u32);

    /// Whether the gateway is currently answering
    fn route_reachable(&self, route: &RouteIdentity, reachable: bool);

    fn probe_sent(&self, route: &RouteIdentity);

    /// A reply arrived; `rtt` is known when the matching request was seen
    fn probe_replied(&self, route: &RouteIdentity, rtt: Option<Duration>);

    /// Latest public address seen through the route, if the lookup succeeded
    fn external_address(&self, route: &RouteIdentity, external: Option<&str>);
}

/// Point-in-time copy of a monitor's state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteStatus {
    pub interface: String,
    pub gateway: IpAddr,
    pub source: IpAddr,
    pub metric: u32,
    pub active: bool,
    pub last_change: Option<DateTime<Local>>,
}

/// Render a route set as a single JSON line for the log
pub fn describe_routes(routes: &[RouteStatus]) -> String {
    serde_json::to_string(routes).unwrap_or_else(|e| format!("<unserializable routes: {}>", e))
}

const ROUTE_INFO: &str = "gw_failover_route_info";
const ROUTE_UP: &str = "gw_failover_route_up";
const ROUTE_ACTIVE: &str = "gw_failover_route_active";
const ROUTE_METRIC: &str = "gw_failover_route_metric";
const PING_REQUESTS: &str = "gw_failover_ping_requests_total";
const PING_REPLIES: &str = "gw_failover_ping_replies_total";
const PING_RTT: &str = "gw_failover_ping_rtt_total_seconds";

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// [`MetricsSink`] publishing Prometheus series
#[derive(Debug, Clone, Default)]
pub struct PrometheusSink {
    _private: (),
}

impl PrometheusSink {
    /// Install the exporter when `listen` is set.
    ///
    /// Without a listen address nothing records the values and every call is a
    /// no-op.
    pub fn install(listen: Option<SocketAddr>) -> FailoverResult<Self> {
        if let Some(addr) = listen {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| FailoverError::Metrics(e.to_string()))?;
            log::info!("Metrics server listening on {}", addr);
        }

        describe_gauge!(ROUTE_INFO, "Route info.");
        describe_gauge!(ROUTE_UP, "Whether the gateway on the route replies to pings.");
        describe_gauge!(
            ROUTE_ACTIVE,
            "Whether this route is considered usable for outgoing traffic."
        );
        describe_gauge!(ROUTE_METRIC, "Metric of the route.");
        describe_counter!(PING_REQUESTS, "Counter of ping requests sent to the gateway.");
        describe_counter!(PING_REPLIES, "Counter of ping replies received from the gateway.");
        describe_gauge!(
            PING_RTT,
            "Sum of ping round-trip times (divide by ping_replies_total for the average)."
        );

        Ok(PrometheusSink { _private: () })
    }
}

impl MetricsSink for PrometheusSink {
    fn route_state(&self, route: &RouteIdentity, active: bool, metric: u32) {
        let gateway = route.gateway.to_string();
        gauge!(ROUTE_ACTIVE, flag(active), "gateway" => gateway.clone(), "interface" => route.interface.clone());
        gauge!(ROUTE_METRIC, f64::from(metric), "gateway" => gateway, "interface" => route.interface.clone());
    }

    fn route_reachable(&self, route: &RouteIdentity, reachable: bool) {
        gauge!(ROUTE_UP, flag(reachable), "gateway" => route.gateway.to_string(), "interface" => route.interface.clone());
    }

    fn probe_sent(&self, route: &RouteIdentity) {
        increment_counter!(PING_REQUESTS, "gateway" => route.gateway.to_string(), "interface" => route.interface.clone());
    }

    fn probe_replied(&self, route: &RouteIdentity, rtt: Option<Duration>) {
        let gateway = route.gateway.to_string();
        increment_counter!(PING_REPLIES, "gateway" => gateway.clone(), "interface" => route.interface.clone());
        if let Some(rtt) = rtt {
            increment_gauge!(PING_RTT, rtt.as_secs_f64(), "gateway" => gateway, "interface" => route.interface.clone());
        }
    }

    fn external_address(&self, route: &RouteIdentity, external: Option<&str>) {
        gauge!(
            ROUTE_INFO,
            1.0,
            "gateway" => route.gateway.to_string(),
            "interface" => route.interface.clone(),
            "source" => route.source.to_string(),
            "external" => external.unwrap_or("").to_string()
        );
    }
}
