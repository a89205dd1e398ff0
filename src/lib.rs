//! # Gateway Failover
//!
//! A daemon for hosts with several default routes. Every gateway is pinged
//! continuously; a gateway that stops answering has its route demoted by a
//! large metric penalty, and a gateway that answers steadily again gets its
//! original metric back. Separate thresholds for both directions keep routes
//! from flapping.
//!
//! The pieces, from the bottom up:
//! - [`counter::HealthCounter`] turns echo request/reply instants into up and
//!   down times
//! - [`monitor::RouteMonitor`] owns one route, its prober and the
//!   activate/deactivate state machine
//! - [`controller::FailoverController`] discovers the routes and runs the
//!   periodic check loop

pub mod config;
pub mod controller;
pub mod counter;
pub mod errors;
pub mod external_ip;
pub mod icmp;
pub mod monitor;
pub mod network;
pub mod prober;
pub mod telemetry;

// Re-export commonly used types and functions
pub use config::{FailoverConfig, FileConfig, DEFAULT_CONFIG_PATH};
pub use controller::{discover_routes, select_source, FailoverController};
pub use counter::{HealthCounter, HealthSnapshot};
pub use errors::{FailoverError, FailoverResult};
pub use monitor::{DiscoveredRoute, RouteMonitor};
pub use network::{
    ensure_privileged,
    AddressFamily,
    InterfaceAddress,
    IpRouteTable,
    KernelRoute,
    RouteIdentity,
    RouteTable,
};
pub use prober::{IcmpPinger, Pinger, ProbeEvent, ProbeHandle, ProberConfig};
pub use telemetry::{MetricsSink, PrometheusSink, RouteStatus};
