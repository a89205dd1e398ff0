//! Per-route health monitoring and the activate/deactivate state machine.

use chrono::{DateTime, Local};
use crossbeam::channel::{self, Receiver};
use log::{debug, info, log, warn, Level};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::FailoverConfig;
use crate::counter::HealthCounter;
use crate::errors::{FailoverError, FailoverResult};
use crate::network::{RouteIdentity, RouteTable};
use crate::prober::{Pinger, ProbeEvent, ProbeHandle, ProberConfig};
use crate::telemetry::{MetricsSink, RouteStatus};

/// Requests older than this are forgotten when matching replies for RTT
const IN_FLIGHT_HORIZON: Duration = Duration::from_secs(60);
const MAX_IN_FLIGHT: usize = 256;

/// A default route found at startup, with the inactive penalty split off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRoute {
    pub route: RouteIdentity,
    /// Metric without the inactive penalty
    pub metric: u32,
    pub active: bool,
}

impl DiscoveredRoute {
    /// A kernel metric at or above the penalty marks a route we demoted earlier
    pub fn from_kernel_metric(route: RouteIdentity, kernel_metric: u32, penalty: u32) -> Self {
        if kernel_metric >= penalty {
            DiscoveredRoute {
                route,
                metric: kernel_metric - penalty,
                active: false,
            }
        } else {
            DiscoveredRoute {
                route,
                metric: kernel_metric,
                active: true,
            }
        }
    }
}

struct RunningProbe {
    handle: Box<dyn ProbeHandle>,
    recorder: JoinHandle<()>,
}

/// Watches one gateway and moves its route in and out of service.
///
/// `active` and `metric` are only written by the thread that calls
/// [`RouteMonitor::check`]; prober threads only ever touch the counter.
pub struct RouteMonitor {
    route: RouteIdentity,
    active: bool,
    metric: u32,
    last_change: Option<DateTime<Local>>,
    config: Arc<FailoverConfig>,
    table: Arc<dyn RouteTable>,
    pinger: Arc<dyn Pinger>,
    sink: Arc<dyn MetricsSink>,
    counter: Option<Arc<HealthCounter>>,
    probe: Option<RunningProbe>,
}

impl RouteMonitor {
    pub fn new(
        discovered: DiscoveredRoute,
        config: Arc<FailoverConfig>,
        table: Arc<dyn RouteTable>,
        pinger: Arc<dyn Pinger>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let monitor = RouteMonitor {
            route: discovered.route,
            active: discovered.active,
            metric: discovered.metric,
            last_change: None,
            config,
            table,
            pinger,
            sink,
            counter: None,
            probe: None,
        };
        monitor.sink.route_reachable(&monitor.route, false);
        monitor
            .sink
            .route_state(&monitor.route, monitor.active, monitor.metric);
        monitor
    }

    pub fn route(&self) -> &RouteIdentity {
        &self.route
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Metric without the inactive penalty
    pub fn metric(&self) -> u32 {
        self.metric
    }

    /// The metric the kernel should currently hold for this route
    pub fn kernel_metric(&self) -> u32 {
        if self.active {
            self.metric
        } else {
            self.metric.saturating_add(self.config.inactive_route_metric)
        }
    }

    pub fn is_pinging(&self) -> bool {
        self.probe.is_some()
    }

    pub fn status(&self) -> RouteStatus {
        RouteStatus {
            interface: self.route.interface.clone(),
            gateway: self.route.gateway,
            source: self.route.source,
            metric: self.metric,
            active: self.active,
            last_change: self.last_change,
        }
    }

    /// Start probing the gateway. Calling it while a prober runs does nothing.
    pub fn start_pinging(&mut self) -> FailoverResult<()> {
        if self.probe.is_some() {
            return Ok(());
        }

        let counter = Arc::new(HealthCounter::new(self.config.max_expected_rtt));
        let (events_tx, events_rx) = channel::unbounded();
        let prober_config = ProberConfig {
            target: self.route.gateway,
            source: self.route.source,
            interface: Some(self.route.interface.clone()),
            interval: self.config.ping_interval,
        };
        let handle = self
            .pinger
            .start(prober_config, events_tx)
            .map_err(|source| FailoverError::PingerStart {
                route: self.route.name(),
                source,
            })?;

        let recorder = {
            let counter = Arc::clone(&counter);
            let sink = Arc::clone(&self.sink);
            let route = self.route.clone();
            thread::Builder::new()
                .name(format!("ping-rec-{}", self.route.interface))
                .spawn(move || record_events(events_rx, &counter, sink.as_ref(), &route))
        };
        let recorder = match recorder {
            Ok(recorder) => recorder,
            Err(source) => {
                handle.stop();
                return Err(FailoverError::PingerStart {
                    route: self.route.name(),
                    source,
                });
            }
        };

        self.counter = Some(counter);
        self.probe = Some(RunningProbe { handle, recorder });
        info!("Started pinging {} from {}", self.route, self.route.source);
        Ok(())
    }

    /// Stop probing. Once this returns the counter receives no more events.
    pub fn stop_pinging(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.handle.stop();
            if probe.recorder.join().is_err() {
                warn!("Event recorder for {} panicked", self.route);
            }
            self.counter = None;
            debug!("Stopped pinging {}", self.route);
        }
    }

    /// Re-evaluate the route.
    ///
    /// Returns `Ok(true)` when the route changed state and `Ok(false)` when it
    /// did not. An error means the routing table could not be updated; the
    /// monitor keeps its previous state and tries again on the next check that
    /// still calls for the change.
    pub fn check(&mut self) -> FailoverResult<bool> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> FailoverResult<bool> {
        let Some(counter) = &self.counter else {
            return Ok(false);
        };
        let stats = counter.snapshot_at(self.config.reply_timeout, now);
        self.sink.route_reachable(&self.route, !stats.up_time.is_zero());

        let level = if self.config.dry_run {
            Level::Info
        } else {
            Level::Debug
        };
        log!(
            level,
            "{}: since last reply {:?}, down time {:?}, up time {:?}",
            self.route,
            stats.wait_time,
            stats.down_time,
            stats.up_time
        );

        if self.active && stats.down_time >= self.config.deactivate_threshold {
            warn!(
                "Gateway {} is now DOWN after {:?} of no reply",
                self.route, stats.down_time
            );
            self.deactivate()?;
            return Ok(true);
        }

        if !self.active && stats.up_time >= self.config.activate_threshold {
            warn!("Gateway {} is now UP after {:?}", self.route, stats.up_time);
            self.activate()?;
            return Ok(true);
        }

        Ok(false)
    }

    fn activate(&mut self) -> FailoverResult<()> {
        self.apply_metric(self.metric)?;

        self.active = true;
        self.mark_changed();
        Ok(())
    }

    fn deactivate(&mut self) -> FailoverResult<()> {
        self.apply_metric(self.metric.saturating_add(self.config.inactive_route_metric))?;

        self.reset_connections();
        self.active = false;
        self.mark_changed();
        Ok(())
    }

    fn mark_changed(&mut self) {
        self.last_change = Some(Local::now());
        self.sink.route_state(&self.route, self.active, self.metric);
    }

    fn apply_metric(&self, metric: u32) -> FailoverResult<()> {
        if self.config.dry_run {
            info!("Dry run: would set metric of {} to {}", self.route, metric);
            return Ok(());
        }
        self.table.replace_default_route(&self.route, metric)
    }

    fn reset_connections(&self) {
        if self.config.dry_run {
            return;
        }
        if let Err(e) = self.table.reset_connections(&self.route) {
            warn!("Failed to reset connections of {}: {}", self.route, e);
        }
    }
}

impl Drop for RouteMonitor {
    fn drop(&mut self) {
        self.stop_pinging();
    }
}

fn record_events(
    events: Receiver<ProbeEvent>,
    counter: &HealthCounter,
    sink: &dyn MetricsSink,
    route: &RouteIdentity,
) {
    let mut in_flight: HashMap<u16, Instant> = HashMap::new();
    for event in events.iter() {
        match event {
            ProbeEvent::Sent { seq, at } => {
                counter.record_request_sent_at(at);
                sink.probe_sent(route);
                if in_flight.len() >= MAX_IN_FLIGHT {
                    in_flight.retain(|_, sent| at.saturating_duration_since(*sent) < IN_FLIGHT_HORIZON);
                }
                in_flight.insert(seq, at);
            }
            ProbeEvent::Received { seq, at } => {
                counter.record_reply_sent_at(at);
                let rtt = in_flight
                    .remove(&seq)
                    .map(|sent| at.saturating_duration_since(sent));
                sink.probe_replied(route, rtt);
            }
        }
    }
}
