//! Daemon configuration.
//!
//! Values come from three layers with decreasing precedence: command line
//! flags (applied by the binary), the TOML file, and the built-in defaults
//! below. Every key in the file is optional.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::errors::{FailoverError, FailoverResult};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gw-failover/config.toml";

/// Runtime configuration for the failover daemon
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverConfig {
    /// Penalty added to the metric of a route that is not allowed to carry traffic
    pub inactive_route_metric: u32,

    /// How long a gateway must stay silent before its route is demoted
    pub deactivate_threshold: Duration,

    /// How long a gateway must keep replying before its route is promoted again
    pub activate_threshold: Duration,

    /// Interval between echo requests sent to each gateway
    pub ping_interval: Duration,

    /// How long an outstanding echo request may wait for its reply
    pub reply_timeout: Duration,

    /// Latency tolerance added to every reply timeout comparison
    pub max_expected_rtt: Duration,

    /// Interval of the supervisory check loop
    pub check_interval: Duration,

    /// Run the state machine without touching the routing table
    pub dry_run: bool,

    /// Also manage IPv6 default routes
    pub ipv6: bool,

    /// Routing protocol tag of the routes this daemon owns
    pub route_protocol: String,

    /// Use raw ICMP sockets instead of kernel ping sockets
    pub privileged_ping: bool,

    /// Upper bound for a single `ip`/`ss` invocation
    pub command_timeout: Duration,

    /// Address for the Prometheus exporter, disabled when unset
    pub metrics_listen: Option<SocketAddr>,

    /// URL answering with the caller's public address, disabled when unset
    pub external_ip_url: Option<String>,

    /// How often external addresses are refreshed
    pub external_ip_interval: Duration,

    /// Timeout for a single external address lookup
    pub external_ip_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        FailoverConfig {
            inactive_route_metric: 10000,
            deactivate_threshold: Duration::from_secs(30),
            activate_threshold: Duration::from_secs(120),
            ping_interval: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(5),
            max_expected_rtt: Duration::from_millis(100),
            check_interval: Duration::from_secs(1),
            dry_run: false,
            ipv6: true,
            route_protocol: "static".to_string(),
            privileged_ping: true,
            command_timeout: Duration::from_secs(5),
            metrics_listen: None,
            external_ip_url: Some("http://icanhazip.com/".to_string()),
            external_ip_interval: Duration::from_secs(300),
            external_ip_timeout: Duration::from_secs(5),
        }
    }
}

/// Layout of the TOML configuration file
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub routing: Option<RoutingSection>,
    pub monitoring: Option<MonitoringSection>,
    pub metrics: Option<MetricsSection>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RoutingSection {
    pub inactive_route_metric: Option<u32>,
    pub protocol: Option<String>,
    pub dry_run: Option<bool>,
    pub ipv6: Option<bool>,
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct MonitoringSection {
    pub ping_interval_ms: Option<u64>,
    pub reply_timeout_secs: Option<u64>,
    pub max_expected_rtt_ms: Option<u64>,
    pub deactivate_threshold_secs: Option<u64>,
    pub activate_threshold_secs: Option<u64>,
    pub check_interval_ms: Option<u64>,
    pub privileged: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
    pub listen: Option<SocketAddr>,
    pub external_ip_url: Option<String>,
    pub external_ip_interval_secs: Option<u64>,
    pub external_ip_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Parse a configuration file from its TOML text
    pub fn parse(content: &str) -> FailoverResult<Self> {
        toml::from_str(content).map_err(|e| FailoverError::InvalidConfiguration(e.to_string()))
    }

    /// Read and parse a configuration file
    pub fn load(path: &Path) -> FailoverResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }
}

impl FailoverConfig {
    /// Defaults overlaid with the values of a configuration file
    pub fn from_file(path: &Path) -> FailoverResult<Self> {
        let mut config = FailoverConfig::default();
        config.apply_file(FileConfig::load(path)?);
        Ok(config)
    }

    /// Overlay every value present in `file`
    pub fn apply_file(&mut self, file: FileConfig) {
        if let Some(routing) = file.routing {
            if let Some(metric) = routing.inactive_route_metric {
                self.inactive_route_metric = metric;
            }
            if let Some(protocol) = routing.protocol {
                self.route_protocol = protocol;
            }
            if let Some(dry_run) = routing.dry_run {
                self.dry_run = dry_run;
            }
            if let Some(ipv6) = routing.ipv6 {
                self.ipv6 = ipv6;
            }
            if let Some(secs) = routing.command_timeout_secs {
                self.command_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(monitoring) = file.monitoring {
            if let Some(ms) = monitoring.ping_interval_ms {
                self.ping_interval = Duration::from_millis(ms);
            }
            if let Some(secs) = monitoring.reply_timeout_secs {
                self.reply_timeout = Duration::from_secs(secs);
            }
            if let Some(ms) = monitoring.max_expected_rtt_ms {
                self.max_expected_rtt = Duration::from_millis(ms);
            }
            if let Some(secs) = monitoring.deactivate_threshold_secs {
                self.deactivate_threshold = Duration::from_secs(secs);
            }
            if let Some(secs) = monitoring.activate_threshold_secs {
                self.activate_threshold = Duration::from_secs(secs);
            }
            if let Some(ms) = monitoring.check_interval_ms {
                self.check_interval = Duration::from_millis(ms);
            }
            if let Some(privileged) = monitoring.privileged {
                self.privileged_ping = privileged;
            }
        }

        if let Some(metrics) = file.metrics {
            if let Some(listen) = metrics.listen {
                self.metrics_listen = Some(listen);
            }
            if let Some(url) = metrics.external_ip_url {
                // An empty URL switches the lookup off
                self.external_ip_url = if url.trim().is_empty() { None } else { Some(url) };
            }
            if let Some(secs) = metrics.external_ip_interval_secs {
                self.external_ip_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = metrics.external_ip_timeout_secs {
                self.external_ip_timeout = Duration::from_secs(secs);
            }
        }
    }

    /// Reject combinations the state machine cannot work with
    pub fn validate(&self) -> FailoverResult<()> {
        let non_zero = [
            ("ping interval", self.ping_interval),
            ("reply timeout", self.reply_timeout),
            ("check interval", self.check_interval),
            ("deactivate threshold", self.deactivate_threshold),
            ("activate threshold", self.activate_threshold),
            ("command timeout", self.command_timeout),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(FailoverError::InvalidConfiguration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.inactive_route_metric == 0 {
            return Err(FailoverError::InvalidConfiguration(
                "inactive route metric must be greater than zero".to_string(),
            ));
        }

        if self.deactivate_threshold <= self.reply_timeout {
            return Err(FailoverError::InvalidConfiguration(format!(
                "deactivate threshold ({:?}) must exceed reply timeout ({:?})",
                self.deactivate_threshold, self.reply_timeout
            )));
        }

        if self.activate_threshold <= self.reply_timeout {
            return Err(FailoverError::InvalidConfiguration(format!(
                "activate threshold ({:?}) must exceed reply timeout ({:?})",
                self.activate_threshold, self.reply_timeout
            )));
        }

        if self.route_protocol.trim().is_empty() {
            return Err(FailoverError::InvalidConfiguration(
                "route protocol must not be empty".to_string(),
            ));
        }

        if self.external_ip_url.is_some() && self.external_ip_interval.is_zero() {
            return Err(FailoverError::InvalidConfiguration(
                "external IP interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FailoverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.inactive_route_metric, 10000);
        assert!(config.activate_threshold > config.deactivate_threshold);
    }

    #[test]
    fn partial_file_only_overrides_present_keys() {
        let file = FileConfig::parse(
            r#"
            [monitoring]
            deactivate_threshold_secs = 10
            ping_interval_ms = 500
            "#,
        )
        .unwrap();

        let mut config = FailoverConfig::default();
        config.apply_file(file);

        assert_eq!(config.deactivate_threshold, Duration::from_secs(10));
        assert_eq!(config.ping_interval, Duration::from_millis(500));
        assert_eq!(config.activate_threshold, Duration::from_secs(120));
        assert_eq!(config.route_protocol, "static");
    }

    #[test]
    fn empty_external_url_disables_lookup() {
        let file = FileConfig::parse("[metrics]\nexternal_ip_url = \"\"\n").unwrap();
        let mut config = FailoverConfig::default();
        config.apply_file(file);
        assert_eq!(config.external_ip_url, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = FileConfig::parse("[routing]\nmetric_penalty = 5\n");
        assert!(matches!(result, Err(FailoverError::InvalidConfiguration(_))));
    }

    #[test]
    fn threshold_below_reply_timeout_is_invalid() {
        let config = FailoverConfig {
            deactivate_threshold: Duration::from_secs(3),
            ..FailoverConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_interval_is_invalid() {
        let config = FailoverConfig {
            ping_interval: Duration::ZERO,
            ..FailoverConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
