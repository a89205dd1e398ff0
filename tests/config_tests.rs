use std::io::Write;
use std::time::Duration;

use gw_failover::{FailoverConfig, FailoverError};
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_full_config_file() {
    let file = write_config(
        r#"
        [routing]
        inactive_route_metric = 5000
        protocol = "gwfailover"
        dry_run = true
        ipv6 = false
        command_timeout_secs = 2

        [monitoring]
        ping_interval_ms = 250
        reply_timeout_secs = 3
        max_expected_rtt_ms = 50
        deactivate_threshold_secs = 20
        activate_threshold_secs = 90
        check_interval_ms = 500
        privileged = false

        [metrics]
        listen = "127.0.0.1:9101"
        external_ip_url = "http://ifconfig.me/ip"
        external_ip_interval_secs = 600
        external_ip_timeout_secs = 10
        "#,
    );

    let config = FailoverConfig::from_file(file.path()).unwrap();
    assert_eq!(config.inactive_route_metric, 5000);
    assert_eq!(config.route_protocol, "gwfailover");
    assert!(config.dry_run);
    assert!(!config.ipv6);
    assert_eq!(config.command_timeout, Duration::from_secs(2));
    assert_eq!(config.ping_interval, Duration::from_millis(250));
    assert_eq!(config.reply_timeout, Duration::from_secs(3));
    assert_eq!(config.max_expected_rtt, Duration::from_millis(50));
    assert_eq!(config.deactivate_threshold, Duration::from_secs(20));
    assert_eq!(config.activate_threshold, Duration::from_secs(90));
    assert_eq!(config.check_interval, Duration::from_millis(500));
    assert!(!config.privileged_ping);
    assert_eq!(config.metrics_listen, Some("127.0.0.1:9101".parse().unwrap()));
    assert_eq!(config.external_ip_url.as_deref(), Some("http://ifconfig.me/ip"));
    assert_eq!(config.external_ip_interval, Duration::from_secs(600));
    assert_eq!(config.external_ip_timeout, Duration::from_secs(10));
    assert!(config.validate().is_ok());
}

#[test]
fn test_empty_file_gives_defaults() {
    let file = write_config("");
    let config = FailoverConfig::from_file(file.path()).unwrap();
    assert_eq!(config, FailoverConfig::default());
}

#[test]
fn test_malformed_file_is_rejected() {
    let file = write_config("[monitoring\nping_interval_ms = 1");
    assert!(matches!(
        FailoverConfig::from_file(file.path()),
        Err(FailoverError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = FailoverConfig::from_file(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(FailoverError::IOError(_))));
}
