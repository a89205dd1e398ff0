//! Periodic lookup of the public address each route egresses from.
//!
//! This is informational only: the result is published to the metrics sink
//! and never feeds into failover decisions.

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use std::net::IpAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::errors::{FailoverError, FailoverResult};
use crate::network::RouteIdentity;
use crate::telemetry::MetricsSink;

/// Ask `url` for our public address, connecting from `source`
pub fn query_external_ip(url: &str, source: IpAddr, timeout: Duration) -> FailoverResult<IpAddr> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .local_address(source)
        .build()
        .map_err(|e| FailoverError::ExternalIp(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .map_err(|e| FailoverError::ExternalIp(e.to_string()))?;
    if !response.status().is_success() {
        return Err(FailoverError::ExternalIp(response.status().to_string()));
    }
    let body = response
        .text()
        .map_err(|e| FailoverError::ExternalIp(e.to_string()))?;
    parse_external_ip(&body)
}

/// The lookup services answer with a bare address and a trailing newline
pub fn parse_external_ip(body: &str) -> FailoverResult<IpAddr> {
    let trimmed = body.trim();
    trimmed
        .parse()
        .map_err(|_| FailoverError::ExternalIp(format!("unexpected response {:?}", trimmed)))
}

/// Background thread refreshing external addresses
pub struct ExternalIpWatcher {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ExternalIpWatcher {
    pub fn spawn(
        routes: Vec<RouteIdentity>,
        url: String,
        interval: Duration,
        timeout: Duration,
        sink: Arc<dyn MetricsSink>,
    ) -> FailoverResult<Self> {
        reqwest::Url::parse(&url)
            .map_err(|e| FailoverError::ExternalIp(format!("invalid URL {:?}: {}", url, e)))?;

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let thread = thread::Builder::new()
            .name("external-ip".to_string())
            .spawn(move || {
                let mut known: Vec<Option<String>> = vec![None; routes.len()];
                loop {
                    for (route, last) in routes.iter().zip(known.iter_mut()) {
                        match query_external_ip(&url, route.source, timeout) {
                            Ok(ip) => {
                                debug!("External IP of {} is {}", route, ip);
                                *last = Some(ip.to_string());
                            }
                            // Keep publishing the last known address
                            Err(e) => error!("Error getting external IP for {}: {}", route, e),
                        }
                        sink.external_address(route, last.as_deref());
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
            })?;

        Ok(ExternalIpWatcher {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop refreshing; waits for an in-flight lookup to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("External IP thread panicked");
            }
        }
    }
}

impl Drop for ExternalIpWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            write!(
                stream,
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            )
            .unwrap();
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn parses_trimmed_address() {
        assert_eq!(
            parse_external_ip("203.0.113.7\n").unwrap(),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
        assert!(parse_external_ip("<html>nope</html>").is_err());
    }

    #[test]
    fn queries_through_source_address() {
        let url = serve_once("200 OK", "198.51.100.23\n");
        let ip = query_external_ip(&url, "127.0.0.1".parse().unwrap(), Duration::from_secs(5)).unwrap();
        assert_eq!(ip, "198.51.100.23".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn error_status_is_reported() {
        let url = serve_once("503 Service Unavailable", "");
        let result = query_external_ip(&url, "127.0.0.1".parse().unwrap(), Duration::from_secs(5));
        assert!(matches!(result, Err(FailoverError::ExternalIp(_))));
    }
}
