//! Access to the kernel routing table through iproute2.
//!
//! Everything the daemon reads from or writes to the OS goes through the
//! [`RouteTable`] trait so the decision logic can be exercised without root.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::net::IpAddr;
use std::process::{Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::errors::{FailoverError, FailoverResult};

/// How often a running command is checked for exit
const COMMAND_POLL: Duration = Duration::from_millis(10);

/// IP version of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// The iproute2 family switch
    fn flag(self) -> &'static str {
        match self {
            AddressFamily::V4 => "-4",
            AddressFamily::V6 => "-6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// A default route as the kernel reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    pub family: AddressFamily,
    pub interface: Option<String>,
    pub gateway: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub metric: u32,
    pub protocol: String,
    pub multipath: bool,
}

/// An address configured on an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
    pub scope: String,
}

impl InterfaceAddress {
    /// Whether `ip` lies in this address's subnet
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX
                    .checked_shl(32u32.saturating_sub(u32::from(self.prefix_len)))
                    .unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128u32.saturating_sub(u32::from(self.prefix_len)))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }

    pub fn is_global(&self) -> bool {
        self.scope == "global"
    }

    pub fn is_link(&self) -> bool {
        self.scope == "link"
    }
}

/// The fixed identity of a monitored default route
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RouteIdentity {
    pub family: AddressFamily,
    pub interface: String,
    pub gateway: IpAddr,
    pub source: IpAddr,
}

impl RouteIdentity {
    pub fn name(&self) -> String {
        format!("{}@{}", self.gateway, self.interface)
    }
}

impl fmt::Display for RouteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.gateway, self.interface)
    }
}

/// Read and write access to the kernel's default routes
#[cfg_attr(test, mockall::automock)]
pub trait RouteTable: Send + Sync {
    /// All routes whose destination is the default route for `family`
    fn list_default_routes(&self, family: AddressFamily) -> FailoverResult<Vec<KernelRoute>>;

    /// Addresses configured on `interface`
    fn interface_addresses(&self, interface: &str) -> FailoverResult<Vec<InterfaceAddress>>;

    /// Re-install the default route via `route` with `metric`.
    ///
    /// A failure to remove the old entry is tolerated; a failure to add the
    /// new one is returned.
    fn replace_default_route(&self, route: &RouteIdentity, metric: u32) -> FailoverResult<()>;

    /// Drop established connections bound to the route's source address
    fn reset_connections(&self, route: &RouteIdentity) -> FailoverResult<()>;
}

/// [`RouteTable`] implemented with the `ip` and `ss` commands
#[derive(Debug, Clone)]
pub struct IpRouteTable {
    protocol: String,
    timeout: Duration,
}

impl IpRouteTable {
    /// Routes are written with `proto <protocol>`; every command is killed after `timeout`
    pub fn new(protocol: impl Into<String>, timeout: Duration) -> Self {
        IpRouteTable {
            protocol: protocol.into(),
            timeout,
        }
    }

    fn run(&self, program: &str, args: &[String]) -> FailoverResult<Output> {
        debug!("Executing command: {} {}", program, args.join(" "));
        run_with_timeout(Command::new(program).args(args), self.timeout)
    }

    fn run_checked(&self, program: &str, args: &[String]) -> FailoverResult<Output> {
        let output = self.run(program, args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FailoverError::CommandExecution(format!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }

    fn route_args(&self, action: &str, route: &RouteIdentity, metric: Option<u32>) -> Vec<String> {
        let mut args = vec![
            route.family.flag().to_string(),
            "route".to_string(),
            action.to_string(),
            "default".to_string(),
            "via".to_string(),
            route.gateway.to_string(),
            "dev".to_string(),
            route.interface.clone(),
        ];
        if let Some(metric) = metric {
            args.push("metric".to_string());
            args.push(metric.to_string());
        }
        args.push("proto".to_string());
        args.push(self.protocol.clone());
        args
    }
}

impl RouteTable for IpRouteTable {
    fn list_default_routes(&self, family: AddressFamily) -> FailoverResult<Vec<KernelRoute>> {
        let args = vec![
            "-j".to_string(),
            family.flag().to_string(),
            "route".to_string(),
            "list".to_string(),
        ];
        let output = self.run_checked("ip", &args)?;
        parse_default_routes(family, &String::from_utf8_lossy(&output.stdout))
    }

    fn interface_addresses(&self, interface: &str) -> FailoverResult<Vec<InterfaceAddress>> {
        let args = vec![
            "-j".to_string(),
            "addr".to_string(),
            "show".to_string(),
            "dev".to_string(),
            interface.to_string(),
        ];
        let output = self.run_checked("ip", &args)?;
        parse_interface_addresses(&String::from_utf8_lossy(&output.stdout))
    }

    fn replace_default_route(&self, route: &RouteIdentity, metric: u32) -> FailoverResult<()> {
        // The old entry may already be gone; adding is what matters
        if let Err(e) = self.run_checked("ip", &self.route_args("delete", route, None)) {
            warn!("Failed to delete default route {}: {}", route, e);
        }

        self.run_checked("ip", &self.route_args("add", route, Some(metric)))
            .map_err(|e| FailoverError::RouteModificationFailed(format!("{}: {}", route, e)))?;

        info!("Default route {} now has metric {}", route, metric);
        Ok(())
    }

    fn reset_connections(&self, route: &RouteIdentity) -> FailoverResult<()> {
        let args = vec!["-K".to_string(), "src".to_string(), route.source.to_string()];
        self.run_checked("ss", &args)?;
        debug!("Reset connections from {}", route.source);
        Ok(())
    }
}

/// Run a command, killing it if it has not finished within `timeout`
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> FailoverResult<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| FailoverError::CommandExecution(format!("{:?}: {}", command, e)))?;

    // Drain both pipes so a chatty command cannot block on a full buffer
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now().checked_add(timeout);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            // Not reaped yet, so the handle still refers to our child
            if let Err(e) = child.kill() {
                warn!("Failed to kill {:?}: {}", command, e);
            }
            let _ = child.wait();
            return Err(FailoverError::CommandExecution(format!(
                "{:?} timed out after {:?}",
                command, timeout
            )));
        }
        thread::sleep(COMMAND_POLL);
    };

    Ok(Output {
        status,
        stdout: collect(stdout)?,
        stderr: collect(stderr)?,
    })
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn collect(reader: Option<JoinHandle<io::Result<Vec<u8>>>>) -> FailoverResult<Vec<u8>> {
    match reader {
        Some(reader) => reader
            .join()
            .map_err(|_| FailoverError::Unknown("pipe reader panicked".to_string()))?
            .map_err(FailoverError::from),
        None => Ok(Vec::new()),
    }
}

/// Fail unless the process runs with an effective uid of 0
pub fn ensure_privileged() -> FailoverResult<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(FailoverError::InsufficientPermissions);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct IpRouteEntry {
    dst: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    gateway: Option<String>,
    dev: Option<String>,
    prefsrc: Option<String>,
    #[serde(default)]
    metric: u32,
    protocol: Option<String>,
    nexthops: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: Option<String>,
    prefixlen: Option<u8>,
    #[serde(default)]
    scope: String,
}

fn parse_ip(value: &str, what: &str) -> FailoverResult<IpAddr> {
    value
        .parse()
        .map_err(|_| FailoverError::UnsupportedRoute(format!("invalid {} {:?}", what, value)))
}

/// Parse the default routes out of `ip -j route list` output
pub fn parse_default_routes(family: AddressFamily, json: &str) -> FailoverResult<Vec<KernelRoute>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<IpRouteEntry> = serde_json::from_str(json)?;

    let mut routes = Vec::new();
    for entry in entries {
        if entry.dst != "default" {
            continue;
        }
        // unreachable/blackhole/prohibit defaults carry no gateway to probe
        if matches!(entry.kind.as_deref(), Some(kind) if kind != "unicast") {
            debug!("Skipping {} default route of type {:?}", family, entry.kind);
            continue;
        }
        routes.push(KernelRoute {
            family,
            interface: entry.dev,
            gateway: entry.gateway.as_deref().map(|g| parse_ip(g, "gateway")).transpose()?,
            source: entry.prefsrc.as_deref().map(|s| parse_ip(s, "source")).transpose()?,
            metric: entry.metric,
            // iproute2 leaves out the default "boot" protocol
            protocol: entry.protocol.unwrap_or_else(|| "boot".to_string()),
            multipath: entry.nexthops.map_or(false, |hops| !hops.is_empty()),
        });
    }
    Ok(routes)
}

/// Parse `ip -j addr show` output into a flat address list
pub fn parse_interface_addresses(json: &str) -> FailoverResult<Vec<InterfaceAddress>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<IpAddrEntry> = serde_json::from_str(json)?;

    let addresses = entries
        .into_iter()
        .flat_map(|entry| entry.addr_info)
        .filter_map(|info| {
            let address = info.local?.parse().ok()?;
            Some(InterfaceAddress {
                address,
                prefix_len: info.prefixlen?,
                scope: info.scope,
            })
        })
        .collect();
    Ok(addresses)
}
