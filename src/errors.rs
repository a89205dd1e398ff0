use thiserror::Error;

/// Errors that can occur in the gateway failover system
#[derive(Error, Debug)]
pub enum FailoverError {
    /// The daemon is not running with administrative privileges
    #[error("Insufficient permissions (try running as root)")]
    InsufficientPermissions,

    /// Command execution failed
    #[error("Failed to execute command: {0}")]
    CommandExecution(String),

    /// Route modification failed
    #[error("Route modification failed: {0}")]
    RouteModificationFailed(String),

    /// A default route uses a topology we cannot manage (multipath, no gateway, ...)
    #[error("Unsupported default route: {0}")]
    UnsupportedRoute(String),

    /// No local address could be found to probe the gateway from
    #[error("No usable source address found for {0}")]
    NoSourceAddress(String),

    /// Discovery found nothing to fail over between
    #[error("No usable default routes found")]
    NoUsableRoutes,

    /// The ICMP prober for a route could not be started
    #[error("Failed to start pinging {route}: {source}")]
    PingerStart {
        route: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Command output could not be parsed
    #[error("Failed to parse command output: {0}")]
    Parse(#[from] serde_json::Error),

    /// External address lookup failed
    #[error("External IP lookup failed: {0}")]
    ExternalIp(String),

    /// Metrics exporter could not be installed
    #[error("Metrics exporter failed: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    /// Unknown error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Shorthand result type for failover operations
pub type FailoverResult<T> = Result<T, FailoverError>;

/// Convert anyhow errors to FailoverError
impl From<anyhow::Error> for FailoverError {
    fn from(err: anyhow::Error) -> Self {
        FailoverError::Unknown(err.to_string())
    }
}
