//! Service configuration

use std::time::Duration;

/// Proxy service configuration
///
/// All knobs of the proxy core. The host application constructs this struct
/// directly, there is no configuration file.
#[derive(Clone, Debug)]
pub struct Config {
    /// TCP listening port, bound on `0.0.0.0`. Port `0` picks an ephemeral port.
    pub port: u16,
    /// Maximum simultaneously served client connections
    pub max_concurrent_connections: usize,
    /// Deadline for upstream TCP connects
    pub connect_timeout: Duration,
    /// Read/write idle deadline for HTTP client connections
    pub idle_timeout: Duration,
    /// Capacity of the recent-error ring surfaced to the observer
    pub max_recent_errors: usize,
    /// Idle deadline for UDP relay sessions
    pub udp_relay_timeout: Duration,
    /// Per-session cap on distinct outbound UDP target sockets
    pub max_udp_outbound_channels: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 8080,
            max_concurrent_connections: 64,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_recent_errors: 32,
            udp_relay_timeout: Duration::from_secs(300),
            max_udp_outbound_channels: 32,
        }
    }
}
