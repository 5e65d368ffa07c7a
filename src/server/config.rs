//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default Control API port
pub const DEFAULT_PORT: u16 = 9095;

/// Control server configuration options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Idle timeout (disconnect if no request received)
    pub idle_timeout: Duration,

    /// Longest accepted request line in bytes
    pub max_line_length: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Run the liveness monitor alongside the server
    pub liveness_enabled: bool,

    /// Run the periodic subscription reconcile sweep
    pub reconcile_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: 0, // Unlimited
            idle_timeout: Duration::from_secs(300),
            max_line_length: 1024 * 1024, // 1MB
            tcp_nodelay: true,
            liveness_enabled: true,
            reconcile_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the request line limit
    pub fn max_line_length(mut self, bytes: usize) -> Self {
        self.max_line_length = bytes.max(64);
        self
    }

    /// Do not run the liveness monitor
    pub fn disable_liveness(mut self) -> Self {
        self.liveness_enabled = false;
        self
    }

    /// Do not run the reconcile sweep
    pub fn disable_reconcile(mut self) -> Self {
        self.reconcile_enabled = false;
        self
    }
}
