//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Default max message size for WebSocket (1 MB).
pub const DEFAULT_MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default WebSocket connections per minute per IP.
pub const DEFAULT_WS_CONNECTIONS_PER_MINUTE: u32 = 30;

/// Idle timeout for WebSocket connections (5 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Longest a single outbound WebSocket write may block.
pub const DEFAULT_WS_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Limit type used for WebSocket upgrade counters.
pub const WS_CONNECT_LIMIT: &str = "ws_connect";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to.
    pub bind_address: SocketAddr,

    /// Enable rate limiting of WebSocket upgrades and chat messages.
    pub rate_limiting: bool,

    /// Enable request logging.
    pub request_logging: bool,

    /// Maximum WebSocket message size in bytes.
    /// Messages exceeding this limit are rejected. Default: 1 MB.
    pub max_ws_message_size: usize,

    /// Maximum WebSocket connections per minute per IP address.
    /// Prevents connection flood attacks. Default: 30.
    pub ws_connections_per_minute: u32,

    /// Connections that receive no frames for this long are closed.
    pub idle_timeout: Duration,

    /// A write that does not finish within this time fails, which evicts a
    /// peer that has stopped reading.
    pub ws_write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            rate_limiting: true,
            request_logging: true,
            max_ws_message_size: DEFAULT_MAX_WS_MESSAGE_SIZE,
            ws_connections_per_minute: DEFAULT_WS_CONNECTIONS_PER_MINUTE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ws_write_timeout: DEFAULT_WS_WRITE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Create a new server config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Enable or disable rate limiting.
    pub fn with_rate_limiting(mut self, enabled: bool) -> Self {
        self.rate_limiting = enabled;
        self
    }

    /// Enable or disable request logging.
    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }

    /// Set the maximum WebSocket message size.
    pub fn with_max_ws_message_size(mut self, size: usize) -> Self {
        self.max_ws_message_size = size;
        self
    }

    /// Set the maximum WebSocket connections per minute per IP.
    pub fn with_ws_connections_per_minute(mut self, rate: u32) -> Self {
        self.ws_connections_per_minute = rate;
        self
    }

    /// Set the idle timeout for WebSocket connections.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the per-write timeout for WebSocket frames.
    pub fn with_ws_write_timeout(mut self, timeout: Duration) -> Self {
        self.ws_write_timeout = timeout;
        self
    }
}
