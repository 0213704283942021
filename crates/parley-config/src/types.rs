//! Configuration types.
//!
//! Every section is optional in a file; missing sections and fields fall
//! back to the defaults in [`defaults`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Built-in default values.
pub mod defaults {
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_BIND: &str = "127.0.0.1";
    pub const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;
    pub const WS_CONNECTIONS_PER_MINUTE: u32 = 30;
    pub const IDLE_TIMEOUT_SECS: u64 = 5 * 60;
    pub const WS_WRITE_TIMEOUT_SECS: u64 = 10;

    pub const SESSION_TTL_SECS: u64 = 24 * 60 * 60;
    pub const CLEANUP_INTERVAL_SECS: u64 = 5 * 60;
    pub const MAX_CLEANUP_BACKOFF_SECS: u64 = 60 * 60;
    pub const AGENT_RESPONSE_TTL_SECS: u64 = 60 * 60;
    pub const PRODUCT_INFO_TTL_SECS: u64 = 30 * 60;
    pub const SEARCH_RESULT_TTL_SECS: u64 = 15 * 60;
    pub const EMBEDDING_TTL_SECS: u64 = 24 * 60 * 60;

    pub const IP_MAX_REQUESTS: u64 = 60;
    pub const IP_WINDOW_SECS: u64 = 60;
    pub const USER_MAX_REQUESTS: u64 = 1000;
    pub const USER_WINDOW_SECS: u64 = 60 * 60;
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParleyConfig {
    /// HTTP/WebSocket server.
    pub server: Option<ServerConfig>,

    /// Backing key/value store.
    pub store: Option<StoreConfig>,

    /// Cache lifetimes and cleanup.
    pub cache: Option<CacheConfig>,

    /// Rate limit defaults.
    pub rate_limit: Option<RateLimitConfig>,
}

impl ParleyConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: ParleyConfig) {
        if other.server.is_some() {
            self.server = other.server;
        }
        if other.store.is_some() {
            self.store = other.store;
        }
        if other.cache.is_some() {
            self.cache = other.cache;
        }
        if other.rate_limit.is_some() {
            self.rate_limit = other.rate_limit;
        }
    }

    /// Server section, or defaults.
    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    /// Store section, or defaults.
    pub fn store(&self) -> StoreConfig {
        self.store.clone().unwrap_or_default()
    }

    /// Cache section, or defaults.
    pub fn cache(&self) -> CacheConfig {
        self.cache.clone().unwrap_or_default()
    }

    /// Rate limit section, or defaults.
    pub fn rate_limit(&self) -> RateLimitConfig {
        self.rate_limit.clone().unwrap_or_default()
    }

    /// Fill every missing section with its defaults.
    pub fn resolved(&self) -> Self {
        Self {
            server: Some(self.server()),
            store: Some(self.store()),
            cache: Some(self.cache()),
            rate_limit: Some(self.rate_limit()),
        }
    }

    /// Check values that deserialize fine but cannot run.
    pub fn validate(&self) -> Result<()> {
        let store = self.store();
        if store.backend == StoreBackend::Redis && store.url.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingField {
                field: "url".to_string(),
                context: "[store] with backend = \"redis\"".to_string(),
            });
        }

        let cache = self.cache();
        non_zero("cache.session_ttl_secs", cache.session_ttl_secs)?;
        non_zero("cache.cleanup_interval_secs", cache.cleanup_interval_secs)?;

        let limits = self.rate_limit();
        non_zero("rate_limit.ip_window_secs", limits.ip_window_secs)?;
        non_zero("rate_limit.user_window_secs", limits.user_window_secs)?;

        let server = self.server();
        non_zero("server.ws_write_timeout_secs", server.ws_write_timeout_secs)?;
        if server.ws_connections_per_minute == 0 {
            return Err(invalid("server.ws_connections_per_minute", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn non_zero(field: &str, secs: u64) -> Result<()> {
    if secs == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind to.
    pub bind: String,
    /// Enable connection and chat rate limiting.
    pub rate_limiting: bool,
    /// Enable request logging.
    pub request_logging: bool,
    /// Largest accepted WebSocket message in bytes.
    pub max_ws_message_size: usize,
    /// WebSocket upgrades allowed per IP per minute.
    pub ws_connections_per_minute: u32,
    /// Seconds without an inbound frame before a connection is closed.
    pub idle_timeout_secs: u64,
    /// Seconds a single outbound frame may take before the peer is dropped.
    pub ws_write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::DEFAULT_PORT,
            bind: defaults::DEFAULT_BIND.to_string(),
            rate_limiting: true,
            request_logging: true,
            max_ws_message_size: defaults::MAX_WS_MESSAGE_SIZE,
            ws_connections_per_minute: defaults::WS_CONNECTIONS_PER_MINUTE,
            idle_timeout_secs: defaults::IDLE_TIMEOUT_SECS,
            ws_write_timeout_secs: defaults::WS_WRITE_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ws_write_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_write_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Which key/value store backs the caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store. State is lost on restart.
    #[default]
    Memory,
    /// Redis server at `url`.
    Redis,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Redis => write!(f, "redis"),
        }
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Cache lifetimes and cleanup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Sliding session lifetime.
    pub session_ttl_secs: u64,
    /// Run the background cleanup task.
    pub cleanup_enabled: bool,
    pub cleanup_interval_secs: u64,
    /// Longest delay between cleanup attempts while the store is failing.
    pub max_cleanup_backoff_secs: u64,
    pub agent_response_ttl_secs: u64,
    pub product_info_ttl_secs: u64,
    pub search_result_ttl_secs: u64,
    pub embedding_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: defaults::SESSION_TTL_SECS,
            cleanup_enabled: true,
            cleanup_interval_secs: defaults::CLEANUP_INTERVAL_SECS,
            max_cleanup_backoff_secs: defaults::MAX_CLEANUP_BACKOFF_SECS,
            agent_response_ttl_secs: defaults::AGENT_RESPONSE_TTL_SECS,
            product_info_ttl_secs: defaults::PRODUCT_INFO_TTL_SECS,
            search_result_ttl_secs: defaults::SEARCH_RESULT_TTL_SECS,
            embedding_ttl_secs: defaults::EMBEDDING_TTL_SECS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rate limits
// ─────────────────────────────────────────────────────────────────────────────

/// Default limits for IP- and user-scoped checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub ip_max_requests: u64,
    pub ip_window_secs: u64,
    pub user_max_requests: u64,
    pub user_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip_max_requests: defaults::IP_MAX_REQUESTS,
            ip_window_secs: defaults::IP_WINDOW_SECS,
            user_max_requests: defaults::USER_MAX_REQUESTS,
            user_window_secs: defaults::USER_WINDOW_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ParleyConfig::from_toml("").unwrap();
        assert_eq!(config, ParleyConfig::new());
        assert_eq!(config.server().port, defaults::DEFAULT_PORT);
        assert_eq!(config.store().backend, StoreBackend::Memory);
        assert_eq!(config.cache().session_ttl_secs, 86_400);
        assert_eq!(config.rate_limit().ip_max_requests, 60);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_section_keeps_field_defaults() {
        let config = ParleyConfig::from_toml(
            r#"
[server]
port = 9000

[cache]
session_ttl_secs = 600
"#,
        )
        .unwrap();

        let server = config.server();
        assert_eq!(server.port, 9000);
        assert_eq!(server.bind, "127.0.0.1");
        assert_eq!(server.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.cache().session_ttl_secs, 600);
        assert!(config.cache().cleanup_enabled);
    }

    #[test]
    fn test_merge_replaces_present_sections() {
        let mut base = ParleyConfig::from_toml(
            r#"
[server]
port = 8080

[rate_limit]
ip_max_requests = 5
"#,
        )
        .unwrap();
        let overlay = ParleyConfig::from_toml(
            r#"
[server]
port = 3000
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.server().port, 3000);
        assert_eq!(base.rate_limit().ip_max_requests, 5);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ParleyConfig::new().resolved();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[server]"));
        assert!(text.contains("backend = \"memory\""));
        assert_eq!(ParleyConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_redis_requires_url() {
        let config = ParleyConfig::from_toml("[store]\nbackend = \"redis\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { ref field, .. } if field == "url"));

        let config = ParleyConfig::from_toml(
            "[store]\nbackend = \"redis\"\nurl = \"redis://127.0.0.1:6379\"\n",
        )
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_window_is_invalid() {
        let config = ParleyConfig::from_toml("[rate_limit]\nuser_window_secs = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limit.user_window_secs"));
    }

    #[test]
    fn test_zero_write_timeout_is_invalid() {
        let config = ParleyConfig::from_toml("[server]\nws_write_timeout_secs = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.ws_write_timeout_secs"));
    }

    #[test]
    fn test_unknown_backend_fails_to_parse() {
        let err = ParleyConfig::from_toml("[store]\nbackend = \"etcd\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
