//! Configuration for the cache layer.

use std::time::Duration;

/// Default lifetime of a session document (24 hours).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval between background cleanup passes (5 minutes).
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound for the cleanup back-off after repeated failures (1 hour).
pub const DEFAULT_MAX_CLEANUP_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Per-purpose TTLs for the performance caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformanceTtls {
    /// Computed conversation-engine responses.
    pub agent_response: Duration,
    /// Item (product) information.
    pub product_info: Duration,
    /// Search results.
    pub search_result: Duration,
    /// Embedding vectors.
    pub embedding: Duration,
}

impl Default for PerformanceTtls {
    fn default() -> Self {
        Self {
            agent_response: Duration::from_secs(60 * 60),
            product_info: Duration::from_secs(30 * 60),
            search_result: Duration::from_secs(15 * 60),
            embedding: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Fixed limits used by the IP- and user-scoped rate limit wrappers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDefaults {
    /// Requests allowed per IP address within `ip_window`.
    pub ip_max_requests: u64,
    /// Window length for IP-scoped limits.
    pub ip_window: Duration,
    /// Requests allowed per user within `user_window`.
    pub user_max_requests: u64,
    /// Window length for user-scoped limits.
    pub user_window: Duration,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            ip_max_requests: 60,
            ip_window: Duration::from_secs(60),
            user_max_requests: 1000,
            user_window: Duration::from_secs(60 * 60),
        }
    }
}

/// Configuration for the cache service.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Sliding lifetime of session documents.
    pub session_ttl: Duration,

    /// TTLs for the performance sub-caches.
    pub performance: PerformanceTtls,

    /// Limits for the convenience rate-limit wrappers.
    pub rate_limits: RateLimitDefaults,

    /// Whether to run the periodic cleanup task.
    /// If false, expired entries are only reconciled by explicit calls.
    pub enable_cleanup_task: bool,

    /// Interval for the cleanup task (if enabled).
    pub cleanup_interval: Duration,

    /// Maximum delay between cleanup passes while the store keeps failing.
    pub max_cleanup_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            performance: PerformanceTtls::default(),
            rate_limits: RateLimitDefaults::default(),
            enable_cleanup_task: true,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            max_cleanup_backoff: DEFAULT_MAX_CLEANUP_BACKOFF,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session TTL.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Set the performance cache TTLs.
    pub fn with_performance_ttls(mut self, ttls: PerformanceTtls) -> Self {
        self.performance = ttls;
        self
    }

    /// Set the default rate limits.
    pub fn with_rate_limits(mut self, limits: RateLimitDefaults) -> Self {
        self.rate_limits = limits;
        self
    }

    /// Enable or disable the background cleanup task.
    pub fn with_cleanup_task(mut self, enabled: bool) -> Self {
        self.enable_cleanup_task = enabled;
        self
    }

    /// Set the cleanup interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the maximum cleanup back-off.
    pub fn with_max_cleanup_backoff(mut self, backoff: Duration) -> Self {
        self.max_cleanup_backoff = backoff;
        self
    }
}
