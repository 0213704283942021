//! Fixed-window request counters.
//!
//! A window opens with the first request for an identifier and lasts
//! `window` from that moment. The counter is incremented atomically in the
//! store, so concurrent callers can never be admitted beyond the limit.
//! Every request counts, including denied ones.
//!
//! The limiter fails open: if the store is unreachable the request is
//! allowed and a warning is logged.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::config::RateLimitDefaults;
use crate::error::Result;
use crate::store::KeyTtl;

/// Namespace for rate-limit counters.
pub const RATE_LIMIT_PREFIX: &str = "rate_limit";

/// Limit type used by [`RateLimitCache::check_ip_rate_limit`].
pub const IP_LIMIT: &str = "ip";

/// Limit type used by [`RateLimitCache::check_user_rate_limit`].
pub const USER_LIMIT: &str = "user";

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Requests counted in the current window, including this one.
    pub current_count: u64,
    /// Limit for the window.
    pub max_requests: u64,
    /// Seconds until the window resets.
    pub reset_time: u64,
}

impl RateLimitResult {
    fn fail_open(max_requests: u64, window: Duration) -> Self {
        Self {
            allowed: true,
            current_count: 0,
            max_requests,
            reset_time: window.as_secs(),
        }
    }
}

/// Current state of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub current_count: u64,
    /// Seconds until the counter expires; `None` if it has no expiry.
    pub ttl: Option<u64>,
}

/// Round up to whole seconds so a non-zero remainder never reports 0.
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Windowed counters keyed by limit type and identifier.
#[derive(Clone)]
pub struct RateLimitCache {
    store: CacheStore,
    defaults: RateLimitDefaults,
}

impl RateLimitCache {
    /// Create a limiter with the given default limits.
    pub fn new(store: CacheStore, defaults: RateLimitDefaults) -> Self {
        Self { store, defaults }
    }

    /// Limits used by the IP/user wrappers.
    pub fn defaults(&self) -> &RateLimitDefaults {
        &self.defaults
    }

    fn key(limit_type: &str, identifier: &str) -> String {
        CacheStore::generate_key(RATE_LIMIT_PREFIX, &format!("{limit_type}:{identifier}"))
    }

    /// Count one request for `identifier` and decide whether to admit it.
    ///
    /// Windows shorter than one second are treated as one second.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        limit_type: &str,
        max_requests: u64,
        window: Duration,
    ) -> RateLimitResult {
        let window = window.max(Duration::from_secs(1));
        let key = Self::key(limit_type, identifier);

        let counted = match self.store.backend().incr_window(&key, window).await {
            Ok(counted) => counted,
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit store unavailable, allowing request");
                return RateLimitResult::fail_open(max_requests, window);
            }
        };

        let allowed = counted.count <= max_requests;
        let reset_time = counted.ttl.map(ceil_secs).unwrap_or_else(|| window.as_secs());

        if !allowed {
            debug!(
                limit_type = %limit_type,
                identifier = %identifier,
                count = counted.count,
                max = max_requests,
                "Rate limit exceeded"
            );
        }

        RateLimitResult {
            allowed,
            current_count: counted.count,
            max_requests,
            reset_time,
        }
    }

    /// Check the per-IP limit.
    pub async fn check_ip_rate_limit(&self, ip_address: &str) -> RateLimitResult {
        self.check_rate_limit(
            ip_address,
            IP_LIMIT,
            self.defaults.ip_max_requests,
            self.defaults.ip_window,
        )
        .await
    }

    /// Check the per-user limit.
    pub async fn check_user_rate_limit(&self, user_id: &str) -> RateLimitResult {
        self.check_rate_limit(
            user_id,
            USER_LIMIT,
            self.defaults.user_max_requests,
            self.defaults.user_window,
        )
        .await
    }

    /// Clear the counter for `identifier`. Returns whether one existed.
    pub async fn reset_rate_limit(&self, identifier: &str, limit_type: &str) -> Result<bool> {
        self.store.delete(&Self::key(limit_type, identifier)).await
    }

    /// Inspect a counter without incrementing it.
    pub async fn get_rate_limit_info(
        &self,
        identifier: &str,
        limit_type: &str,
    ) -> Result<Option<RateLimitInfo>> {
        let key = Self::key(limit_type, identifier);
        let backend = self.store.backend();

        let Some(raw) = backend.get(&key).await? else {
            return Ok(None);
        };
        let current_count = raw.parse::<u64>().unwrap_or_else(|_| {
            warn!(key = %key, value = %raw, "Non-numeric rate limit counter");
            0
        });
        let ttl = match backend.ttl(&key).await? {
            KeyTtl::Expires(remaining) => Some(ceil_secs(remaining)),
            _ => None,
        };

        Ok(Some(RateLimitInfo { current_count, ttl }))
    }

    /// Delete counters left without an expiry.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let backend = self.store.backend();
        let pattern = CacheStore::generate_key(RATE_LIMIT_PREFIX, "*");
        let mut removed = 0;

        for key in backend.keys(&pattern).await? {
            if backend.ttl(&key).await?.is_stale() && backend.delete(&key).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(count = removed, "Swept stale rate limit counters");
        }
        Ok(removed)
    }

    /// Liveness probe used by health checks.
    pub async fn probe(&self) -> bool {
        self.get_rate_limit_info("__health_probe__", "probe")
            .await
            .is_ok()
    }
}
