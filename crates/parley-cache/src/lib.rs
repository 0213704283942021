//! Namespaced TTL caching for the Parley chat layer.
//!
//! This crate provides the state layer behind realtime chat delivery:
//! - A backing-store abstraction ([`KvStore`]) with in-memory and Redis
//!   implementations
//! - Sessions with sliding expiration and a per-user index
//! - Hash-keyed performance caches with per-purpose TTLs
//! - Atomic fixed-window rate limiting
//! - A service that composes the above and runs a cancellable cleanup task
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use parley_cache::{CacheConfig, CacheService, ClientInfo, MemoryStore};
//!
//! let service = Arc::new(CacheService::new(
//!     Arc::new(MemoryStore::new()),
//!     CacheConfig::default(),
//! ));
//! service.initialize().await?;
//!
//! let session_id = service.sessions().create(Some("user-1"), ClientInfo::default()).await?;
//! ```

mod cache;
mod config;
mod error;
mod performance;
mod ratelimit;
mod service;
mod session;
pub mod store;

pub use cache::{CacheEntry, CacheStore, duration_secs};
pub use config::{
    CacheConfig, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_CLEANUP_BACKOFF, DEFAULT_SESSION_TTL,
    PerformanceTtls, RateLimitDefaults,
};
pub use error::{Error, Result};
pub use performance::{
    AGENT_RESPONSE_PREFIX, CachedResponse, EMBEDDING_PREFIX, PRODUCT_INFO_PREFIX,
    PerformanceCache, PerformanceStats, SEARCH_RESULT_PREFIX, TtlCache, content_hash,
};
pub use ratelimit::{
    IP_LIMIT, RATE_LIMIT_PREFIX, RateLimitCache, RateLimitInfo, RateLimitResult, USER_LIMIT,
};
pub use service::{
    CacheService, CacheServiceStats, CleanupStats, HealthReport, HealthStatus, SweepReport,
};
pub use session::{
    ClientInfo, MessageRole, SESSION_PREFIX, Session, SessionCache, SessionMessage,
    USER_SESSIONS_PREFIX,
};
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use store::{KeyTtl, KvStore, MemoryStore, WindowCount};
