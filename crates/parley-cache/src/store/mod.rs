//! Backing key/value store abstraction.
//!
//! Every cache in this crate talks to storage through [`KvStore`], which
//! models the small subset of a TTL-capable key/value server the caches rely
//! on: string get/set with expiry, atomic counters, sets and key enumeration.
//! [`MemoryStore`] is the in-process implementation; `RedisStore` (behind the
//! `redis` feature) maps the same calls onto a Redis server.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or has already expired).
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Whether a reconciliation pass should delete this key.
    ///
    /// Keys the caches write always carry an expiry, so a persistent key or one
    /// whose remaining lifetime is zero is treated as expired.
    pub fn is_stale(&self) -> bool {
        match self {
            KeyTtl::Missing => false,
            KeyTtl::Persistent => true,
            KeyTtl::Expires(remaining) => remaining.is_zero(),
        }
    }
}

/// Result of an atomic windowed increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment.
    pub count: u64,
    /// Remaining lifetime of the counter, if it has one.
    pub ttl: Option<Duration>,
}

/// Contract of the external TTL-capable key/value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Short backend name used in health reports.
    fn backend(&self) -> &'static str;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read many string values in one round trip. Output order matches `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Store a string value without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Store a string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Inspect the remaining lifetime of a key.
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Set a new expiry on an existing key. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically increment a counter.
    ///
    /// The expiry is set to `window` only by the increment that creates the
    /// key, so the window runs from the first request in it.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount>;

    /// Add a member to a set and reset the set's expiry to `ttl`, in one
    /// round trip. Returns whether the member was newly added.
    async fn sadd_ex(&self, key: &str, member: &str, ttl: Duration) -> Result<bool>;

    /// Remove a member from a set. Empty sets are deleted.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// List the members of a set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Enumerate live keys matching a glob pattern (`*` and `?` wildcards).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
}
