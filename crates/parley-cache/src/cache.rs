//! Namespaced key/value access with a JSON serialization contract.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::KvStore;

/// Generic envelope stored by the performance caches.
///
/// `ttl` is serialized as whole seconds; timestamps as RFC 3339 strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    /// Full cache key the entry was stored under.
    pub key: String,

    /// Cached value.
    pub value: V,

    /// Lifetime granted when the entry was written.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,

    /// When this entry was created.
    pub created_at: DateTime<Utc>,

    /// `created_at + ttl`; the entry must never be served after this instant.
    pub expires_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    /// Create an entry that starts its lifetime now.
    pub fn new(key: impl Into<String>, value: V, ttl: Duration) -> Self {
        let created_at = Utc::now();
        Self {
            key: key.into(),
            value,
            ttl,
            created_at,
            expires_at: created_at + to_chrono(ttl),
        }
    }

    /// Whether the entry is past its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether the entry is past its expiry.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Convert a std duration into a chrono one, saturating at a century.
pub(crate) fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

/// Serde helpers encoding a [`Duration`] as seconds.
///
/// Whole durations are written as integers; anything with a sub-second part
/// is written as fractional seconds and read back rounded to the nanosecond.
pub mod duration_secs {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    const NANOS_PER_SEC: f64 = 1_000_000_000.0;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_f64(value.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(SecondsVisitor)
    }

    struct SecondsVisitor;

    impl<'de> Visitor<'de> for SecondsVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a non-negative number of seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            if !v.is_finite() || v < 0.0 || v >= u64::MAX as f64 {
                return Err(E::invalid_value(de::Unexpected::Float(v), &self));
            }
            let secs = v.trunc();
            let nanos = (v - secs) * NANOS_PER_SEC;
            let nanos = nanos.round() as u64;
            Ok(Duration::from_secs(secs as u64) + Duration::from_nanos(nanos))
        }
    }
}

/// Shared handle over the backing store.
///
/// All higher caches go through this type: it owns key namespacing and the
/// value encoding, so every domain is stored the same way.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn KvStore>,
}

impl CacheStore {
    /// Wrap a backing store.
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self { backend }
    }

    /// The underlying key/value store.
    pub fn backend(&self) -> &Arc<dyn KvStore> {
        &self.backend
    }

    /// Build a namespaced key: `"{prefix}:{identifier}"`.
    pub fn generate_key(prefix: &str, identifier: &str) -> String {
        format!("{prefix}:{identifier}")
    }

    /// Encode a value to its wire representation.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    /// Decode a value from its wire representation.
    pub fn deserialize<T: DeserializeOwned>(raw: &str) -> Result<T> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Store a value under `key` with the given lifetime.
    pub async fn set_value<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let raw = Self::serialize(value)?;
        self.backend.set_ex(key, &raw, ttl).await
    }

    /// Load and decode the value under `key`.
    ///
    /// A malformed payload surfaces as [`crate::Error::Serialization`]; callers
    /// decide whether that is a miss.
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(raw) => Self::deserialize(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Delete `key`. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }

    /// Count live keys under a namespace prefix.
    pub async fn count_prefix(&self, prefix: &str) -> Result<usize> {
        let pattern = Self::generate_key(prefix, "*");
        Ok(self.backend.keys(&pattern).await?.len())
    }
}
