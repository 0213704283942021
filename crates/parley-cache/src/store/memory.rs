//! In-process implementation of [`KvStore`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{KeyTtl, KvStore, WindowCount};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Key/value store held in process memory.
///
/// Expiry is lazy: an expired key is dropped the next time it is touched, and
/// never returned by any read. Time is measured with [`tokio::time::Instant`],
/// so a paused tokio clock drives expiry deterministically in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while offline every operation fails with
    /// [`Error::Store`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .values()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_expired(now));
        before - slots.len()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::Store("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Look up a key, evicting it first if it has expired.
fn live<'a>(slots: &'a mut HashMap<String, Slot>, key: &str, now: Instant) -> Option<&'a mut Slot> {
    if slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
        trace!(key = %key, "Evicting expired key");
        slots.remove(key);
    }
    slots.get_mut(key)
}

fn text_of(slot: &Slot, key: &str) -> Result<String> {
    match &slot.value {
        Value::Text(text) => Ok(text.clone()),
        Value::Set(_) => Err(Error::WrongType(key.to_string())),
    }
}

/// Match `text` against a glob pattern supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[async_trait]
impl KvStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        live(&mut slots, key, now)
            .map(|slot| text_of(slot, key))
            .transpose()
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        keys.iter()
            .map(|key| {
                // MGET semantics: a key of another type reads as absent.
                Ok(live(&mut slots, key, now).and_then(|slot| text_of(slot, key).ok()))
            })
            .collect()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_online()?;
        self.slots.lock().insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_online()?;
        self.slots.lock().insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        Ok(match slots.remove(key) {
            Some(slot) => !slot.is_expired(now),
            None => false,
        })
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        Ok(match live(&mut slots, key, now) {
            None => KeyTtl::Missing,
            Some(Slot {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Slot {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        Ok(match live(&mut slots, key, now) {
            Some(slot) => {
                slot.expires_at = Some(now + ttl);
                true
            }
            None => false,
        })
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();

        match live(&mut slots, key, now) {
            Some(slot) => {
                let current = match &slot.value {
                    Value::Text(text) => text.parse::<u64>().map_err(|_| {
                        Error::Store(format!("value at '{key}' is not an integer"))
                    })?,
                    Value::Set(_) => return Err(Error::WrongType(key.to_string())),
                };
                let count = current.saturating_add(1);
                slot.value = Value::Text(count.to_string());
                Ok(WindowCount {
                    count,
                    ttl: slot.expires_at.map(|at| at.saturating_duration_since(now)),
                })
            }
            None => {
                slots.insert(
                    key.to_string(),
                    Slot {
                        value: Value::Text("1".to_string()),
                        expires_at: Some(now + window),
                    },
                );
                Ok(WindowCount {
                    count: 1,
                    ttl: Some(window),
                })
            }
        }
    }

    async fn sadd_ex(&self, key: &str, member: &str, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();

        let added = match live(&mut slots, key, now) {
            Some(slot) => match &mut slot.value {
                Value::Set(members) => {
                    slot.expires_at = Some(now + ttl);
                    members.insert(member.to_string())
                }
                Value::Text(_) => return Err(Error::WrongType(key.to_string())),
            },
            None => {
                let mut members = BTreeSet::new();
                members.insert(member.to_string());
                slots.insert(
                    key.to_string(),
                    Slot {
                        value: Value::Set(members),
                        expires_at: Some(now + ttl),
                    },
                );
                true
            }
        };
        Ok(added)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();

        let (removed, now_empty) = match live(&mut slots, key, now) {
            Some(slot) => match &mut slot.value {
                Value::Set(members) => {
                    let removed = members.remove(member);
                    (removed, members.is_empty())
                }
                Value::Text(_) => return Err(Error::WrongType(key.to_string())),
            },
            None => (false, false),
        };
        if now_empty {
            slots.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut slots = self.slots.lock();
        match live(&mut slots, key, now) {
            Some(slot) => match &slot.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                Value::Text(_) => Err(Error::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check_online()?;
        let now = Instant::now();
        let slots = self.slots.lock();
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(key, slot)| !slot.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("session:*", "session:abc"));
        assert!(glob_match("rate_limit:*", "rate_limit:ip:10.0.0.1"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("session:*", "user_sessions:u1"));
        assert!(!glob_match("a?c", "ac"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_ex_expires() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_reports_remaining() {
        let store = MemoryStore::new();
        store.set("forever", "1").await.unwrap();
        store.set_ex("soon", "1", Duration::from_secs(30)).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(store.ttl("forever").await.unwrap(), KeyTtl::Persistent);
        assert_eq!(
            store.ttl("soon").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(20))
        );
        assert_eq!(store.ttl("nothing").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_window_sets_expiry_once() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        let first = store.incr_window("c", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.ttl, Some(window));

        tokio::time::advance(Duration::from_secs(20)).await;

        let second = store.incr_window("c", window).await.unwrap();
        assert_eq!(second.count, 2);
        // Window runs from the first increment, not the latest.
        assert_eq!(second.ttl, Some(Duration::from_secs(40)));

        tokio::time::advance(Duration::from_secs(41)).await;

        let fresh = store.incr_window("c", window).await.unwrap();
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let store = MemoryStore::new();
        store.set("c", "abc").await.unwrap();
        let result = store.incr_window("c", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn test_set_operations() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.sadd_ex("s", "a", ttl).await.unwrap());
        assert!(store.sadd_ex("s", "b", ttl).await.unwrap());
        assert!(!store.sadd_ex("s", "a", ttl).await.unwrap());
        assert_eq!(store.smembers("s").await.unwrap(), vec!["a", "b"]);

        assert!(store.srem("s", "a").await.unwrap());
        assert!(!store.srem("s", "a").await.unwrap());
        assert!(store.srem("s", "b").await.unwrap());

        // Emptied sets disappear entirely.
        assert_eq!(store.ttl("s").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store
            .sadd_ex("s", "a", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(store.get("s").await, Err(Error::WrongType(_))));
        assert_eq!(
            store.get_many(&["s".to_string()]).await.unwrap(),
            vec![None]
        );
    }

    #[tokio::test]
    async fn test_keys_and_get_many() {
        let store = MemoryStore::new();
        store.set("session:1", "a").await.unwrap();
        store.set("session:2", "b").await.unwrap();
        store.set("user_sessions:u", "c").await.unwrap();

        let keys = store.keys("session:*").await.unwrap();
        assert_eq!(keys, vec!["session:1", "session:2"]);

        let values = store
            .get_many(&[
                "session:2".to_string(),
                "missing".to_string(),
                "session:1".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![Some("b".to_string()), None, Some("a".to_string())]
        );
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let store = MemoryStore::new();
        store.set_offline(true);

        assert!(store.ping().await.unwrap_err().is_unavailable());
        assert!(store.get("k").await.is_err());
        assert!(store.set("k", "v").await.is_err());

        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set_ex("a", "1", Duration::from_secs(1)).await.unwrap();
        store.set("b", "1").await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
