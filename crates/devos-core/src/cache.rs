//! `CacheBackend` — a Redis-shaped abstraction over shared mutable state.
//!
//! The orchestrator leans on a shared cache for locks, sliding-window rate
//! limit counters, the handoff priority queue, and the output streaming ring
//! buffer. All of it is expressible through `get`/`set`/`setnx`/`del`/`expire`
//! plus a handful of sorted-set operations, so it is modeled as one trait
//! rather than threading a concrete client through every module. The
//! in-memory implementation backs both production (single-process
//! deployment) and tests; a networked implementation can be dropped in
//! behind the same trait without touching callers.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>);
    /// Set `key` to `value` only if absent. Returns `true` if the set happened.
    async fn setnx(&self, key: &str, value: &str, ttl: Duration) -> bool;
    async fn del(&self, key: &str);
    async fn expire(&self, key: &str, ttl: Duration);

    /// Add `member` to the sorted set at `key` with the given `score`.
    async fn zadd(&self, key: &str, score: f64, member: &str);
    /// Members with `min <= score <= max`, ascending by score.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Vec<String>;
    /// Remove members with `min <= score <= max`. Returns the count removed.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> usize;
    /// Remove one exact member (never by score range). Returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> bool;
    async fn zcard(&self, key: &str) -> usize;
    /// The lowest-scoring member without removing it.
    async fn zpeek_min(&self, key: &str) -> Option<(f64, String)>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct SortedSet {
    // (score, member) -> () gives ascending iteration by score then member,
    // which is the tie-break the handoff queue needs (insertion order is
    // approximated by encoding a monotonic sequence into the member string
    // by callers that care).
    entries: BTreeMap<(OrderedF64, String), ()>,
}

#[derive(Clone, Copy, PartialEq, PartialOrd)]
struct OrderedF64(f64);
impl Eq for OrderedF64 {}
impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// In-memory [`CacheBackend`]. Each key-space (strings, sorted sets) is
/// guarded by its own lock so operations on unrelated keys never contend,
/// and every individual call holds its lock for the whole operation —
/// satisfying the "atomic per call" requirement for sorted-set ops.
pub struct InMemoryCacheBackend {
    strings: DashMap<String, Entry>,
    sorted_sets: DashMap<String, Mutex<SortedSet>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
            sorted_sets: DashMap::new(),
        }
    }

    fn is_live(entry: &Entry) -> bool {
        entry.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Option<String> {
        match self.strings.get(key) {
            Some(e) if Self::is_live(&e) => Some(e.value.clone()),
            Some(_) => {
                drop(self.strings.remove(key));
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    async fn setnx(&self, key: &str, value: &str, ttl: Duration) -> bool {
        use dashmap::mapref::entry::Entry as DEntry;
        match self.strings.entry(key.to_string()) {
            DEntry::Occupied(mut o) => {
                if Self::is_live(o.get()) {
                    false
                } else {
                    o.insert(Entry {
                        value: value.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    });
                    true
                }
            }
            DEntry::Vacant(v) => {
                v.insert(Entry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                });
                true
            }
        }
    }

    async fn del(&self, key: &str) {
        self.strings.remove(key);
        self.sorted_sets.remove(key);
    }

    async fn expire(&self, key: &str, ttl: Duration) {
        if let Some(mut e) = self.strings.get_mut(key) {
            e.expires_at = Some(Instant::now() + ttl);
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) {
        let set = self.sorted_sets.entry(key.to_string()).or_default();
        let mut guard = set.lock().unwrap();
        guard.entries.insert((OrderedF64(score), member.to_string()), ());
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Vec<String> {
        let Some(set) = self.sorted_sets.get(key) else {
            return Vec::new();
        };
        let guard = set.lock().unwrap();
        guard
            .entries
            .keys()
            .filter(|(s, _)| s.0 >= min && s.0 <= max)
            .map(|(_, m)| m.clone())
            .collect()
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> usize {
        let Some(set) = self.sorted_sets.get(key) else {
            return 0;
        };
        let mut guard = set.lock().unwrap();
        let to_remove: Vec<(OrderedF64, String)> = guard
            .entries
            .keys()
            .filter(|(s, _)| s.0 >= min && s.0 <= max)
            .cloned()
            .collect();
        for k in &to_remove {
            guard.entries.remove(k);
        }
        to_remove.len()
    }

    async fn zrem(&self, key: &str, member: &str) -> bool {
        let Some(set) = self.sorted_sets.get(key) else {
            return false;
        };
        let mut guard = set.lock().unwrap();
        let found: Option<(OrderedF64, String)> = guard
            .entries
            .keys()
            .find(|(_, m)| m == member)
            .cloned();
        match found {
            Some(k) => {
                guard.entries.remove(&k);
                true
            }
            None => false,
        }
    }

    async fn zcard(&self, key: &str) -> usize {
        self.sorted_sets
            .get(key)
            .map(|s| s.lock().unwrap().entries.len())
            .unwrap_or(0)
    }

    async fn zpeek_min(&self, key: &str) -> Option<(f64, String)> {
        let set = self.sorted_sets.get(key)?;
        let guard = set.lock().unwrap();
        guard.entries.keys().next().map(|(s, m)| (s.0, m.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setnx_only_succeeds_once_until_ttl_passes() {
        let cache = InMemoryCacheBackend::new();
        assert!(cache.setnx("lock:a", "1", Duration::from_millis(50)).await);
        assert!(!cache.setnx("lock:a", "2", Duration::from_secs(30)).await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.setnx("lock:a", "3", Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn get_expires_after_ttl() {
        let cache = InMemoryCacheBackend::new();
        cache.set("k", "v", Some(Duration::from_millis(30))).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn sorted_set_range_and_trim() {
        let cache = InMemoryCacheBackend::new();
        cache.zadd("q", 10.0, "a").await;
        cache.zadd("q", 5.0, "b").await;
        cache.zadd("q", 20.0, "c").await;
        assert_eq!(cache.zcard("q").await, 3);
        let removed = cache.zremrangebyscore("q", 0.0, 9.0).await;
        assert_eq!(removed, 1);
        assert_eq!(cache.zcard("q").await, 2);
        let (score, member) = cache.zpeek_min("q").await.unwrap();
        assert_eq!(score, 10.0);
        assert_eq!(member, "a");
    }

    #[tokio::test]
    async fn zrem_removes_exact_member_not_by_score() {
        let cache = InMemoryCacheBackend::new();
        cache.zadd("q", 1.0, "first").await;
        cache.zadd("q", 1.0, "second").await;
        assert!(cache.zrem("q", "first").await);
        assert_eq!(cache.zcard("q").await, 1);
        assert!(!cache.zrem("q", "first").await);
    }
}
