// src/cache.rs
//
// In-memory TTL cache over decoded ledger reads.
//
// Keys are namespaced strings (`"election:info"`, `"voter:0x…"`) so that a
// write can invalidate everything it may have changed with one substring
// pattern. Time is read from `tokio::time::Instant`, which lets tests drive
// expiry with a paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::calls::Namespace;
use crate::types::{Address, fmt_address};

/// Canonical cache keys.
pub mod keys {
    use super::*;

    pub const ELECTION_INFO: &str = "election:info";
    pub const ELECTION_WINNER: &str = "election:winner";
    pub const ELECTION_STATS: &str = "election:statistics";
    pub const CANDIDATES: &str = "candidate:all";

    pub fn voter(who: &Address) -> String {
        format!("{}:{}", Namespace::Voter.as_str(), fmt_address(who))
    }

    pub fn role(who: &Address) -> String {
        format!("{}:{}", Namespace::Role.as_str(), fmt_address(who))
    }
}

/// Whether an entry may be served after its ttl.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Expired entries are misses.
    #[default]
    Strict,
    /// Expired entries are still returned; the caller is expected to refresh.
    StaleWhileRevalidate,
}

#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub written_at: Instant,
    pub ttl: Duration,
    pub policy: CachePolicy,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.written_at) > self.ttl
    }
}

pub struct ReadCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
    /// Bumped by every `invalidate` and `clear`, matching or not.
    generation: AtomicU64,
}

impl<V: Clone> ReadCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            generation: AtomicU64::new(0),
        }
    }

    /// Fresh value for `key`, or a stale one if the entry was stored with
    /// [`CachePolicy::StaleWhileRevalidate`]. Expired strict entries are
    /// evicted and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(e) if !e.is_expired(now) => return Some(e.value.clone()),
                Some(e) if e.policy == CachePolicy::StaleWhileRevalidate => {
                    return Some(e.value.clone());
                }
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write();
        // Re-check under the write lock; a concurrent `set` may have refreshed it.
        if let Some(e) = entries.get(key) {
            if !e.is_expired(now) {
                return Some(e.value.clone());
            }
            entries.remove(key);
            debug!(key, "cache entry expired");
        }
        None
    }

    /// Whether `key` holds an entry that is past its ttl or absent.
    pub fn needs_refresh(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .is_none_or(|e| e.is_expired(now))
    }

    /// Last stored value regardless of age. Used to degrade gracefully when a
    /// refresh fails.
    pub fn get_stale(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    /// Store with the default ttl.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with(key, value, self.default_ttl, CachePolicy::Strict);
    }

    pub fn set_with(&self, key: impl Into<String>, value: V, ttl: Duration, policy: CachePolicy) {
        let entry = CacheEntry {
            value,
            written_at: Instant::now(),
            ttl,
            policy,
        };
        self.entries.write().insert(key.into(), entry);
    }

    /// Current invalidation generation. Take it before starting a fetch and
    /// hand it to [`ReadCache::set_if_current`] when the fetch returns.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store with the default ttl unless an invalidation happened since
    /// `generation` was taken. A value read before a write landed must not
    /// outlive the write's invalidation. Returns whether the value was stored.
    pub fn set_if_current(&self, key: impl Into<String>, value: V, generation: u64) -> bool {
        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                written_at: Instant::now(),
                ttl: self.default_ttl,
                policy: CachePolicy::Strict,
            },
        );
        true
    }

    /// Drop every key containing `pattern`. Returns how many were removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        entries.retain(|k, _| !k.contains(pattern));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(pattern, removed, "cache invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sorted keys currently held, expired or not.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Invalidation seam used by writers that do not care about the cached type.
pub trait Invalidate: Send + Sync {
    fn invalidate(&self, pattern: &str) -> usize;

    fn invalidate_namespaces(&self, namespaces: &[Namespace]) -> usize {
        namespaces
            .iter()
            .map(|ns| self.invalidate(ns.as_str()))
            .sum()
    }

    fn invalidate_all(&self) -> usize {
        self.invalidate_namespaces(&Namespace::ALL)
    }
}

impl<V: Clone + Send + Sync> Invalidate for ReadCache<V> {
    fn invalidate(&self, pattern: &str) -> usize {
        ReadCache::invalidate(self, pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ReadCache<u32> {
        ReadCache::new(Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let c = cache();
        c.set("election:info", 1);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(c.get("election:info"), Some(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(c.get("election:info"), None);
        // Evicted on the miss.
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_while_revalidate_survives_ttl() {
        let c = cache();
        c.set_with(
            "candidate:all",
            9,
            Duration::from_secs(1),
            CachePolicy::StaleWhileRevalidate,
        );
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(c.get("candidate:all"), Some(9));
        assert!(c.needs_refresh("candidate:all"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_stale_ignores_age() {
        let c = cache();
        c.set("voter:0x01", 4);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(c.get_stale("voter:0x01"), Some(4));
    }

    #[test]
    fn invalidate_is_idempotent() {
        let c = cache();
        c.set(keys::ELECTION_INFO, 1);
        c.set(keys::ELECTION_STATS, 2);
        c.set(keys::CANDIDATES, 3);
        c.set(keys::voter(&[1; 20]), 4);

        assert_eq!(c.invalidate("election"), 2);
        let after_once = c.keys();
        assert_eq!(c.invalidate("election"), 0);
        assert_eq!(c.keys(), after_once);
        assert_eq!(after_once.len(), 2);
    }

    #[test]
    fn namespaces_cover_their_keys() {
        let c = cache();
        c.set(keys::role(&[2; 20]), 1);
        c.set(keys::voter(&[2; 20]), 2);
        assert_eq!(c.invalidate_namespaces(&[Namespace::Role]), 1);
        assert_eq!(c.keys(), vec![keys::voter(&[2; 20])]);
    }

    #[test]
    fn invalidation_discards_reads_started_before_it() {
        let c = cache();
        let before = c.generation();
        // Nothing matches, but a write may still have changed the ledger.
        c.invalidate("role");
        assert!(!c.set_if_current(keys::ELECTION_INFO, 1, before));
        assert_eq!(c.get(keys::ELECTION_INFO), None);

        let now = c.generation();
        assert!(c.set_if_current(keys::ELECTION_INFO, 2, now));
        assert_eq!(c.get(keys::ELECTION_INFO), Some(2));

        c.clear();
        assert!(!c.set_if_current(keys::ELECTION_INFO, 3, now));
    }

    #[test]
    fn invalidate_all_drops_every_namespace() {
        let c = cache();
        c.set(keys::ELECTION_INFO, 1);
        c.set(keys::CANDIDATES, 2);
        c.set(keys::voter(&[3; 20]), 3);
        c.set(keys::role(&[3; 20]), 4);
        assert_eq!(c.invalidate_all(), 4);
        assert!(c.is_empty());
    }

    #[test]
    fn last_write_wins() {
        let c = cache();
        c.set("k", 1);
        c.set("k", 2);
        assert_eq!(c.get("k"), Some(2));
        c.clear();
        assert_eq!(c.get("k"), None);
    }
}
