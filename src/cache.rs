//! Answer cache with LRU eviction and TTL-based expiration.
//!
//! Capacity is an entry count, not a byte budget. Recency is a logical
//! clock bumped on every insert, hit and address update, so the eviction
//! victim is always unique and ties fall back to insertion order.

use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dns::{AnswerTemplate, CacheKey};

struct CacheEntry {
    template: AnswerTemplate,
    ttl: u32,
    last_used: u64,
    generation: u64,
    expires_at: Option<Instant>,
}

/// Snapshot of a cache entry handed out on a hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAnswer {
    pub template: AnswerTemplate,
    pub ttl: u32,
}

impl CachedAnswer {
    pub fn address(&self) -> IpAddr {
        self.template.address()
    }
}

struct Inner {
    entries: FxHashMap<CacheKey, CacheEntry>,
    clock: u64,
    generation: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lru(&mut self) -> Option<CacheKey> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&victim);
        Some(victim)
    }
}

/// Bounded answer cache shared between the proxy and the prober.
///
/// All four operations take the same lock, so readers never observe a
/// partially updated entry.
pub struct AnswerCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl_multiplier: u32,
    shutdown: CancellationToken,
}

impl AnswerCache {
    pub fn new(capacity: usize, ttl_multiplier: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: FxHashMap::default(),
                clock: 0,
                generation: 0,
            }),
            capacity: capacity.max(1),
            ttl_multiplier: ttl_multiplier.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Look up an answer, refreshing its recency on a hit.
    pub fn lookup(&self, key: &CacheKey) -> Option<CachedAnswer> {
        let now = Instant::now();
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| now >= at),
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            return None;
        }

        let stamp = inner.tick();
        let entry = inner.entries.get_mut(key)?;
        entry.last_used = stamp;
        Some(CachedAnswer {
            template: entry.template.clone(),
            ttl: entry.ttl,
        })
    }

    /// Insert or overwrite an answer, evicting the least recently used entry
    /// when the cache is full.
    pub fn insert(&self, key: CacheKey, template: AnswerTemplate, ttl: u32) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(victim) = inner.evict_lru() {
                debug!(?victim, "evicted least recently used answer");
            }
        }

        let last_used = inner.tick();
        inner.generation += 1;
        let generation = inner.generation;
        inner.entries.insert(
            key,
            CacheEntry {
                template,
                ttl,
                last_used,
                generation,
                expires_at: None,
            },
        );
    }

    /// Point a cached answer at a new address. No-op if the entry is gone.
    pub fn update_address(&self, key: &CacheKey, address: IpAddr) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if !inner.entries.contains_key(key) {
            return false;
        }

        let stamp = inner.tick();
        let Some(entry) = inner.entries.get_mut(key) else {
            return false;
        };
        entry.template = entry.template.with_address(address);
        entry.last_used = stamp;
        true
    }

    /// Arrange for `key` to be removed `ttl_secs * ttl_multiplier` seconds
    /// from now.
    ///
    /// Only the entry present at scheduling time is removed; an entry that
    /// was evicted or overwritten in the meantime is left alone. Must be
    /// called from within a tokio runtime. A lifetime too long to represent
    /// leaves the entry to LRU eviction.
    pub fn schedule_expiry(self: &Arc<Self>, key: &CacheKey, ttl_secs: u32) {
        let lifetime = self.expiry_duration(ttl_secs);
        let Some(deadline) = Instant::now().checked_add(lifetime) else {
            debug!(?key, ?lifetime, "expiry out of range, not scheduling");
            return;
        };

        let generation = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let Some(entry) = inner.entries.get_mut(key) else {
                return;
            };
            entry.expires_at = Some(deadline);
            entry.generation
        };

        let cache: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shutdown.cancelled() => return,
            }
            if let Some(cache) = cache.upgrade() {
                cache.remove_generation(&key, generation);
            }
        });
    }

    /// How long an entry with the given DNS TTL stays cached.
    pub fn expiry_duration(&self, ttl_secs: u32) -> Duration {
        Duration::from_secs(u64::from(ttl_secs) * u64::from(self.ttl_multiplier))
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner
            .lock()
            .map(|mut inner| inner.entries.remove(key).is_some())
            .unwrap_or(false)
    }

    fn remove_generation(&self, key: &CacheKey, generation: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            inner.entries.remove(key);
            debug!(?key, "answer expired");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cancel pending expiry timers and drop every entry.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Message, TYPE_A};
    use crate::dns::tests::build_query;

    fn key_and_template(domain: &str, last_octet: u8) -> (CacheKey, AnswerTemplate) {
        let message = Message::decode(&build_query(1, domain, TYPE_A)).unwrap();
        let address = IpAddr::from([10, 0, 0, last_octet]);
        (
            message.cache_key(),
            AnswerTemplate::new(&message.question, 4, address),
        )
    }

    fn fill(cache: &AnswerCache, domains: &[&str]) -> Vec<CacheKey> {
        domains
            .iter()
            .enumerate()
            .map(|(i, domain)| {
                let (key, template) = key_and_template(domain, i as u8);
                cache.insert(key.clone(), template, 300);
                key
            })
            .collect()
    }

    #[test]
    fn lookup_misses_on_empty_cache() {
        let cache = AnswerCache::new(4, 8);
        let (key, _) = key_and_template("example.com", 1);

        assert!(cache.lookup(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_then_lookup_returns_answer() {
        let cache = AnswerCache::new(4, 8);
        let (key, template) = key_and_template("example.com", 1);

        cache.insert(key.clone(), template.clone(), 300);

        let hit = cache.lookup(&key).unwrap();
        assert_eq!(hit.template, template);
        assert_eq!(hit.ttl, 300);
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let cache = AnswerCache::new(1, 8);
        let (key, first) = key_and_template("example.com", 1);
        let second = first.with_address(IpAddr::from([10, 0, 0, 2]));

        cache.insert(key.clone(), first, 300);
        cache.insert(key.clone(), second.clone(), 300);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&key).unwrap().template, second);
    }

    #[test]
    fn full_cache_evicts_exactly_the_oldest_entry() {
        let cache = AnswerCache::new(3, 8);
        let keys = fill(&cache, &["a.com", "b.com", "c.com"]);

        fill(&cache, &["d.com"]);

        assert_eq!(cache.len(), 3);
        assert!(cache.lookup(&keys[0]).is_none());
        assert!(cache.lookup(&keys[1]).is_some());
        assert!(cache.lookup(&keys[2]).is_some());
    }

    #[test]
    fn lookup_protects_entry_from_next_eviction() {
        let cache = AnswerCache::new(3, 8);
        let keys = fill(&cache, &["a.com", "b.com", "c.com"]);

        assert!(cache.lookup(&keys[0]).is_some());
        fill(&cache, &["d.com"]);

        assert!(cache.lookup(&keys[0]).is_some());
        assert!(cache.lookup(&keys[1]).is_none());
    }

    #[test]
    fn single_entry_cache_replaces_its_only_entry() {
        let cache = AnswerCache::new(1, 8);
        let keys = fill(&cache, &["a.com"]);
        assert!(cache.lookup(&keys[0]).is_some());

        let new_keys = fill(&cache, &["b.com"]);

        assert!(cache.lookup(&keys[0]).is_none());
        assert!(cache.lookup(&new_keys[0]).is_some());
    }

    #[test]
    fn update_address_rewrites_entry_in_place() {
        let cache = AnswerCache::new(2, 8);
        let keys = fill(&cache, &["a.com", "b.com"]);
        let new_address = IpAddr::from([192, 0, 2, 7]);

        assert!(cache.update_address(&keys[0], new_address));

        assert_eq!(cache.lookup(&keys[0]).unwrap().address(), new_address);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn update_address_refreshes_recency() {
        let cache = AnswerCache::new(2, 8);
        let keys = fill(&cache, &["a.com", "b.com"]);

        cache.update_address(&keys[0], IpAddr::from([192, 0, 2, 7]));
        fill(&cache, &["c.com"]);

        assert!(cache.lookup(&keys[0]).is_some());
        assert!(cache.lookup(&keys[1]).is_none());
    }

    #[test]
    fn update_address_on_missing_key_is_noop() {
        let cache = AnswerCache::new(2, 8);
        let (key, _) = key_and_template("gone.com", 1);

        assert!(!cache.update_address(&key, IpAddr::from([192, 0, 2, 7])));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_expiry_removes_entry() {
        let cache = Arc::new(AnswerCache::new(4, 8));
        let keys = fill(&cache, &["a.com"]);

        cache.schedule_expiry(&keys[0], 4);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(cache.lookup(&keys[0]).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.lookup(&keys[0]).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hits_do_not_extend_ttl() {
        let cache = Arc::new(AnswerCache::new(4, 1));
        let keys = fill(&cache, &["a.com"]);
        cache.schedule_expiry(&keys[0], 10);

        for _ in 0..9 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(cache.lookup(&keys[0]).is_some());
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.lookup(&keys[0]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_leaves_overwritten_entry_alone() {
        let cache = Arc::new(AnswerCache::new(4, 1));
        let (key, template) = key_and_template("a.com", 1);
        cache.insert(key.clone(), template.clone(), 5);
        cache.schedule_expiry(&key, 5);

        tokio::time::sleep(Duration::from_secs(3)).await;
        cache.insert(key.clone(), template, 60);
        cache.schedule_expiry(&key, 60);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cache.lookup(&key).is_some());
    }

    #[test]
    fn expiry_duration_applies_multiplier() {
        let cache = AnswerCache::new(1, 8);

        assert_eq!(cache.expiry_duration(300), Duration::from_secs(2400));
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_expiry_keeps_entry() {
        let cache = Arc::new(AnswerCache::new(4, u32::MAX));
        let keys = fill(&cache, &["a.com"]);

        cache.schedule_expiry(&keys[0], u32::MAX);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(cache.lookup(&keys[0]).is_some());
    }

    #[tokio::test]
    async fn shutdown_clears_entries() {
        let cache = Arc::new(AnswerCache::new(4, 8));
        let keys = fill(&cache, &["a.com", "b.com"]);
        cache.schedule_expiry(&keys[0], 300);

        cache.shutdown();

        assert!(cache.is_empty());
    }
}
