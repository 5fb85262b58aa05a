//! LRU cache with per-entry expiry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use metrics::counter;
use serde::Serialize;

use super::config::CachePolicy;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

pub(crate) const METRIC_CACHE_HIT: &str = "contextfit_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "contextfit_cache_miss_total";
pub(crate) const METRIC_CACHE_EVICT: &str = "contextfit_cache_evict_total";

/// Expiry instant `ttl` from now. A lifetime past the clock's range expires at once, so
/// the entry reads as a miss.
fn expiry_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl).unwrap_or(now)
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct State<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
    counters: Counters,
}

/// Point-in-time counters of one cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub name: &'static str,
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped because their lifetime passed.
    pub expirations: u64,
    pub size: usize,
    pub max_size: usize,
}

impl CacheStats {
    /// Hits over lookups, or 0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Bounded LRU map whose entries expire after a time-to-live.
///
/// A single mutex guards the map; every operation is a short critical section, so one
/// instance can be shared across threads. Lookups never fail: a poisoned lock is
/// recovered and an expired entry reads as a miss.
pub struct TtlLruCache<K: Hash + Eq, V> {
    name: &'static str,
    default_ttl: Duration,
    max_size: usize,
    state: Mutex<State<K, V>>,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// `name` labels this cache in logs, metrics and stats.
    pub fn new(name: &'static str, policy: CachePolicy) -> Self {
        let capacity = policy.max_size_non_zero();
        Self {
            name,
            default_ttl: policy.ttl(),
            max_size: capacity.get(),
            state: Mutex::new(State {
                entries: LruCache::new(capacity),
                counters: Counters::default(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns a live entry and marks it most recently used. Expired entries are dropped.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "get");
        let result = Self::lookup(&mut state, key, now);
        drop(state);

        self.record_lookup(result.is_some());
        result
    }

    /// Looks up every key under one lock. Missing and expired keys are left out.
    pub fn get_many<'a, I>(&self, keys: I) -> HashMap<K, V>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let now = Instant::now();
        let mut found = HashMap::new();
        let mut misses = 0u64;

        let mut state = mutex_lock(&self.state, SOURCE, "get_many");
        for key in keys {
            match Self::lookup(&mut state, key, now) {
                Some(value) => {
                    found.insert(key.clone(), value);
                }
                None => misses += 1,
            }
        }
        drop(state);

        if !found.is_empty() {
            counter!(METRIC_CACHE_HIT, "cache" => self.name).increment(found.len() as u64);
        }
        if misses > 0 {
            counter!(METRIC_CACHE_MISS, "cache" => self.name).increment(misses);
        }
        found
    }

    /// Inserts with the cache's default lifetime.
    pub fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let evicted = {
            let mut state = mutex_lock(&self.state, SOURCE, "put");
            Self::insert(&mut state, key, value, expiry_after(ttl))
        };
        if evicted {
            counter!(METRIC_CACHE_EVICT, "cache" => self.name).increment(1);
        }
    }

    /// Inserts every pair under one lock with the default lifetime.
    pub fn put_many<I>(&self, items: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let expires_at = expiry_after(self.default_ttl);
        let mut evicted = 0u64;
        {
            let mut state = mutex_lock(&self.state, SOURCE, "put_many");
            for (key, value) in items {
                if Self::insert(&mut state, key, value, expires_at) {
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            counter!(METRIC_CACHE_EVICT, "cache" => self.name).increment(evicted);
        }
    }

    /// Removes one entry, returning whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        mutex_lock(&self.state, SOURCE, "invalidate")
            .entries
            .pop(key)
            .is_some()
    }

    /// Drops every entry. Counters are kept.
    pub fn clear(&self) {
        mutex_lock(&self.state, SOURCE, "clear").entries.clear();
    }

    /// Number of stored entries, including ones that expired but were not yet read.
    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = mutex_lock(&self.state, SOURCE, "stats");
        CacheStats {
            name: self.name,
            hits: state.counters.hits,
            misses: state.counters.misses,
            evictions: state.counters.evictions,
            expirations: state.counters.expirations,
            size: state.entries.len(),
            max_size: self.max_size,
        }
    }

    fn lookup(state: &mut State<K, V>, key: &K, now: Instant) -> Option<V> {
        let expired = match state.entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                let value = entry.value.clone();
                state.counters.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.pop(key);
            state.counters.expirations += 1;
        }
        state.counters.misses += 1;
        None
    }

    /// Returns true when a different key was evicted to make room.
    fn insert(state: &mut State<K, V>, key: K, value: V, expires_at: Instant) -> bool {
        let probe = key.clone();
        match state.entries.push(key, Entry { value, expires_at }) {
            Some((evicted_key, _)) if evicted_key != probe => {
                state.counters.evictions += 1;
                true
            }
            _ => false,
        }
    }

    fn record_lookup(&self, hit: bool) {
        if hit {
            counter!(METRIC_CACHE_HIT, "cache" => self.name).increment(1);
        } else {
            counter!(METRIC_CACHE_MISS, "cache" => self.name).increment(1);
        }
    }
}
