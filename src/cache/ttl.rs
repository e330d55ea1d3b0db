use std::{
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use super::{CacheKey, Dependency, KeyDerivation, KeyMaterial, Md5KeyDerivation};
use crate::config::CacheConfig;

/// A value that can be stored in a [`TtlCache`].
///
/// Values may report entities they were built from, in addition to the dependencies declared on
/// the [`KeyMaterial`], so that invalidating any of them drops the entry.
pub trait CacheValue: Clone + Send + Sync {
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Live (non-expired) entries.
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// A thread-safe read-through cache where entries expire a fixed time after insertion.
///
/// Entries are indexed by the [`Dependency`]s they declare, so invalidation is a direct lookup.
/// When the cache is full, the oldest-inserted entry is evicted.
///
/// Cache operations never fail. The internal lock is only held for short, non-blocking critical
/// sections and never across an `.await`.
pub struct TtlCache<V> {
    name: &'static str,
    config: CacheConfig,
    key_derivation: Arc<dyn KeyDerivation>,
    state: Mutex<CacheState<V>>,
}

struct CacheState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    /// Insertion sequence number → key, oldest first.
    insertion_order: BTreeMap<u64, CacheKey>,
    dependents: HashMap<Dependency, HashSet<CacheKey>>,
    next_seq: u64,
    hits: u64,
    misses: u64,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
    dependencies: Vec<Dependency>,
}

impl<V: CacheValue> TtlCache<V> {
    /// Create a cache using [`Md5KeyDerivation`].
    pub fn new(name: &'static str, config: CacheConfig) -> TtlCache<V> {
        TtlCache::with_key_derivation(name, config, Arc::new(Md5KeyDerivation))
    }

    pub fn with_key_derivation(
        name: &'static str,
        config: CacheConfig,
        key_derivation: Arc<dyn KeyDerivation>,
    ) -> TtlCache<V> {
        TtlCache {
            name,
            config,
            key_derivation,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                insertion_order: BTreeMap::new(),
                dependents: HashMap::new(),
                next_seq: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Return the cached value for `material` if present and not expired.
    pub fn get(&self, material: &KeyMaterial) -> Option<V> {
        let key = self.key_derivation.derive_key(material);
        let now = Instant::now();

        let mut state = self.state();
        let expired = state
            .entries
            .get(&key)
            .map(|entry| self.is_expired(entry, now));
        let value = match expired {
            Some(false) => state.entries.get(&key).map(|entry| entry.value.clone()),
            Some(true) => {
                state.remove(&key);
                None
            }
            None => None,
        };

        if value.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        drop(state);

        log::trace!(target: "abtest",
                    cache = self.name,
                    key = key.as_str(),
                    hit = value.is_some();
                    "cache lookup");
        value
    }

    /// Store `value` under `material`, replacing any previous entry.
    pub fn insert(&self, material: &KeyMaterial, value: V) {
        if self.config.max_entries == 0 {
            return;
        }

        let key = self.key_derivation.derive_key(material);
        let mut dependencies = material.dependencies().to_vec();
        for dependency in value.dependencies() {
            if !dependencies.contains(&dependency) {
                dependencies.push(dependency);
            }
        }

        let mut state = self.state();
        state.remove(&key);
        while state.entries.len() >= self.config.max_entries {
            let Some(evicted) = state.evict_oldest() else {
                break;
            };
            log::debug!(target: "abtest",
                        cache = self.name,
                        key = evicted.as_str();
                        "evicted oldest cache entry");
        }
        state.insert(key, value, dependencies, Instant::now());
    }

    /// Return the cached value for `material`, or compute, store and return it.
    ///
    /// Errors returned by `compute` are passed through and nothing is cached.
    pub async fn get_or_try_compute<F, Fut, E>(
        &self,
        material: &KeyMaterial,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(material) {
            return Ok(value);
        }

        let value = compute().await?;
        self.insert(material, value.clone());
        Ok(value)
    }

    /// Infallible version of [`TtlCache::get_or_try_compute`].
    pub async fn get_or_compute<F, Fut>(&self, material: &KeyMaterial, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        if let Some(value) = self.get(material) {
            return value;
        }

        let value = compute().await;
        self.insert(material, value.clone());
        value
    }

    /// Drop every entry that depends on `dependency`. Returns the number of dropped entries.
    pub fn invalidate(&self, dependency: &Dependency) -> usize {
        let mut state = self.state();
        let keys = state.dependents.remove(dependency).unwrap_or_default();
        let removed = keys.iter().filter(|key| state.remove(key)).count();
        drop(state);

        if removed > 0 {
            log::debug!(target: "abtest",
                        cache = self.name,
                        dependency,
                        removed;
                        "invalidated cache entries");
        }
        removed
    }

    /// Drop every entry that depends on all of `dependencies`. Returns how many were removed.
    pub fn invalidate_all_of(&self, dependencies: &[Dependency]) -> usize {
        let Some((first, rest)) = dependencies.split_first() else {
            return 0;
        };

        let mut state = self.state();
        let keys: Vec<CacheKey> = state
            .dependents
            .get(first)
            .map(|keys| {
                keys.iter()
                    .filter(|key| {
                        rest.iter().all(|dependency| {
                            state
                                .dependents
                                .get(dependency)
                                .is_some_and(|other| other.contains(*key))
                        })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let removed = keys.iter().filter(|key| state.remove(key)).count();
        drop(state);

        if removed > 0 {
            log::debug!(target: "abtest",
                        cache = self.name,
                        dependency = first,
                        removed;
                        "invalidated cache entries sharing dependencies");
        }
        removed
    }

    /// Drop the entry stored under `material`, if any.
    pub fn invalidate_key(&self, material: &KeyMaterial) -> bool {
        let key = self.key_derivation.derive_key(material);
        self.state().remove(&key)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.insertion_order.clear();
        state.dependents.clear();
    }

    /// Number of live entries. Expired entries are purged first.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state();
        self.purge_expired(&mut state, now);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut state = self.state();
        self.purge_expired(&mut state, now);
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) >= self.config.ttl
    }

    fn purge_expired(&self, state: &mut CacheState<V>, now: Instant) {
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.remove(&key);
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState<V>> {
        // Critical sections leave the maps consistent, so poisoning is ignored.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> CacheState<V> {
    fn insert(&mut self, key: CacheKey, value: V, dependencies: Vec<Dependency>, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;

        for dependency in &dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(key.clone());
        }
        self.insertion_order.insert(seq, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                seq,
                dependencies,
            },
        );
    }

    /// Remove `key` and its index records. Returns `true` if an entry was removed.
    fn remove(&mut self, key: &CacheKey) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.insertion_order.remove(&entry.seq);
        for dependency in &entry.dependencies {
            if let Some(keys) = self.dependents.get_mut(dependency) {
                keys.remove(key);
                if keys.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
        true
    }

    fn evict_oldest(&mut self) -> Option<CacheKey> {
        let (_, key) = self.insertion_order.pop_first()?;
        self.remove(&key);
        Some(key)
    }
}
