//! Component-set query cache with versioned invalidation.
//!
//! A query asks for every entity that has all components of a key set. The
//! cache stores results keyed by the sorted component-id set together with
//! the column versions observed at computation time. Validity is checked
//! lazily on lookup: a result is served only if every recorded version still
//! equals the column's current version, so a stale result is never returned
//! without eager eviction bookkeeping on the write path.

use std::collections::HashMap;

use crate::component::ComponentId;
use crate::entity::EntityId;
use crate::pool::ComponentPool;

/// Default bound on cached entries.
pub const DEFAULT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// QueryKey
// ---------------------------------------------------------------------------

/// A sorted, deduplicated component-id set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<ComponentId>);

impl QueryKey {
    /// Normalize a caller-supplied component set: sort and deduplicate.
    pub fn new(components: &[ComponentId]) -> Self {
        let mut ids = components.to_vec();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    /// The normalized component ids.
    pub fn components(&self) -> &[ComponentId] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Cache internals
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CacheEntry {
    /// Matching entities, ascending by id.
    result: Vec<EntityId>,
    /// Column version of each key component at computation time, in key order.
    versions: Vec<u64>,
    /// Saturating hit counter; eviction prefers the lowest.
    hits: u64,
    /// Recency stamp for LRU tie-breaking.
    last_used: u64,
}

/// Hit/miss statistics for the whole cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Lookups served from a still-valid entry.
    pub hits: u64,
    /// Lookups that recomputed (cold or stale entry).
    pub misses: u64,
    /// Entries evicted to stay within capacity.
    pub evictions: u64,
}

// ---------------------------------------------------------------------------
// QueryCache
// ---------------------------------------------------------------------------

/// Bounded cache of component-set query results.
#[derive(Debug)]
pub struct QueryCache {
    entries: HashMap<QueryKey, CacheEntry>,
    capacity: usize,
    clock: u64,
    stats: QueryStats,
}

impl QueryCache {
    /// Create a cache bounded to [`DEFAULT_CAPACITY`] entries.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a cache bounded to `capacity` entries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
            stats: QueryStats::default(),
        }
    }

    /// Resolve a query against the pool.
    ///
    /// Serves the cached result when every recorded column version still
    /// matches; otherwise recomputes, stores, and serves the fresh result.
    /// Returns the matching entities (ascending by id) and whether the
    /// lookup was a cache hit.
    pub fn lookup(&mut self, pool: &ComponentPool, key: QueryKey) -> (Vec<EntityId>, bool) {
        self.clock += 1;
        let clock = self.clock;

        if let Some(entry) = self.entries.get_mut(&key) {
            let valid = key
                .components()
                .iter()
                .zip(entry.versions.iter())
                .all(|(c, recorded)| pool.version(*c) == *recorded);
            if valid {
                entry.hits = entry.hits.saturating_add(1);
                entry.last_used = clock;
                self.stats.hits += 1;
                return (entry.result.clone(), true);
            }
        }

        self.stats.misses += 1;
        let versions: Vec<u64> = key.components().iter().map(|c| pool.version(*c)).collect();
        let result = compute(pool, key.components());

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            key,
            CacheEntry {
                result: result.clone(),
                versions,
                hits: 0,
                last_used: clock,
            },
        );
        (result, false)
    }

    /// Drop the entry with the fewest hits, oldest first among ties.
    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.hits, e.last_used))
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }

    /// Cumulative hit/miss statistics.
    pub fn stats(&self) -> QueryStats {
        self.stats
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry (registry reload, container stop).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Recompute a query: intersect the smallest column's member set with `has`
/// probes on the remaining components.
fn compute(pool: &ComponentPool, components: &[ComponentId]) -> Vec<EntityId> {
    let Some(&seed) = components.iter().min_by_key(|c| pool.count(**c)) else {
        return Vec::new();
    };
    let mut result: Vec<EntityId> = pool
        .all_with(seed)
        .filter(|&entity| {
            components
                .iter()
                .filter(|&&c| c != seed)
                .all(|&c| pool.has(entity, c).unwrap_or(false))
        })
        .collect();
    result.sort_unstable();
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ComponentPool;

    const A: ComponentId = ComponentId(0);
    const B: ComponentId = ComponentId(1);
    const C: ComponentId = ComponentId(2);

    fn pool_with_members() -> (ComponentPool, Vec<EntityId>) {
        let mut p = ComponentPool::new(3);
        let entities: Vec<EntityId> = (0..4).map(|_| p.create_entity()).collect();
        for &e in &entities[..3] {
            p.set(e, A, 1.0).unwrap();
            p.set(e, B, 2.0).unwrap();
        }
        p.set(entities[3], A, 1.0).unwrap();
        (p, entities)
    }

    #[test]
    fn key_is_sorted_and_deduplicated() {
        assert_eq!(QueryKey::new(&[B, A, B]), QueryKey::new(&[A, B]));
    }

    #[test]
    fn first_lookup_misses_then_hits() {
        let (p, entities) = pool_with_members();
        let mut cache = QueryCache::new();

        let (result, hit) = cache.lookup(&p, QueryKey::new(&[A, B]));
        assert!(!hit);
        assert_eq!(result, entities[..3]);

        let (result, hit) = cache.lookup(&p, QueryKey::new(&[B, A]));
        assert!(hit);
        assert_eq!(result, entities[..3]);

        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn write_to_key_component_invalidates() {
        let (mut p, entities) = pool_with_members();
        let mut cache = QueryCache::new();

        cache.lookup(&p, QueryKey::new(&[A, B]));
        p.unset(entities[0], A).unwrap();

        let (result, hit) = cache.lookup(&p, QueryKey::new(&[A, B]));
        assert!(!hit);
        assert_eq!(result, entities[1..3]);
    }

    #[test]
    fn write_to_unrelated_component_keeps_entry_valid() {
        let (mut p, entities) = pool_with_members();
        let mut cache = QueryCache::new();

        cache.lookup(&p, QueryKey::new(&[A, B]));
        p.set(entities[0], C, 5.0).unwrap();

        let (_, hit) = cache.lookup(&p, QueryKey::new(&[A, B]));
        assert!(hit);
    }

    #[test]
    fn cached_equals_recomputed() {
        let (mut p, entities) = pool_with_members();
        let mut cache = QueryCache::new();

        let (first, _) = cache.lookup(&p, QueryKey::new(&[A]));
        let (cached, hit) = cache.lookup(&p, QueryKey::new(&[A]));
        assert!(hit);
        assert_eq!(first, cached);

        // After destroy, recompute matches a fresh scan.
        p.destroy_entity(entities[1]).unwrap();
        let (fresh, hit) = cache.lookup(&p, QueryKey::new(&[A]));
        assert!(!hit);
        let expected: Vec<EntityId> = p.all_with(A).collect();
        assert_eq!(fresh, expected);
    }

    #[test]
    fn empty_key_matches_nothing() {
        let (p, _) = pool_with_members();
        let mut cache = QueryCache::new();
        let (result, _) = cache.lookup(&p, QueryKey::new(&[]));
        assert!(result.is_empty());
    }

    #[test]
    fn capacity_is_enforced_with_low_hit_eviction() {
        let mut p = ComponentPool::new(3);
        let e = p.create_entity();
        p.set(e, A, 1.0).unwrap();
        p.set(e, B, 1.0).unwrap();
        p.set(e, C, 1.0).unwrap();

        let mut cache = QueryCache::with_capacity(2);
        cache.lookup(&p, QueryKey::new(&[A]));
        cache.lookup(&p, QueryKey::new(&[A])); // A now has a hit
        cache.lookup(&p, QueryKey::new(&[B]));
        cache.lookup(&p, QueryKey::new(&[C])); // evicts B (zero hits, older than C)

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        let (_, hit) = cache.lookup(&p, QueryKey::new(&[A]));
        assert!(hit, "high-hit entry should survive eviction");
    }
}
