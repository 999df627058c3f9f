//! Bounded LRU caches.
//!
//! [`LruCache`] keeps three structures in step:
//! - `entries`: key -> current stamp
//! - `by_stamp`: stamp -> (value, key)
//! - `access_history`: stamps in access order, append-only
//!
//! Re-setting or reading a key issues a fresh stamp and appends it to the
//! history, so the history may hold stale stamps. Eviction pops from the front
//! and skips any stamp that is no longer current.

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::Hash;

use crate::backend::RawRows;

/// Default maximum number of cached entries.
pub const DEFAULT_MAX_ENTRIES: usize = 125;

/// Generic bounded key/value store with least-recently-used eviction.
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    entries: HashMap<K, u64>,
    by_stamp: HashMap<u64, (V, K)>,
    access_history: VecDeque<u64>,
    max_entries: usize,
    clock: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty cache holding at most `max_entries` entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_stamp: HashMap::new(),
            access_history: VecDeque::new(),
            max_entries: max_entries.max(1),
            clock: 0,
        }
    }

    /// Maximum number of entries kept.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Look up a key, marking it most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let stamp = self.touch(key)?;
        self.by_stamp.get(&stamp).map(|(value, _)| value)
    }

    /// Mutable lookup, marking the key most recently used.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let stamp = self.touch(key)?;
        self.by_stamp.get_mut(&stamp).map(|(value, _)| value)
    }

    /// Look up a key without refreshing its recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let stamp = self.entries.get(key)?;
        self.by_stamp.get(stamp).map(|(value, _)| value)
    }

    /// Insert or overwrite a key, then evict down to the bound.
    pub fn set(&mut self, key: K, value: V) {
        let stamp = self.next_stamp();
        if let Some(old) = self.entries.insert(key.clone(), stamp) {
            self.by_stamp.remove(&old);
        }
        self.by_stamp.insert(stamp, (value, key));
        self.access_history.push_back(stamp);
        self.evict();
        self.compact_history();
    }

    /// Remove a key, returning its value if present.
    pub fn delete<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let stamp = self.entries.remove(key)?;
        self.by_stamp.remove(&stamp).map(|(value, _)| value)
    }

    /// Check whether a key is cached. Does not refresh recency.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Iterate over `(key, value)` pairs in map order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().filter_map(move |(key, stamp)| {
            self.by_stamp.get(stamp).map(|(value, _)| (key, value))
        })
    }

    /// Mutate every value in place without refreshing recency.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.by_stamp.values_mut().map(|(value, _)| value)
    }

    /// Keep only entries for which the predicate returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let by_stamp = &mut self.by_stamp;
        self.entries.retain(|key, stamp| {
            let stamp = *stamp;
            match by_stamp.get(&stamp) {
                Some((value, _)) if keep(key, value) => true,
                _ => {
                    by_stamp.remove(&stamp);
                    false
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_stamp.clear();
        self.access_history.clear();
    }

    /// Number of recency records, stale ones included.
    #[cfg(test)]
    pub(crate) fn history_len(&self) -> usize {
        self.access_history.len()
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Re-stamp an existing key and return the new stamp.
    fn touch<Q>(&mut self, key: &Q) -> Option<u64>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let old = *self.entries.get(key)?;
        let stamp = self.next_stamp();
        let entry = self.by_stamp.remove(&old)?;
        if let Some(current) = self.entries.get_mut(key) {
            *current = stamp;
        }
        self.by_stamp.insert(stamp, entry);
        self.access_history.push_back(stamp);
        self.compact_history();
        Some(stamp)
    }

    fn evict(&mut self) {
        while self.by_stamp.len() > self.max_entries {
            let Some(stamp) = self.access_history.pop_front() else {
                break;
            };
            // Stale record: the key was re-stamped or deleted since.
            let Some((_, key)) = self.by_stamp.remove(&stamp) else {
                continue;
            };
            if self.entries.get(&key) == Some(&stamp) {
                self.entries.remove(&key);
                tracing::trace!(max_entries = self.max_entries, "cache entry evicted");
            }
        }
    }

    fn compact_history(&mut self) {
        let limit = self.max_entries.saturating_mul(2).max(16);
        if self.access_history.len() > limit {
            let by_stamp = &self.by_stamp;
            self.access_history.retain(|stamp| by_stamp.contains_key(stamp));
        }
    }
}

/// A cached statement result tagged with the tables it reads.
#[derive(Debug, Clone)]
struct CachedStatement {
    rows: RawRows,
    tables: BTreeSet<String>,
}

/// Database-level cache of read results keyed by rendered SQL text.
///
/// Entries are invalidated by table membership: a write against `t` drops
/// every cached statement whose table set contains `t`.
#[derive(Debug, Clone)]
pub struct StatementCache {
    inner: LruCache<String, CachedStatement>,
}

impl StatementCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: LruCache::new(max_entries),
        }
    }

    pub fn get(&mut self, sql: &str) -> Option<RawRows> {
        self.inner.get(sql).map(|cached| cached.rows.clone())
    }

    pub fn insert(&mut self, sql: String, tables: BTreeSet<String>, rows: RawRows) {
        self.inner.set(sql, CachedStatement { rows, tables });
    }

    /// Drop all statements reading any of `tables`. Returns how many were dropped.
    pub fn invalidate<'a>(&mut self, tables: impl IntoIterator<Item = &'a String>) -> usize {
        let tables: Vec<&String> = tables.into_iter().collect();
        let before = self.inner.len();
        self.inner
            .retain(|_, cached| !tables.iter().any(|t| cached.tables.contains(*t)));
        before - self.inner.len()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_keeps_most_recent_inserts() {
        let mut cache = LruCache::new(4);
        for i in 0..10 {
            cache.set(i, i * 10);
        }
        assert_eq!(cache.len(), 4);
        for i in 6..10 {
            assert!(cache.contains(&i), "expected key {i} to survive");
        }
        for i in 0..6 {
            assert!(!cache.contains(&i));
        }
    }

    #[test]
    fn test_read_refreshes_recency() {
        let mut cache = LruCache::new(3);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);

        assert_eq!(cache.get("a"), Some(&1));
        cache.set("d", 4);

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"), "b became least recently used");
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_peek_does_not_refresh() {
        let mut cache = LruCache::new(2);
        cache.set(1, "one");
        cache.set(2, "two");
        assert_eq!(cache.peek(&1), Some(&"one"));
        cache.set(3, "three");
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_repeated_set_is_bounded() {
        let mut cache = LruCache::new(3);
        for i in 0..1_000 {
            cache.set("same", i);
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("same"), Some(&999));
        assert!(cache.history_len() <= 16);

        cache.set("other", 0);
        cache.set("third", 0);
        cache.set("fourth", 0);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("same"));
    }

    #[test]
    fn test_stale_records_do_not_evict_live_entries() {
        let mut cache = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        // "a" gets a new stamp; its first record is now stale
        cache.set("a", 3);
        cache.set("c", 4);

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.peek("a"), Some(&3));
    }

    #[test]
    fn test_delete_and_miss() {
        let mut cache: LruCache<String, i32> = LruCache::new(5);
        assert_eq!(cache.get("missing"), None);
        assert_eq!(cache.delete("missing"), None);

        cache.set("k".to_string(), 7);
        assert_eq!(cache.delete("k"), Some(7));
        assert!(cache.is_empty());
        assert!(!cache.contains("k"));
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut cache = LruCache::new(2);
        cache.set(1, vec![1]);
        cache.get_mut(&1).unwrap().push(2);
        assert_eq!(cache.peek(&1), Some(&vec![1, 2]));
    }

    #[test]
    fn test_iter_and_retain() {
        let mut cache = LruCache::new(10);
        for i in 0..6 {
            cache.set(i, i);
        }
        let mut seen: Vec<i32> = cache.iter().map(|(k, _)| *k).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);

        cache.retain(|_, v| v % 2 == 0);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&4));
        assert!(!cache.contains(&3));
    }

    #[test]
    fn test_statement_cache_invalidates_by_table() {
        let mut cache = StatementCache::new(10);
        let rows = vec![vec![Value::Int(1)]];
        let tables = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();

        cache.insert("SELECT * FROM a".into(), tables(&["a"]), rows.clone());
        cache.insert(
            "SELECT * FROM b JOIN a ON b.x = a.y".into(),
            tables(&["a", "b"]),
            rows.clone(),
        );
        cache.insert("SELECT * FROM b".into(), tables(&["b"]), rows);

        let dropped = cache.invalidate(&[String::from("a")]);
        assert_eq!(dropped, 2);
        assert!(cache.get("SELECT * FROM a").is_none());
        assert!(cache.get("SELECT * FROM b").is_some());
    }

    #[test]
    fn test_table_name_prefix_is_not_a_match() {
        let mut cache = StatementCache::new(10);
        cache.insert(
            "SELECT * FROM stocks_archive".into(),
            BTreeSet::from(["stocks_archive".to_string()]),
            Vec::new(),
        );
        assert_eq!(cache.invalidate(&[String::from("stocks")]), 0);
        assert_eq!(cache.len(), 1);
    }
}
