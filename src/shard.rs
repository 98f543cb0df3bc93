// TideFS Sharding — hashed lock and map shards shared by the cache and ledger
//
// Both the identity cache and the quota record table are process-wide maps
// with heavy concurrent traffic on disjoint keys. Instead of one global lock,
// state is split across `id % N` shards so unrelated ids never contend.

use crate::sync::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;

/// Default shard count for id-keyed state. Must be a power of two.
pub const DEFAULT_SHARDS: usize = 64;

#[inline]
fn shard_index(id: u64, len: usize) -> usize {
    debug_assert!(len.is_power_of_two());
    (id as usize) & (len - 1)
}

// ============================================================================
// ID LOCK TABLE
// ============================================================================

/// Fixed table of mutexes keyed by `id % N`. Holding the lock for an id
/// serializes every slow-path operation on that id (and, incidentally, on
/// the other ids sharing its slot) without a lock allocation per id.
pub struct IdLocks {
    locks: Box<[Mutex<()>]>,
}

impl IdLocks {
    pub fn new(count: usize) -> Self {
        let count = count.next_power_of_two().max(1);
        Self {
            locks: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Acquire the slot lock covering `id`, blocking behind any holder.
    pub fn lock(&self, id: u64) -> MutexGuard<'_, ()> {
        self.locks[shard_index(id, self.locks.len())].lock()
    }
}

impl Default for IdLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

// ============================================================================
// SHARDED MAP
// ============================================================================

/// Concurrent map from u64 ids to cloneable values, sharded by `id % N`.
/// Presence in the map carries no ownership semantics of its own.
pub struct ShardedMap<V> {
    shards: Box<[RwLock<HashMap<u64, V>>]>,
}

impl<V: Clone> ShardedMap<V> {
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.next_power_of_two().max(1);
        Self {
            shards: (0..count).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    #[inline]
    fn shard(&self, id: u64) -> &RwLock<HashMap<u64, V>> {
        &self.shards[shard_index(id, self.shards.len())]
    }

    pub fn get(&self, id: u64) -> Option<V> {
        self.shard(id).read().get(&id).cloned()
    }

    pub fn insert(&self, id: u64, value: V) -> Option<V> {
        self.shard(id).write().insert(id, value)
    }

    /// Insert `value` unless another thread won the race; either way the
    /// value now in the map is returned.
    pub fn get_or_insert(&self, id: u64, value: V) -> V {
        let mut shard = self.shard(id).write();
        shard.entry(id).or_insert(value).clone()
    }

    pub fn remove(&self, id: u64) -> Option<V> {
        self.shard(id).write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Snapshot of all values; taken shard by shard, so concurrent inserts
    /// may or may not be included.
    pub fn values(&self) -> Vec<V> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.read().values().cloned());
        }
        out
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<u64> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.read().keys().copied());
        }
        out
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }
}

impl<V: Clone> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sharded_map_basic() {
        let map: ShardedMap<u32> = ShardedMap::new(8);
        assert!(map.is_empty());

        assert_eq!(map.insert(7, 70), None);
        assert_eq!(map.insert(7, 71), Some(70));
        assert_eq!(map.get(7), Some(71));
        assert_eq!(map.get(8), None);
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove(7), Some(71));
        assert!(map.is_empty());
    }

    #[test]
    fn test_get_or_insert_first_wins() {
        let map: ShardedMap<u32> = ShardedMap::new(8);
        assert_eq!(map.get_or_insert(3, 30), 30);
        assert_eq!(map.get_or_insert(3, 99), 30);
    }

    #[test]
    fn test_concurrent_inserts_distinct_keys() {
        let map: Arc<ShardedMap<u64>> = Arc::new(ShardedMap::new(8));
        let mut threads = Vec::new();

        for t in 0..4u64 {
            let map = map.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..256u64 {
                    let key = t * 1000 + i;
                    map.insert(key, key * 2);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(map.len(), 4 * 256);
        assert_eq!(map.get(3 * 1000 + 17), Some((3 * 1000 + 17) * 2));
    }

    #[test]
    fn test_id_locks_cover_same_slot() {
        let locks = IdLocks::new(4);
        let g = locks.lock(0);
        // id 1 lives in a different slot, so this must not deadlock
        let _other = locks.lock(1);
        drop(g);
        let _again = locks.lock(0);
    }
}
