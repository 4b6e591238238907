//! Fixed-shard concurrent map for per-stream and per-file metadata.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const SHARDS: usize = 64;

pub struct ShardedMap<K, V> {
    shards: [RwLock<HashMap<K, V>>; SHARDS],
}

impl<K: Hash + Eq, V: Clone> ShardedMap<K, V> {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARDS]
    }

    fn read_shard<'a>(lock: &'a RwLock<HashMap<K, V>>) -> RwLockReadGuard<'a, HashMap<K, V>> {
        match lock.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_shard<'a>(lock: &'a RwLock<HashMap<K, V>>) -> RwLockWriteGuard<'a, HashMap<K, V>> {
        match lock.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        Self::read_shard(self.shard(key)).get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        Self::write_shard(self.shard(&key)).insert(key, value);
    }

    pub fn remove(&self, key: &K) {
        Self::write_shard(self.shard(key)).remove(key);
    }
}

impl<K: Hash + Eq, V: Clone> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
