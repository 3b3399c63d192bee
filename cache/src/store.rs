use core::fmt;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// A helper function to hash a key using a `BuildHasher`.
#[inline]
pub(crate) fn hash_key<K: Hash + ?Sized, H: BuildHasher>(hasher: &H, key: &K) -> u64 {
  let mut state = hasher.build_hasher();
  key.hash(&mut state);
  state.finish()
}

pub(crate) type ShardMap<K, E, H> = HashMap<K, E, H>;

/// A key→entry map partitioned into multiple, independently locked shards.
///
/// Shard locks are only held for map lookups and structural changes, never
/// while a value is being loaded or written.
pub(crate) struct ShardedStore<K, E, H> {
  pub(crate) shards: Box<[CachePadded<RwLock<ShardMap<K, E, H>>>]>,
  pub(crate) hasher: H,
}

impl<K, E, H> fmt::Debug for ShardedStore<K, E, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShardedStore")
      .field("num_shards", &self.shards.len())
      .finish()
  }
}

impl<K, E, H> ShardedStore<K, E, H>
where
  K: Eq + Hash,
  H: BuildHasher + Clone,
{
  /// Creates a new `ShardedStore` with the specified number of shards and hasher.
  /// `num_shards` must be a power of two; the builder guarantees it.
  pub(crate) fn new(num_shards: usize, hasher: H) -> Self {
    let mut shards = Vec::with_capacity(num_shards);
    for _ in 0..num_shards {
      let shard_map = HashMap::with_hasher(hasher.clone());
      shards.push(CachePadded::new(RwLock::new(shard_map)));
    }

    Self {
      shards: shards.into_boxed_slice(),
      hasher,
    }
  }

  #[inline]
  pub(crate) fn shard_index(&self, key: &K) -> usize {
    let hash = hash_key(&self.hasher, key);
    hash as usize & (self.shards.len() - 1)
  }

  /// Returns the lock guarding the shard for a given key.
  #[inline]
  pub(crate) fn get_shard(&self, key: &K) -> &RwLock<ShardMap<K, E, H>> {
    &self.shards[self.shard_index(key)]
  }

  /// Returns an iterator over all the shard locks.
  pub(crate) fn iter_shards(&self) -> impl Iterator<Item = &RwLock<ShardMap<K, E, H>>> {
    self.shards.iter().map(|padded_lock| &**padded_lock)
  }

  /// Total number of entries. Takes each shard's read lock in turn, so the
  /// result is only a snapshot.
  pub(crate) fn len(&self) -> usize {
    self.iter_shards().map(|shard| shard.read().len()).sum()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn keys_spread_over_power_of_two_shards() {
    let store: ShardedStore<u64, u64, ahash::RandomState> =
      ShardedStore::new(8, ahash::RandomState::new());
    for key in 0..64u64 {
      let index = store.shard_index(&key);
      assert!(index < 8);
      store.get_shard(&key).write().insert(key, key * 2);
    }
    assert_eq!(store.len(), 64);
    assert_eq!(store.get_shard(&7).read().get(&7), Some(&14));
  }
}
