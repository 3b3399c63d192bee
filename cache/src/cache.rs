use crate::entry::{Acquired, CacheEntry, LoadGuard};
use crate::error::Result;
use crate::loader::{CacheLoader, LoaderCache};
use crate::metrics::{bump, Metrics, MetricsSnapshot};
use crate::policy::{Residency, ResidencyPolicy, Victims};
use crate::removal::{Discard, RemovalReason, RemovalSink};
use crate::rng::FastRng;
use crate::store::ShardedStore;
use crate::CacheBuilder;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "bulk")]
use rayon::prelude::*;

type EntryRef<V, S, K> = Arc<CacheEntry<V, <S as RemovalSink<K, V>>::Data>>;

/// A concurrent cache that loads each missing key at most once at a time.
///
/// Lookups for different keys never wait on each other's loads. Lookups for
/// the same key share a single loader invocation and all see its value or its
/// error. What happens to a value after it is loaded is decided by the
/// cache's [`Residency`] and its [`RemovalSink`].
pub struct LoadingCache<K, V, S = Discard, H = ahash::RandomState>
where
  S: RemovalSink<K, V>,
{
  store: ShardedStore<K, EntryRef<V, S, K>, H>,
  policy: Box<dyn ResidencyPolicy<K, V>>,
  residency: Residency,
  sink: S,
  metrics: Metrics,
  rng: FastRng,
  sweep_chance: u32,
}

impl<K, V, S, H> fmt::Debug for LoadingCache<K, V, S, H>
where
  S: RemovalSink<K, V>,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoadingCache")
      .field("residency", &self.residency)
      .field("tracked", &self.policy.tracked())
      .field("store", &self.store)
      .field("sweep_chance", &self.sweep_chance)
      .finish_non_exhaustive()
  }
}

impl<K, V> LoadingCache<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  /// Returns a builder for a cache that drops values leaving memory.
  pub fn builder() -> CacheBuilder<K, V> {
    CacheBuilder::new()
  }
}

impl<K, V, S, H> LoadingCache<K, V, S, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  S: RemovalSink<K, V>,
  H: BuildHasher + Clone + Send + Sync,
{
  pub(crate) fn from_parts(
    residency: Residency,
    sink: S,
    num_shards: usize,
    hasher: H,
    sweep_chance: u32,
  ) -> Self {
    Self {
      store: ShardedStore::new(num_shards, hasher),
      policy: crate::policy::for_residency(residency),
      residency,
      sink,
      metrics: Metrics::new(),
      rng: FastRng::new(num_shards as u64 ^ 0x5DEECE66D),
      sweep_chance,
    }
  }

  pub fn residency(&self) -> Residency {
    self.residency
  }

  /// The sink values are handed to when they leave memory.
  pub fn sink(&self) -> &S {
    &self.sink
  }

  /// Returns the value for `key` if it is resident, without loading it.
  pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
    let entry = self.store.get_shard(key).read().get(key).cloned()?;
    let value = entry.peek()?;
    bump(&self.metrics.hits);
    self.policy.on_access(key, &value);
    Some(value)
  }

  /// Returns the value for `key`, running `loader` if it is not resident.
  ///
  /// If another thread is already loading `key`, this call waits for that
  /// load instead of starting its own.
  pub fn get(&self, key: &K, loader: &dyn CacheLoader<K, V>) -> Result<Arc<V>> {
    loop {
      let entry = self.entry_for(key);
      match entry.acquire()? {
        Acquired::Hit(value) => {
          bump(&self.metrics.hits);
          self.policy.on_access(key, &value);
          return Ok(value);
        }
        Acquired::Retired => continue,
        Acquired::Leader { attempt, released } => {
          if let Some(data) = released {
            // The previous incarnation must reach the sink before the loader
            // can look for it there.
            bump(&self.metrics.collected);
            self.hand_off(key.clone(), data, RemovalReason::Collected);
          }
          return self.load(key, &entry, attempt, loader);
        }
      }
    }
  }

  fn load(
    &self,
    key: &K,
    entry: &CacheEntry<V, S::Data>,
    attempt: u64,
    loader: &dyn CacheLoader<K, V>,
  ) -> Result<Arc<V>> {
    bump(&self.metrics.misses);
    let guard = LoadGuard::new(entry, attempt);
    let started = Instant::now();
    let outcome = loader.load(key);
    self
      .metrics
      .load_nanos
      .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

    match outcome {
      Ok(value) => {
        let value = Arc::new(value);
        let data = self.sink.capture(&value);
        // Admit while the entry is still loading: an invalidation waits for
        // the load, so its `on_remove` cannot run before this.
        let victims = self.policy.on_admit(key, &value);
        guard.complete(self.policy.hold(&value), data);
        bump(&self.metrics.loads);

        if !victims.is_empty() {
          self.release(victims);
        }
        self.maybe_sweep(key);
        Ok(value)
      }
      Err(error) => {
        tracing::debug!(attempt, error = %error, "block load failed");
        bump(&self.metrics.load_failures);
        guard.fail(error.clone());
        Err(error)
      }
    }
  }

  /// Finds the live entry for `key`, mapping a fresh one if needed.
  fn entry_for(&self, key: &K) -> EntryRef<V, S, K> {
    let shard = self.store.get_shard(key);
    if let Some(entry) = shard.read().get(key) {
      if !entry.is_retired() {
        return entry.clone();
      }
    }

    let mut guard = shard.write();
    match guard.get(key) {
      Some(entry) if !entry.is_retired() => entry.clone(),
      _ => {
        let entry = Arc::new(CacheEntry::new());
        guard.insert(key.clone(), entry.clone());
        entry
      }
    }
  }

  /// Fences `key` against lookups for the duration of an invalidation. A key
  /// with nothing mapped gets a placeholder so no load can start meanwhile.
  fn fence(&self, key: &K) -> EntryRef<V, S, K> {
    loop {
      let existing = {
        let mut guard = self.store.get_shard(key).write();
        match guard.get(key) {
          Some(entry) if !entry.is_retired() => entry.clone(),
          _ => {
            let entry = Arc::new(CacheEntry::invalidating());
            guard.insert(key.clone(), entry.clone());
            return entry;
          }
        }
      };
      // Waiting on an in-flight load must happen outside the shard lock.
      if existing.begin_invalidate() {
        return existing;
      }
    }
  }

  fn remove_if_same(&self, key: &K, entry: &EntryRef<V, S, K>) {
    let mut guard = self.store.get_shard(key).write();
    if guard.get(key).is_some_and(|current| Arc::ptr_eq(current, entry)) {
      guard.remove(key);
    }
  }

  fn hand_off(&self, key: K, data: S::Data, reason: RemovalReason) {
    bump(&self.metrics.hand_offs);
    self.sink.hand_off(key, data, reason);
  }

  /// Moves policy victims out of memory. Returns how many values left.
  fn release(&self, victims: Victims<K>) -> usize {
    let reason = if victims.retire {
      RemovalReason::Capacity
    } else {
      RemovalReason::Reclaimed
    };
    let mut released = 0;
    for key in victims.keys {
      let found = self.store.get_shard(&key).read().get(&key).cloned();
      let Some(entry) = found else { continue };
      let Some(data) = entry.begin_release(false) else {
        continue;
      };
      self.hand_off(key.clone(), data, reason);
      entry.finish_release(victims.retire);
      if victims.retire {
        self.remove_if_same(&key, &entry);
        bump(&self.metrics.evictions);
      } else {
        bump(&self.metrics.reclaims);
      }
      released += 1;
    }
    released
  }

  fn snapshot_shard(&self, index: usize) -> Vec<(K, EntryRef<V, S, K>)> {
    self.store.shards[index]
      .read()
      .iter()
      .map(|(key, entry)| (key.clone(), entry.clone()))
      .collect()
  }

  fn snapshot_matching(
    &self,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Vec<(K, EntryRef<V, S, K>)> {
    let mut entries = Vec::new();
    for shard in self.store.iter_shards() {
      let guard = shard.read();
      entries.extend(
        guard
          .iter()
          .filter(|(key, _)| condition(key))
          .map(|(key, entry)| (key.clone(), entry.clone())),
      );
    }
    entries
  }

  fn sweep_shard(&self, index: usize) -> usize {
    let mut collected = 0;
    for (key, entry) in self.snapshot_shard(index) {
      if let Some(data) = entry.begin_release(true) {
        self.hand_off(key.clone(), data, RemovalReason::Collected);
        entry.finish_release(true);
        self.remove_if_same(&key, &entry);
        bump(&self.metrics.collected);
        collected += 1;
      }
    }
    collected
  }

  fn maybe_sweep(&self, key: &K) {
    if !matches!(self.residency, Residency::Weak { .. }) || self.sweep_chance == 0 {
      return;
    }
    if self.rng.should_run(self.sweep_chance) {
      let collected = self.sweep_shard(self.store.shard_index(key));
      if collected > 0 {
        tracing::trace!(collected, "swept collected blocks");
      }
    }
  }

  /// Hands off every weakly held value that is no longer referenced and drops
  /// its mapping. Returns how many were found.
  pub fn clean_up(&self) -> usize {
    (0..self.store.shards.len())
      .map(|index| self.sweep_shard(index))
      .sum()
  }

  /// Releases least recently used values until at most `keep` remain in
  /// memory, handing each one to the sink. Reclaimable caches keep the key
  /// mapped; bounded caches drop it; weak caches unpin retained values and
  /// sweep whatever died as a result.
  pub fn reclaim(&self, keep: usize) -> usize {
    let released = self.release(self.policy.shrink_to(keep));
    match self.residency {
      Residency::Weak { .. } => released + self.clean_up(),
      _ => released,
    }
  }

  pub fn reclaim_all(&self) -> usize {
    self.reclaim(0)
  }

  /// Hands a copy of the resident value for `key` to the sink while keeping
  /// it in memory. Returns `false` if nothing is resident.
  pub fn persist(&self, key: &K) -> bool {
    let found = self.store.get_shard(key).read().get(key).cloned();
    match found.and_then(|entry| entry.data()) {
      Some(data) => {
        self.hand_off(key.clone(), data, RemovalReason::Persist);
        true
      }
      None => false,
    }
  }

  pub fn persist_if(&self, condition: &(dyn Fn(&K) -> bool + Sync)) -> usize {
    let mut persisted = 0;
    for (key, entry) in self.snapshot_matching(condition) {
      if let Some(data) = entry.data() {
        self.hand_off(key, data, RemovalReason::Persist);
        persisted += 1;
      }
    }
    persisted
  }

  pub fn persist_all(&self) -> usize {
    self.persist_if(&|_| true)
  }

  /// Removes `key` from memory, then discards its durable state through the
  /// sink. Lookups for `key` block until both are done.
  pub fn invalidate(&self, key: &K) -> Result<()> {
    let entry = self.fence(key);
    self.policy.on_remove(key);
    bump(&self.metrics.invalidations);

    let result = self.sink.invalidate(key);
    entry.finish_release(true);
    self.remove_if_same(key, &entry);
    result
  }

  /// Removes every key matching `condition`. With more than
  /// `parallelism_threshold` matches, in-flight loads are waited out in
  /// parallel.
  pub fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    let fenced = self.fence_all(self.snapshot_matching(condition), parallelism_threshold);
    let result = self.sink.invalidate_if(parallelism_threshold, condition);
    self.retire_all(fenced);
    result
  }

  pub fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    let fenced = self.fence_all(self.snapshot_matching(&|_| true), parallelism_threshold);
    let result = self.sink.invalidate_all(parallelism_threshold);
    self.retire_all(fenced);
    result
  }

  fn fence_all(
    &self,
    entries: Vec<(K, EntryRef<V, S, K>)>,
    parallelism_threshold: usize,
  ) -> Vec<(K, EntryRef<V, S, K>)> {
    fence_entries(entries, parallelism_threshold)
  }

  fn retire_all(&self, fenced: Vec<(K, EntryRef<V, S, K>)>) {
    for (key, entry) in fenced {
      self.policy.on_remove(&key);
      entry.finish_release(true);
      self.remove_if_same(&key, &entry);
      bump(&self.metrics.invalidations);
    }
  }

  /// Number of keys currently mapped, resident or not.
  pub fn len(&self) -> usize {
    self.store.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Number of values currently alive in memory.
  pub fn resident(&self) -> usize {
    self
      .store
      .iter_shards()
      .map(|shard| {
        shard
          .read()
          .values()
          .filter(|entry| entry.peek().is_some())
          .count()
      })
      .sum()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot(self.resident())
  }
}

/// Fences every entry, waiting out in-flight loads. Entries retired meanwhile
/// are dropped from the result.
#[cfg(feature = "bulk")]
fn fence_entries<K, V, D>(
  entries: Vec<(K, Arc<CacheEntry<V, D>>)>,
  parallelism_threshold: usize,
) -> Vec<(K, Arc<CacheEntry<V, D>>)>
where
  K: Send,
  V: Send + Sync,
  D: Send + Sync,
{
  if entries.len() > parallelism_threshold {
    entries
      .into_par_iter()
      .filter(|(_, entry)| entry.begin_invalidate())
      .collect()
  } else {
    entries
      .into_iter()
      .filter(|(_, entry)| entry.begin_invalidate())
      .collect()
  }
}

#[cfg(not(feature = "bulk"))]
fn fence_entries<K, V, D>(
  entries: Vec<(K, Arc<CacheEntry<V, D>>)>,
  _parallelism_threshold: usize,
) -> Vec<(K, Arc<CacheEntry<V, D>>)> {
  entries
    .into_iter()
    .filter(|(_, entry)| entry.begin_invalidate())
    .collect()
}

impl<K, V, S, H> LoaderCache<K, V> for LoadingCache<K, V, S, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  S: RemovalSink<K, V>,
  H: BuildHasher + Clone + Send + Sync,
{
  fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
    LoadingCache::get_if_present(self, key)
  }

  fn get(&self, key: &K, loader: &dyn CacheLoader<K, V>) -> Result<Arc<V>> {
    LoadingCache::get(self, key, loader)
  }

  fn invalidate(&self, key: &K) -> Result<()> {
    LoadingCache::invalidate(self, key)
  }

  fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    LoadingCache::invalidate_if(self, parallelism_threshold, condition)
  }

  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    LoadingCache::invalidate_all(self, parallelism_threshold)
  }
}
