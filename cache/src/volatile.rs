//! Deadline-bounded loading.
//!
//! A [`BudgetedVolatileCache`] answers immediately with whatever it has,
//! possibly an invalid placeholder, and keeps loading the real block in the
//! background on a [`FetcherPool`](crate::FetcherPool). How long a caller may
//! block first is governed by its [`CacheHints`] and the per-priority
//! [`IoTimeBudget`](crate::IoTimeBudget).

use crate::builder::sweep_frequency;
use crate::error::Result;
use crate::loader::{CacheLoader, LoaderCache};
use crate::queue::PriorityFetchQueue;
use crate::rng::FastRng;
use crate::store::ShardedStore;
use crate::task::fetcher::FetchTask;
use crate::timing::IoStatistics;

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A value that may be a placeholder for data that is still loading.
pub trait Volatile {
  fn is_valid(&self) -> bool;
}

impl<T: Volatile + ?Sized> Volatile for Arc<T> {
  fn is_valid(&self) -> bool {
    (**self).is_valid()
  }
}

/// A loader that can also produce an invalid placeholder without I/O.
pub trait VolatileCacheLoader<K, V>: CacheLoader<K, V> {
  fn create_invalid(&self, key: &K) -> Result<V>;
}

/// How hard a lookup may try to produce a valid value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LoadingStrategy {
  /// Load on the calling thread.
  #[default]
  Blocking,
  /// Queue a background load, then wait for it as long as the priority's time
  /// budget allows.
  Budgeted,
  /// Queue a background load and return immediately.
  BestEffort,
  /// Never queue a load.
  DontLoad,
}

/// Per-call loading hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CacheHints {
  pub strategy: LoadingStrategy,
  /// Fetch queue level; 0 is served first.
  pub priority: usize,
  pub enqueue_to_front: bool,
}

impl CacheHints {
  pub const fn new(strategy: LoadingStrategy, priority: usize, enqueue_to_front: bool) -> Self {
    Self {
      strategy,
      priority,
      enqueue_to_front,
    }
  }

  pub const fn blocking() -> Self {
    Self::new(LoadingStrategy::Blocking, 0, false)
  }

  pub const fn budgeted(priority: usize) -> Self {
    Self::new(LoadingStrategy::Budgeted, priority, false)
  }

  pub const fn best_effort(priority: usize) -> Self {
    Self::new(LoadingStrategy::BestEffort, priority, false)
  }

  pub const fn dont_load() -> Self {
    Self::new(LoadingStrategy::DontLoad, 0, false)
  }

  pub const fn to_front(mut self) -> Self {
    self.enqueue_to_front = true;
    self
  }
}

/// Load state of a key in a [`BudgetedVolatileCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
  NotLoaded,
  /// A placeholder is out; the real value has not arrived.
  Invalid,
  Valid,
}

struct EntryState<K, V> {
  value: Weak<V>,
  validity: Validity,
  // Frame of the last enqueue, -1 if never queued.
  enqueue_frame: i64,
  loader: Option<Arc<dyn VolatileCacheLoader<K, V>>>,
}

impl<K, V> EntryState<K, V> {
  /// Forgets a value nobody holds any more. A collected valid value makes
  /// the key loadable again right away.
  fn refresh(&mut self) {
    if self.validity != Validity::NotLoaded && self.value.strong_count() == 0 {
      if self.validity == Validity::Valid {
        self.enqueue_frame = -1;
      }
      self.validity = Validity::NotLoaded;
      self.value = Weak::new();
    }
  }

  /// True once nothing holds the value and no load is queued.
  fn is_dead(&mut self) -> bool {
    self.refresh();
    self.validity == Validity::NotLoaded && self.loader.is_none()
  }

  fn valid_value(&mut self) -> Option<Arc<V>> {
    self.refresh();
    match self.validity {
      Validity::Valid => self.value.upgrade(),
      _ => None,
    }
  }
}

struct VolatileEntry<K, V> {
  state: Mutex<EntryState<K, V>>,
  changed: Condvar,
}

impl<K, V: Volatile> VolatileEntry<K, V> {
  fn new() -> Self {
    Self {
      state: Mutex::new(EntryState {
        value: Weak::new(),
        validity: Validity::NotLoaded,
        enqueue_frame: -1,
        loader: None,
      }),
      changed: Condvar::new(),
    }
  }

  /// Records a value from the backing cache. Valid values release the
  /// loader and wake every waiter.
  fn publish(&self, value: &Arc<V>) {
    let mut state = self.state.lock();
    state.value = Arc::downgrade(value);
    if value.is_valid() {
      state.validity = Validity::Valid;
      state.loader = None;
      drop(state);
      self.changed.notify_all();
    } else {
      state.validity = Validity::Invalid;
    }
  }

  /// Waits once, at most until `deadline`, for the queued load to finish.
  /// Waiters are only woken by a valid value or a failed load.
  fn wait_valid(&self, deadline: Instant) {
    let mut state = self.state.lock();
    if state.validity != Validity::Valid && state.loader.is_some() {
      let _ = self.changed.wait_until(&mut state, deadline);
    }
  }
}

/// True if `entry` is dead and referenced by nobody beyond `holders`
/// (the map plus the caller). Call with the shard write-locked so no new
/// reference can appear meanwhile.
fn is_unused<K, V>(entry: &Arc<VolatileEntry<K, V>>, holders: usize) -> bool {
  Arc::strong_count(entry) <= holders && entry.state.lock().is_dead()
}

type EntryMap<K, V> = ShardedStore<K, Arc<VolatileEntry<K, V>>, ahash::RandomState>;

struct Shared<K, V, B> {
  entries: EntryMap<K, V>,
  backing: B,
  queue: Arc<PriorityFetchQueue<FetchTask>>,
  statistics: Arc<IoStatistics>,
  rng: FastRng,
  sweep_chance: u32,
}

impl<K, V, B> Shared<K, V, B>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Volatile + Send + Sync + 'static,
  B: LoaderCache<K, V> + 'static,
{
  /// Runs on a fetcher thread.
  fn fetch(&self, key: &K, entry: &VolatileEntry<K, V>) -> Result<()> {
    let loader = {
      let mut state = entry.state.lock();
      if state.valid_value().is_some() {
        return Ok(());
      }
      match &state.loader {
        Some(loader) => loader.clone(),
        None => return Ok(()),
      }
    };

    let load = |key: &K| loader.load(key);
    match self.backing.get(key, &load) {
      Ok(value) => {
        entry.publish(&value);
        Ok(())
      }
      Err(e) => {
        // Let the next request queue it again.
        let mut state = entry.state.lock();
        state.enqueue_frame = -1;
        state.loader = None;
        drop(state);
        entry.changed.notify_all();
        Err(e)
      }
    }
  }
}

/// A cache over a backing [`LoaderCache`] that never blocks longer than the
/// caller's strategy and time budget allow.
pub struct BudgetedVolatileCache<K, V, B> {
  shared: Arc<Shared<K, V, B>>,
}

impl<K: Eq + Hash, V, B> fmt::Debug for BudgetedVolatileCache<K, V, B> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BudgetedVolatileCache")
      .field("entries", &self.shared.entries.len())
      .field("queue", &self.shared.queue)
      .finish_non_exhaustive()
  }
}

impl<K, V, B> BudgetedVolatileCache<K, V, B>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: Volatile + Send + Sync + 'static,
  B: LoaderCache<K, V> + 'static,
{
  /// Background loads go to `queue`; budgeted waits are charged to the time
  /// budget of `statistics`.
  pub fn new(
    backing: B,
    queue: Arc<PriorityFetchQueue<FetchTask>>,
    statistics: Arc<IoStatistics>,
  ) -> Self {
    let shards = (num_cpus::get() * 4).max(1);
    Self::with_shards(backing, queue, statistics, shards, sweep_frequency::RESPONSIVE)
  }

  /// Like [`new`](Self::new), with an explicit shard count for the key map
  /// and how many lookups pass on average between sweeps of dead keys.
  pub fn with_shards(
    backing: B,
    queue: Arc<PriorityFetchQueue<FetchTask>>,
    statistics: Arc<IoStatistics>,
    shards: usize,
    loads_per_sweep: u32,
  ) -> Self {
    let shards = shards.max(1).next_power_of_two();
    Self {
      shared: Arc::new(Shared {
        entries: ShardedStore::new(shards, ahash::RandomState::new()),
        backing,
        queue,
        statistics,
        rng: FastRng::new(shards as u64 ^ 0xB5AD_4ECE_DA1C_E2A9),
        sweep_chance: sweep_frequency::to_chance(loads_per_sweep),
      }),
    }
  }

  pub fn backing(&self) -> &B {
    &self.shared.backing
  }

  pub fn statistics(&self) -> &Arc<IoStatistics> {
    &self.shared.statistics
  }

  /// Number of keys tracked, including ones not yet swept.
  pub fn len(&self) -> usize {
    self.shared.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lookup(&self, key: &K) -> Option<Arc<VolatileEntry<K, V>>> {
    self.shared.entries.get_shard(key).read().get(key).cloned()
  }

  fn entry(&self, key: &K) -> Arc<VolatileEntry<K, V>> {
    if let Some(entry) = self.lookup(key) {
      return entry;
    }
    self
      .shared
      .entries
      .get_shard(key)
      .write()
      .entry(key.clone())
      .or_insert_with(|| Arc::new(VolatileEntry::new()))
      .clone()
  }

  /// Drops the dead entries of one shard.
  fn sweep_shard(&self, index: usize) -> usize {
    let mut shard = self.shared.entries.shards[index].write();
    let before = shard.len();
    shard.retain(|_, entry| !is_unused(entry, 1));
    before - shard.len()
  }

  fn maybe_sweep(&self, key: &K) {
    if self.shared.sweep_chance == 0 || !self.shared.rng.should_run(self.shared.sweep_chance) {
      return;
    }
    let swept = self.sweep_shard(self.shared.entries.shard_index(key));
    if swept > 0 {
      tracing::trace!(swept, "swept dead volatile entries");
    }
  }

  /// Removes the entry of `key` if it died, so a key that is looked up and
  /// then dropped leaves nothing behind.
  fn prune(&self, key: &K, entry: &Arc<VolatileEntry<K, V>>) {
    if !entry.state.lock().is_dead() {
      return;
    }
    let mut shard = self.shared.entries.get_shard(key).write();
    let same = shard
      .get(key)
      .is_some_and(|current| Arc::ptr_eq(current, entry) && is_unused(current, 2));
    if same {
      shard.remove(key);
    }
  }

  /// Returns the value for `key` as far as `hints` allow. The result may be
  /// an invalid placeholder unless the strategy is blocking.
  pub fn get(
    &self,
    key: &K,
    loader: Arc<dyn VolatileCacheLoader<K, V>>,
    hints: CacheHints,
  ) -> Result<Arc<V>> {
    let entry = self.entry(key);
    self.maybe_sweep(key);
    if let Some(value) = entry.state.lock().valid_value() {
      return Ok(value);
    }

    let result = self.get_with(key, &entry, loader, hints);
    if result.is_err() {
      self.prune(key, &entry);
    }
    result
  }

  fn get_with(
    &self,
    key: &K,
    entry: &Arc<VolatileEntry<K, V>>,
    loader: Arc<dyn VolatileCacheLoader<K, V>>,
    hints: CacheHints,
  ) -> Result<Arc<V>> {
    match hints.strategy {
      LoadingStrategy::Blocking => {
        let load = |key: &K| loader.load(key);
        let value = self.shared.backing.get(key, &load)?;
        entry.publish(&value);
        Ok(value)
      }
      LoadingStrategy::Budgeted => {
        if let Some(value) = self.from_backing(key, entry) {
          return Ok(value);
        }
        self.enqueue(key, entry, &loader, hints)?;
        let budget = self.shared.statistics.time_budget();
        let time_left = budget.time_left(hints.priority);
        if !time_left.is_zero() {
          let started = Instant::now();
          entry.wait_valid(started + time_left);
          budget.use_time(started.elapsed(), hints.priority);
        }
        if let Some(value) = entry.state.lock().valid_value() {
          return Ok(value);
        }
        self.placeholder(key, entry, &*loader)
      }
      LoadingStrategy::BestEffort => {
        if let Some(value) = self.from_backing(key, entry) {
          return Ok(value);
        }
        self.enqueue(key, entry, &loader, hints)?;
        self.placeholder(key, entry, &*loader)
      }
      LoadingStrategy::DontLoad => {
        if let Some(value) = self.from_backing(key, entry) {
          return Ok(value);
        }
        self.placeholder(key, entry, &*loader)
      }
    }
  }

  fn from_backing(&self, key: &K, entry: &VolatileEntry<K, V>) -> Option<Arc<V>> {
    let value = self.shared.backing.get_if_present(key)?;
    entry.publish(&value);
    Some(value)
  }

  /// Returns the live value of the entry, or hands out a new placeholder.
  fn placeholder(
    &self,
    key: &K,
    entry: &VolatileEntry<K, V>,
    loader: &dyn VolatileCacheLoader<K, V>,
  ) -> Result<Arc<V>> {
    let mut state = entry.state.lock();
    state.refresh();
    if let Some(value) = state.value.upgrade() {
      return Ok(value);
    }
    let value = Arc::new(loader.create_invalid(key)?);
    state.value = Arc::downgrade(&value);
    state.validity = Validity::Invalid;
    Ok(value)
  }

  /// Queues a background load unless the entry is valid or was already
  /// queued in the current frame.
  fn enqueue(
    &self,
    key: &K,
    entry: &Arc<VolatileEntry<K, V>>,
    loader: &Arc<dyn VolatileCacheLoader<K, V>>,
    hints: CacheHints,
  ) -> Result<()> {
    let frame = self.shared.queue.current_frame() as i64;
    {
      let mut state = entry.state.lock();
      if state.valid_value().is_some() || state.enqueue_frame >= frame {
        return Ok(());
      }
      state.enqueue_frame = frame;
      state.loader = Some(loader.clone());
    }

    let task = {
      let shared = self.shared.clone();
      let key = key.clone();
      let entry = entry.clone();
      FetchTask::new(format!("{:?}", key), move || shared.fetch(&key, &entry))
    };
    self
      .shared
      .queue
      .put(task, hints.priority, hints.enqueue_to_front)
      .inspect_err(|_| {
        let mut state = entry.state.lock();
        state.enqueue_frame = -1;
        state.loader = None;
      })
  }

  /// Load state of `key`. A dead entry found here is dropped.
  pub fn validity(&self, key: &K) -> Validity {
    let Some(entry) = self.lookup(key) else {
      return Validity::NotLoaded;
    };
    let validity = {
      let mut state = entry.state.lock();
      state.refresh();
      state.validity
    };
    self.prune(key, &entry);
    validity
  }

  /// Returns the live value for `key`, valid or not, without loading.
  pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
    let entry = self.lookup(key)?;
    let value = entry.state.lock().value.upgrade();
    if value.is_none() {
      self.prune(key, &entry);
    }
    value
  }

  /// Drops entries whose value is gone and that have no load queued.
  pub fn clean_up(&self) -> usize {
    (0..self.shared.entries.shards.len())
      .map(|index| self.sweep_shard(index))
      .sum()
  }

  pub fn invalidate(&self, key: &K) -> Result<()> {
    self.shared.entries.get_shard(key).write().remove(key);
    self.shared.backing.invalidate(key)
  }

  pub fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    for shard in self.shared.entries.iter_shards() {
      shard.write().retain(|key, _| !condition(key));
    }
    self
      .shared
      .backing
      .invalidate_if(parallelism_threshold, condition)
  }

  pub fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    for shard in self.shared.entries.iter_shards() {
      shard.write().clear();
    }
    self.shared.backing.invalidate_all(parallelism_threshold)
  }
}
