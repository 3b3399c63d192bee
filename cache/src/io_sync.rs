//! Write-back of evicted blocks.
//!
//! [`IoSync`] sits between a cache and a persistent store (anything that is
//! both a [`CacheLoader`] and a [`CacheRemover`]). Evicted blocks are recorded
//! as pending and queued for a pool of writer threads, so eviction never
//! waits on disk. Until a block is written, loads for its key are served from
//! the pending record.
//!
//! A key evicted again before its previous write finished gets a new
//! generation of its record. A writer removes a record only if it is still
//! the exact record it wrote, so the last state of a block is always the one
//! that ends up on disk.

use crate::config::WriteBackConfig;
use crate::error::{BuildError, Error, Result};
use crate::loader::{CacheLoader, CacheRemover};
use crate::metrics::bump;
use crate::queue::{PausableQueue, QueueOrder};
use crate::task::writer::Writers;
use crate::task::{panic_message, ThreadNames};

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::HashMap;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// One pending write. A re-eviction replaces the record with a new `Arc`, so
/// pointer identity tells a writer whether its record is still current.
#[derive(Debug)]
struct WriteEntry<D> {
  data: D,
  generation: u64,
}

#[derive(Debug)]
struct PendingWrites<K, D> {
  records: HashMap<K, Arc<WriteEntry<D>>>,
  // Keys a writer is currently persisting.
  writing: HashSet<K, ahash::RandomState>,
  failures: u64,
  last_failure: Option<Error>,
}

#[derive(Debug, Default)]
struct WriteCounters {
  writes: CachePadded<AtomicU64>,
  write_failures: CachePadded<AtomicU64>,
  coalesced: CachePadded<AtomicU64>,
  skipped_clean: CachePadded<AtomicU64>,
}

/// Point-in-time write-back counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteStats {
  /// Blocks written successfully.
  pub writes: u64,
  pub write_failures: u64,
  /// Evictions merged into a record that was still pending.
  pub coalesced: u64,
  /// Evictions dropped because the block had nothing to persist.
  pub skipped_clean: u64,
  /// Records not yet written.
  pub pending: usize,
}

struct Shared<K, V, R>
where
  R: CacheRemover<K, V>,
{
  io: Arc<R>,
  pending: Mutex<PendingWrites<K, R::Data>>,
  // Signalled after every write attempt.
  written: Condvar,
  counters: WriteCounters,
  _marker: PhantomData<fn() -> V>,
}

impl<K, V, R> Shared<K, V, R>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: 'static,
  R: CacheLoader<K, V> + CacheRemover<K, V> + 'static,
{
  /// Makes `data` the newest record of `key`.
  fn record(&self, key: K, data: R::Data) -> Arc<WriteEntry<R::Data>> {
    let mut pending = self.pending.lock();
    let generation = match pending.records.get(&key) {
      Some(previous) => {
        bump(&self.counters.coalesced);
        previous.generation + 1
      }
      None => 0,
    };
    let record = Arc::new(WriteEntry { data, generation });
    pending.records.insert(key, record.clone());
    record
  }

  /// Persists the current record for `key`, if any. Runs on a writer thread,
  /// or on the evicting thread when there are no writers. A failed write
  /// keeps the record.
  fn write_pending(&self, key: K) -> Result<()> {
    // 1. Claim the key, waiting out another writer on the same key.
    let record = {
      let mut pending = self.pending.lock();
      while pending.writing.contains(&key) {
        self.written.wait(&mut pending);
      }
      let Some(record) = pending.records.get(&key).cloned() else {
        return Ok(());
      };
      pending.writing.insert(key.clone());
      record
    };

    // 2. Write without holding any lock. A panicking store is a failed write;
    // the claim must be released either way.
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
      self.io.on_removal(key.clone(), record.data.clone())
    }))
    .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload.as_ref()).to_owned())));

    // 3. Drop the record only if nobody replaced it meanwhile.
    let mut pending = self.pending.lock();
    pending.writing.remove(&key);
    let outcome = match result {
      Ok(()) => {
        bump(&self.counters.writes);
        let current = pending
          .records
          .get(&key)
          .is_some_and(|current| Arc::ptr_eq(current, &record));
        if current {
          pending.records.remove(&key);
        } else {
          tracing::trace!(?key, generation = record.generation, "record superseded during write");
        }
        Ok(())
      }
      Err(e) => {
        bump(&self.counters.write_failures);
        tracing::warn!(?key, generation = record.generation, error = %e, "write-back failed, keeping record");
        pending.failures += 1;
        pending.last_failure = Some(e.clone());
        Err(e)
      }
    };
    drop(pending);
    self.written.notify_all();
    outcome
  }
}

/// Asynchronous, coalescing write-back in front of a persistent store.
///
/// `IoSync` is itself a [`CacheLoader`] and a [`CacheRemover`], so it slots
/// into a [`LoadingCache`](crate::LoadingCache) in place of the store it wraps.
pub struct IoSync<K, V, R>
where
  R: CacheRemover<K, V>,
{
  shared: Arc<Shared<K, V, R>>,
  // `None` when evictions are written synchronously.
  queue: Option<Arc<PausableQueue<K>>>,
  writers: Mutex<Option<Writers>>,
  invalidation: Mutex<()>,
  dirty_tracking: bool,
}

impl<K, V, R> fmt::Debug for IoSync<K, V, R>
where
  R: CacheRemover<K, V>,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IoSync")
      .field("pending", &self.shared.pending.lock().records.len())
      .field("queued", &self.queue.as_ref().map(|queue| queue.len()))
      .field("dirty_tracking", &self.dirty_tracking)
      .finish_non_exhaustive()
  }
}

/// Resumes a paused queue when dropped.
struct ResumeOnDrop<'a, K>(Option<&'a PausableQueue<K>>);

impl<K> Drop for ResumeOnDrop<'_, K> {
  fn drop(&mut self) {
    if let Some(queue) = self.0 {
      queue.resume();
    }
  }
}

impl<K, V, R> IoSync<K, V, R>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: 'static,
  R: CacheLoader<K, V> + CacheRemover<K, V> + 'static,
{
  pub fn builder() -> IoSyncBuilder {
    IoSyncBuilder::new()
  }

  /// The store behind the write-back stage.
  pub fn inner(&self) -> &Arc<R> {
    &self.shared.io
  }

  pub fn writer_threads(&self) -> usize {
    self.writers.lock().as_ref().map_or(0, Writers::len)
  }

  /// Number of blocks evicted but not yet written.
  pub fn pending_len(&self) -> usize {
    self.shared.pending.lock().records.len()
  }

  pub fn is_pending(&self, key: &K) -> bool {
    self.shared.pending.lock().records.contains_key(key)
  }

  pub fn stats(&self) -> WriteStats {
    let counters = &self.shared.counters;
    WriteStats {
      writes: counters.writes.load(Ordering::Relaxed),
      write_failures: counters.write_failures.load(Ordering::Relaxed),
      coalesced: counters.coalesced.load(Ordering::Relaxed),
      skipped_clean: counters.skipped_clean.load(Ordering::Relaxed),
      pending: self.pending_len(),
    }
  }

  /// Loads `key`, preferring a pending record over the store.
  pub fn get(&self, key: &K) -> Result<V> {
    let pending = self.shared.pending.lock().records.get(key).cloned();
    match pending {
      Some(record) => Ok(self.shared.io.reconstruct(key, record.data.clone())),
      None => self.shared.io.load(key),
    }
  }

  /// Records `data` as the latest state of `key` and queues it for writing.
  /// Blocks while the write queue is full or paused.
  ///
  /// Without writer threads the write happens here. If it fails the record
  /// stays pending: reads are served from it and `flush` retries it.
  pub fn on_removal(&self, key: K, data: R::Data) -> Result<()> {
    if self.dirty_tracking && !self.shared.io.needs_persist(&data) {
      bump(&self.shared.counters.skipped_clean);
      return Ok(());
    }

    let record = self.shared.record(key.clone(), data);
    let Some(queue) = &self.queue else {
      return self.shared.write_pending(key);
    };

    queue.put(key.clone()).inspect_err(|_| {
      // Nobody will write it; do not serve it as pending either.
      let mut pending = self.shared.pending.lock();
      if pending
        .records
        .get(&key)
        .is_some_and(|current| Arc::ptr_eq(current, &record))
      {
        pending.records.remove(&key);
      }
    })
  }

  /// Re-queues every pending record and blocks until all are written.
  /// Fails with the first write error seen while waiting.
  ///
  /// Without writer threads the records left by failed writes are retried
  /// on the calling thread.
  pub fn flush(&self) -> Result<()> {
    let Some(queue) = &self.queue else {
      let keys: Vec<K> = self.shared.pending.lock().records.keys().cloned().collect();
      let mut first_failure = None;
      for key in keys {
        if let Err(e) = self.shared.write_pending(key) {
          first_failure.get_or_insert(e);
        }
      }
      return first_failure.map_or(Ok(()), Err);
    };

    let (keys, failures_before) = {
      let pending = self.shared.pending.lock();
      let keys: Vec<K> = pending.records.keys().cloned().collect();
      (keys, pending.failures)
    };
    for key in keys {
      queue.put(key)?;
    }

    let mut pending = self.shared.pending.lock();
    loop {
      if pending.failures > failures_before {
        return Err(pending.last_failure.clone().unwrap_or(Error::Interrupted));
      }
      if pending.records.is_empty() {
        return Ok(());
      }
      if queue.is_closed() {
        return Err(Error::Shutdown);
      }
      self.shared.written.wait(&mut pending);
    }
  }

  /// Runs `discard` over the pending records and the queue. Callers pause
  /// the writers first.
  fn while_paused(
    &self,
    discard: impl FnOnce(&mut PendingWrites<K, R::Data>, Option<&PausableQueue<K>>),
  ) {
    let mut pending = self.shared.pending.lock();
    // Writes on evicting threads are not held back by the queue.
    while !pending.writing.is_empty() {
      self.shared.written.wait(&mut pending);
    }
    discard(&mut pending, self.queue.as_deref());
    drop(pending);
    self.shared.written.notify_all();
  }

  fn pause(&self) -> ResumeOnDrop<'_, K> {
    let queue = self.queue.as_deref();
    if let Some(queue) = queue {
      queue.pause();
    }
    ResumeOnDrop(queue)
  }

  /// Drops any pending write for `key` and invalidates it in the store.
  /// Waits for a write of `key` already in progress.
  pub fn invalidate(&self, key: &K) -> Result<()> {
    let _serial = self.invalidation.lock();
    let _resume = self.pause();
    self.while_paused(|pending, queue| {
      pending.records.remove(key);
      if let Some(queue) = queue {
        queue.remove(key);
      }
    });
    self.shared.io.invalidate(key)
  }

  pub fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    let _serial = self.invalidation.lock();
    let _resume = self.pause();
    self.while_paused(|pending, queue| {
      pending.records.retain(|key, _| !condition(key));
      if let Some(queue) = queue {
        queue.remove_if(|key| condition(key));
      }
    });
    self.shared.io.invalidate_if(parallelism_threshold, condition)
  }

  pub fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    let _serial = self.invalidation.lock();
    let _resume = self.pause();
    self.while_paused(|pending, queue| {
      pending.records.clear();
      if let Some(queue) = queue {
        queue.clear();
      }
    });
    self.shared.io.invalidate_all(parallelism_threshold)
  }

  /// Writes out everything still queued and stops the writers. Later
  /// evictions fail with [`Error::Shutdown`].
  pub fn shutdown(&self) {
    if let Some(queue) = &self.queue {
      queue.close();
    }
    if let Some(mut writers) = self.writers.lock().take() {
      writers.join();
      tracing::debug!(pending = self.pending_len(), "write-back stopped");
    }
  }
}

impl<K, V, R> Drop for IoSync<K, V, R>
where
  R: CacheRemover<K, V>,
{
  fn drop(&mut self) {
    if let Some(queue) = &self.queue {
      queue.close();
    }
    if let Some(mut writers) = self.writers.get_mut().take() {
      writers.join();
    }
  }
}

impl<K, V, R> CacheLoader<K, V> for IoSync<K, V, R>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: 'static,
  R: CacheLoader<K, V> + CacheRemover<K, V> + 'static,
{
  fn load(&self, key: &K) -> Result<V> {
    self.get(key)
  }
}

impl<K, V, R> CacheRemover<K, V> for IoSync<K, V, R>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: 'static,
  R: CacheLoader<K, V> + CacheRemover<K, V> + 'static,
{
  type Data = R::Data;

  fn extract(&self, value: &V) -> Self::Data {
    self.shared.io.extract(value)
  }

  fn reconstruct(&self, key: &K, data: Self::Data) -> V {
    self.shared.io.reconstruct(key, data)
  }

  fn on_removal(&self, key: K, data: Self::Data) -> Result<()> {
    IoSync::on_removal(self, key, data)
  }

  fn needs_persist(&self, data: &Self::Data) -> bool {
    self.shared.io.needs_persist(data)
  }

  fn invalidate(&self, key: &K) -> Result<()> {
    IoSync::invalidate(self, key)
  }

  fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    IoSync::invalidate_if(self, parallelism_threshold, condition)
  }

  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    IoSync::invalidate_all(self, parallelism_threshold)
  }
}

/// Builds an [`IoSync`].
#[derive(Debug, Clone)]
pub struct IoSyncBuilder {
  writer_threads: usize,
  queue_capacity: usize,
  thread_name: String,
  dirty_tracking: bool,
  order: QueueOrder,
}

impl Default for IoSyncBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl IoSyncBuilder {
  pub fn new() -> Self {
    Self::from_config(&WriteBackConfig::default())
  }

  pub fn from_config(config: &WriteBackConfig) -> Self {
    Self {
      writer_threads: config.writer_threads,
      queue_capacity: config.queue_capacity,
      thread_name: config.thread_name.clone(),
      dirty_tracking: config.dirty_tracking,
      order: QueueOrder::Fifo,
    }
  }

  /// Zero writes evicted blocks on the evicting thread.
  pub fn writer_threads(mut self, threads: usize) -> Self {
    self.writer_threads = threads;
    self
  }

  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
    self.thread_name = prefix.into();
    self
  }

  pub fn dirty_tracking(mut self, enabled: bool) -> Self {
    self.dirty_tracking = enabled;
    self
  }

  /// Order in which queued keys are written.
  pub fn order(mut self, order: QueueOrder) -> Self {
    self.order = order;
    self
  }

  pub fn build<K, V, R>(self, io: Arc<R>) -> Result<IoSync<K, V, R>>
  where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: 'static,
    R: CacheLoader<K, V> + CacheRemover<K, V> + 'static,
  {
    let shared = Arc::new(Shared {
      io,
      pending: Mutex::new(PendingWrites {
        records: HashMap::default(),
        writing: HashSet::default(),
        failures: 0,
        last_failure: None,
      }),
      written: Condvar::new(),
      counters: WriteCounters::default(),
      _marker: PhantomData,
    });

    if self.writer_threads == 0 {
      return Ok(IoSync {
        shared,
        queue: None,
        writers: Mutex::new(None),
        invalidation: Mutex::new(()),
        dirty_tracking: self.dirty_tracking,
      });
    }

    if self.queue_capacity == 0 {
      return Err(BuildError::ZeroQueueCapacity.into());
    }
    let queue = Arc::new(PausableQueue::new(
      self.queue_capacity,
      self.writer_threads,
      self.order,
    )?);
    let write = {
      let shared = shared.clone();
      // Failures are logged and kept for `flush`.
      Arc::new(move |key: K| {
        let _ = shared.write_pending(key);
      }) as Arc<dyn Fn(K) + Send + Sync>
    };
    let writers = Writers::spawn(
      self.writer_threads,
      &ThreadNames::new(self.thread_name),
      queue.clone(),
      write,
    )?;

    Ok(IoSync {
      shared,
      queue: Some(queue),
      writers: Mutex::new(Some(writers)),
      invalidation: Mutex::new(()),
      dirty_tracking: self.dirty_tracking,
    })
  }
}
