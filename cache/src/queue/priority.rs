use crate::error::{BuildError, Error, Result};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

struct Levels<T> {
  levels: Vec<VecDeque<T>>,
  // Deprioritized items, oldest at the back.
  prefetch: VecDeque<T>,
  paused: bool,
  closed: bool,
  // Registered consumer threads, and how many of them are blocked in `take`.
  consumers: usize,
  parked: usize,
}

impl<T> Levels<T> {
  fn pop(&mut self) -> Option<T> {
    for level in self.levels.iter_mut() {
      if let Some(item) = level.pop_front() {
        return Some(item);
      }
    }
    self.prefetch.pop_front()
  }

  fn len(&self) -> usize {
    self.levels.iter().map(VecDeque::len).sum::<usize>() + self.prefetch.len()
  }
}

/// A multi-level priority queue with a bounded prefetch ring.
///
/// Level 0 is served first. Within a level items are taken in insertion
/// order unless they were put to the front. The prefetch ring is consulted
/// only when every level is empty.
///
/// Threads that drain the queue register with
/// [`add_consumers`](Self::add_consumers), so that [`pause`](Self::pause) can
/// wait for all of them to park. [`FetcherPool`](crate::FetcherPool) does this
/// for its workers.
pub struct PriorityFetchQueue<T> {
  inner: Mutex<Levels<T>>,
  available: Condvar,
  // Signalled when the last registered consumer parks while paused.
  all_parked: Condvar,
  prefetch_capacity: usize,
  num_levels: usize,
  current_frame: AtomicU64,
}

impl<T> fmt::Debug for PriorityFetchQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("PriorityFetchQueue")
      .field(
        "levels",
        &inner.levels.iter().map(VecDeque::len).collect::<Vec<_>>(),
      )
      .field("prefetch", &inner.prefetch.len())
      .field("prefetch_capacity", &self.prefetch_capacity)
      .field("current_frame", &self.current_frame())
      .field("paused", &inner.paused)
      .field("consumers", &inner.consumers)
      .field("parked", &inner.parked)
      .finish()
  }
}

impl<T> PriorityFetchQueue<T> {
  pub fn new(num_levels: usize, prefetch_capacity: usize) -> Result<Self, BuildError> {
    if num_levels == 0 {
      return Err(BuildError::ZeroPriorityLevels);
    }
    Ok(Self {
      inner: Mutex::new(Levels {
        levels: (0..num_levels).map(|_| VecDeque::new()).collect(),
        prefetch: VecDeque::new(),
        paused: false,
        closed: false,
        consumers: 0,
        parked: 0,
      }),
      available: Condvar::new(),
      all_parked: Condvar::new(),
      prefetch_capacity,
      num_levels,
      current_frame: AtomicU64::new(0),
    })
  }

  /// Queues `item` at `priority`, clamped to the lowest level. With
  /// `to_front` it is served before everything already on that level.
  pub fn put(&self, item: T, priority: usize, to_front: bool) -> Result<()> {
    let level = priority.min(self.num_levels - 1);
    let mut inner = self.inner.lock();
    if inner.closed {
      return Err(Error::Shutdown);
    }
    if to_front {
      inner.levels[level].push_front(item);
    } else {
      inner.levels[level].push_back(item);
    }
    drop(inner);
    self.available.notify_one();
    Ok(())
  }

  /// Blocks until an item is available and the queue is not paused.
  /// Returns `None` once the queue is closed.
  pub fn take(&self) -> Option<T> {
    let mut inner = self.inner.lock();
    loop {
      if inner.closed {
        return None;
      }
      if !inner.paused {
        if let Some(item) = inner.pop() {
          return Some(item);
        }
      }
      inner.parked += 1;
      if inner.paused && inner.parked >= inner.consumers {
        self.all_parked.notify_all();
      }
      self.available.wait(&mut inner);
      inner.parked -= 1;
    }
  }

  /// Takes an item if one is available right now.
  pub fn try_take(&self) -> Option<T> {
    let mut inner = self.inner.lock();
    if inner.closed || inner.paused {
      return None;
    }
    inner.pop()
  }

  /// Moves everything queued on the levels into the prefetch ring, ahead of
  /// what the ring already held, and starts a new frame. Items beyond the
  /// ring's capacity are dropped, oldest first.
  pub fn clear_to_prefetch(&self) {
    let mut inner = self.inner.lock();
    let mut moved: VecDeque<T> = VecDeque::with_capacity(inner.len());
    for level in inner.levels.iter_mut() {
      moved.extend(level.drain(..));
    }
    let demoted = moved.len();
    moved.extend(inner.prefetch.drain(..));
    moved.truncate(self.prefetch_capacity);
    inner.prefetch = moved;
    let frame = self.current_frame.fetch_add(1, Ordering::AcqRel) + 1;
    tracing::trace!(demoted, prefetch = inner.prefetch.len(), frame, "cleared fetch queue to prefetch");
  }

  /// The frame counter, bumped by every [`clear_to_prefetch`](Self::clear_to_prefetch).
  /// Callers use it to enqueue a key at most once per frame.
  pub fn current_frame(&self) -> u64 {
    self.current_frame.load(Ordering::Acquire)
  }

  /// Counts `count` more threads that call [`take`](Self::take).
  pub fn add_consumers(&self, count: usize) {
    self.inner.lock().consumers += count;
  }

  /// Undoes [`add_consumers`](Self::add_consumers) for threads that stopped
  /// taking.
  pub fn remove_consumers(&self, count: usize) {
    let mut inner = self.inner.lock();
    inner.consumers = inner.consumers.saturating_sub(count);
    drop(inner);
    self.all_parked.notify_all();
  }

  pub fn consumers(&self) -> usize {
    self.inner.lock().consumers
  }

  /// Stops [`take`](Self::take) from returning items and waits until every
  /// registered consumer is parked in it, so no taken item is still being
  /// handled. `put` is unaffected.
  pub fn pause(&self) {
    let mut inner = self.inner.lock();
    inner.paused = true;
    tracing::trace!(consumers = inner.consumers, "pausing fetch queue");
    while inner.parked < inner.consumers && !inner.closed {
      self.all_parked.wait(&mut inner);
    }
  }

  pub fn resume(&self) {
    self.inner.lock().paused = false;
    self.available.notify_all();
  }

  pub fn is_paused(&self) -> bool {
    self.inner.lock().paused
  }

  /// Drops every queued item, prefetch ring included.
  pub fn clear(&self) -> usize {
    let mut inner = self.inner.lock();
    let cleared = inner.len();
    for level in inner.levels.iter_mut() {
      level.clear();
    }
    inner.prefetch.clear();
    cleared
  }

  /// Wakes every consumer; all subsequent `take`s return `None` and `put`s
  /// fail.
  pub fn close(&self) {
    self.inner.lock().closed = true;
    self.available.notify_all();
    self.all_parked.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self.inner.lock().closed
  }

  pub fn len(&self) -> usize {
    self.inner.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn num_levels(&self) -> usize {
    self.num_levels
  }

  pub fn prefetch_capacity(&self) -> usize {
    self.prefetch_capacity
  }
}
