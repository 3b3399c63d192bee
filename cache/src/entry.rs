use crate::error::{Error, Result};

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

/// How an entry holds on to its value.
#[derive(Debug)]
pub(crate) enum Held<V> {
  /// The cache owns a reference; the value stays resident until released.
  Strong(Arc<V>),
  /// The value lives only as long as someone outside the cache holds it.
  Weak(Weak<V>),
}

impl<V> Held<V> {
  #[inline]
  pub(crate) fn upgrade(&self) -> Option<Arc<V>> {
    match self {
      Held::Strong(value) => Some(value.clone()),
      Held::Weak(value) => value.upgrade(),
    }
  }

  #[inline]
  fn is_collected(&self) -> bool {
    match self {
      Held::Strong(_) => false,
      Held::Weak(value) => value.strong_count() == 0,
    }
  }
}

#[derive(Debug)]
enum Slot<V, D> {
  /// Nothing resident. `failed` remembers the attempt that last failed so the
  /// callers that waited on it all observe the same error.
  Vacant { failed: Option<(u64, Error)> },
  /// A single thread is running the loader.
  Loading { attempt: u64 },
  Loaded { value: Held<V>, data: D },
  /// The value is being handed to the removal sink. Lookups wait.
  HandingOff,
  /// The key is being invalidated. Lookups wait.
  Invalidating,
  /// Detached from the store. Lookups must go back to the map.
  Retired,
}

/// What a lookup found after taking the entry's lock.
pub(crate) enum Acquired<V, D> {
  Hit(Arc<V>),
  /// The caller now owns the load for `attempt`. If the previous value was
  /// collected, its data is handed back so it can be passed to the removal
  /// sink before loading starts.
  Leader { attempt: u64, released: Option<D> },
  Retired,
}

/// A per-key slot. Its mutex is only ever held for state transitions; loaders
/// and removal hand-offs run with the lock released.
#[derive(Debug)]
pub(crate) struct CacheEntry<V, D> {
  slot: Mutex<Slot<V, D>>,
  changed: Condvar,
  attempts: AtomicU64,
  retired: AtomicBool,
}

impl<V, D> CacheEntry<V, D> {
  pub(crate) fn new() -> Self {
    Self {
      slot: Mutex::new(Slot::Vacant { failed: None }),
      changed: Condvar::new(),
      attempts: AtomicU64::new(0),
      retired: AtomicBool::new(false),
    }
  }

  /// Creates an entry that is already being invalidated, used to fence a key
  /// that had nothing resident.
  pub(crate) fn invalidating() -> Self {
    let entry = Self::new();
    *entry.slot.lock() = Slot::Invalidating;
    entry
  }

  #[inline]
  pub(crate) fn is_retired(&self) -> bool {
    self.retired.load(Ordering::Acquire)
  }

  /// Returns the value if it is loaded and still alive, without waiting.
  pub(crate) fn peek(&self) -> Option<Arc<V>> {
    match &*self.slot.lock() {
      Slot::Loaded { value, .. } => value.upgrade(),
      _ => None,
    }
  }

  /// Resolves a lookup: returns the value, waits on an in-flight load or
  /// hand-off, or hands the load to the caller.
  pub(crate) fn acquire(&self) -> Result<Acquired<V, D>> {
    let mut slot = self.slot.lock();
    let mut waited_on: Option<u64> = None;
    loop {
      match &*slot {
        Slot::Loaded { value, .. } => {
          if let Some(value) = value.upgrade() {
            return Ok(Acquired::Hit(value));
          }
          // The only references are gone. Take over the key and reload.
          let attempt = self.next_attempt();
          let previous = mem::replace(&mut *slot, Slot::Loading { attempt });
          let released = match previous {
            Slot::Loaded { data, .. } => Some(data),
            _ => None,
          };
          return Ok(Acquired::Leader { attempt, released });
        }
        Slot::Loading { attempt } => {
          waited_on = Some(*attempt);
          self.changed.wait(&mut slot);
        }
        Slot::HandingOff | Slot::Invalidating => {
          self.changed.wait(&mut slot);
        }
        Slot::Retired => return Ok(Acquired::Retired),
        Slot::Vacant { failed } => {
          if let (Some(waited), Some((failed_attempt, error))) = (waited_on, failed) {
            if waited == *failed_attempt {
              return Err(error.clone());
            }
          }
          let attempt = self.next_attempt();
          *slot = Slot::Loading { attempt };
          return Ok(Acquired::Leader {
            attempt,
            released: None,
          });
        }
      }
    }
  }

  /// Publishes the loaded value and wakes every waiter.
  pub(crate) fn complete(&self, attempt: u64, value: Held<V>, data: D) {
    let mut slot = self.slot.lock();
    debug_assert!(matches!(&*slot, Slot::Loading { attempt: a } if *a == attempt));
    *slot = Slot::Loaded { value, data };
    drop(slot);
    self.changed.notify_all();
  }

  /// Reverts to vacant after a failed load. Callers that waited on this
  /// attempt receive `error`; later callers retry.
  pub(crate) fn fail(&self, attempt: u64, error: Error) {
    let mut slot = self.slot.lock();
    *slot = Slot::Vacant {
      failed: Some((attempt, error)),
    };
    drop(slot);
    self.changed.notify_all();
  }

  /// Starts handing the loaded value off to the removal sink, returning its
  /// data. With `only_if_collected`, live values are left alone.
  pub(crate) fn begin_release(&self, only_if_collected: bool) -> Option<D> {
    let mut slot = self.slot.lock();
    match &*slot {
      Slot::Loaded { value, .. } if !only_if_collected || value.is_collected() => {
        match mem::replace(&mut *slot, Slot::HandingOff) {
          Slot::Loaded { data, .. } => Some(data),
          _ => None,
        }
      }
      _ => None,
    }
  }

  /// Ends a release started by [`begin_release`](Self::begin_release). A
  /// retired entry must then be dropped from the store; otherwise the key
  /// stays mapped and simply reloads on next access.
  pub(crate) fn finish_release(&self, retire: bool) {
    let mut slot = self.slot.lock();
    if retire {
      self.retired.store(true, Ordering::Release);
      *slot = Slot::Retired;
    } else {
      *slot = Slot::Vacant { failed: None };
    }
    drop(slot);
    self.changed.notify_all();
  }

  /// Fences the entry for invalidation, first waiting out any in-flight load
  /// or hand-off. Returns `false` if the entry was retired meanwhile.
  pub(crate) fn begin_invalidate(&self) -> bool {
    let mut slot = self.slot.lock();
    loop {
      match &*slot {
        Slot::Loading { .. } | Slot::HandingOff | Slot::Invalidating => {
          self.changed.wait(&mut slot);
        }
        Slot::Retired => return false,
        Slot::Vacant { .. } | Slot::Loaded { .. } => {
          *slot = Slot::Invalidating;
          return true;
        }
      }
    }
  }

  /// Returns a copy of the persistable data of a loaded entry.
  pub(crate) fn data(&self) -> Option<D>
  where
    D: Clone,
  {
    match &*self.slot.lock() {
      Slot::Loaded { data, .. } => Some(data.clone()),
      _ => None,
    }
  }

  #[inline]
  fn next_attempt(&self) -> u64 {
    self.attempts.fetch_add(1, Ordering::Relaxed) + 1
  }
}

/// Fails the load if the leader unwinds before completing it, so waiters are
/// never left parked on a load that will not finish.
pub(crate) struct LoadGuard<'a, V, D> {
  entry: &'a CacheEntry<V, D>,
  attempt: u64,
  armed: bool,
}

impl<'a, V, D> LoadGuard<'a, V, D> {
  pub(crate) fn new(entry: &'a CacheEntry<V, D>, attempt: u64) -> Self {
    Self {
      entry,
      attempt,
      armed: true,
    }
  }

  pub(crate) fn complete(mut self, value: Held<V>, data: D) {
    self.armed = false;
    self.entry.complete(self.attempt, value, data);
  }

  pub(crate) fn fail(mut self, error: Error) {
    self.armed = false;
    self.entry.fail(self.attempt, error);
  }
}

impl<V, D> Drop for LoadGuard<'_, V, D> {
  fn drop(&mut self) {
    if self.armed {
      self
        .entry
        .fail(self.attempt, Error::load_msg("loader panicked"));
    }
  }
}
