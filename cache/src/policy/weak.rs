use super::lru_list::LruList;
use super::{ResidencyPolicy, Victims};
use crate::entry::Held;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

#[derive(Debug)]
struct Pinned<K: Eq + Hash + Clone, V> {
  lru: LruList<K>,
  values: HashMap<K, Arc<V>>,
}

/// Weak residency. Entries only hold a `Weak<V>`; up to `retain` recently used
/// values are additionally pinned so they survive a short gap in outside use.
#[derive(Debug)]
pub(crate) struct WeakRetention<K: Eq + Hash + Clone, V> {
  pinned: Mutex<Pinned<K, V>>,
  retain: usize,
}

impl<K: Eq + Hash + Clone, V> WeakRetention<K, V> {
  pub(crate) fn new(retain: usize) -> Self {
    Self {
      pinned: Mutex::new(Pinned {
        lru: LruList::new(),
        values: HashMap::new(),
      }),
      retain,
    }
  }

  fn unpin_down_to(pinned: &mut Pinned<K, V>, keep: usize) -> Vec<Arc<V>> {
    let mut dropped = Vec::new();
    while pinned.lru.len() > keep {
      match pinned.lru.pop_back() {
        Some(key) => dropped.extend(pinned.values.remove(&key)),
        None => break,
      }
    }
    dropped
  }

  fn pin(&self, key: &K, value: &Arc<V>) {
    if self.retain == 0 {
      return;
    }
    // Unpinned values are dropped after the lock is released.
    let _unpinned = {
      let mut pinned = self.pinned.lock();
      pinned.lru.push_front(key.clone());
      pinned.values.insert(key.clone(), value.clone());
      Self::unpin_down_to(&mut pinned, self.retain)
    };
  }
}

impl<K, V> ResidencyPolicy<K, V> for WeakRetention<K, V>
where
  K: Eq + Hash + Clone + Send + Sync,
  V: Send + Sync,
{
  fn hold(&self, value: &Arc<V>) -> Held<V> {
    Held::Weak(Arc::downgrade(value))
  }

  fn on_access(&self, key: &K, value: &Arc<V>) {
    self.pin(key, value);
  }

  fn on_admit(&self, key: &K, value: &Arc<V>) -> Victims<K> {
    self.pin(key, value);
    Victims::none()
  }

  fn on_remove(&self, key: &K) {
    let _unpinned = {
      let mut pinned = self.pinned.lock();
      pinned.lru.remove(key);
      pinned.values.remove(key)
    };
  }

  fn shrink_to(&self, keep: usize) -> Victims<K> {
    let _unpinned = Self::unpin_down_to(&mut self.pinned.lock(), keep);
    Victims::none()
  }

  fn tracked(&self) -> usize {
    self.pinned.lock().lru.len()
  }
}
