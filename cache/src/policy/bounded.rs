use super::lru_list::LruList;
use super::{ResidencyPolicy, Victims};
use crate::entry::Held;

use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// Strong residency capped at `capacity` values, least recently used first out.
#[derive(Debug)]
pub(crate) struct Bounded<K: Eq + Hash + Clone> {
  lru: Mutex<LruList<K>>,
  capacity: usize,
}

impl<K: Eq + Hash + Clone> Bounded<K> {
  pub(crate) fn new(capacity: usize) -> Self {
    Self {
      lru: Mutex::new(LruList::new()),
      capacity,
    }
  }

  fn evict_down_to(&self, lru: &mut LruList<K>, keep: usize) -> Victims<K> {
    let mut keys = Vec::new();
    while lru.len() > keep {
      match lru.pop_back() {
        Some(key) => keys.push(key),
        None => break,
      }
    }
    Victims { keys, retire: true }
  }
}

impl<K, V> ResidencyPolicy<K, V> for Bounded<K>
where
  K: Eq + Hash + Clone + Send + Sync,
  V: Send + Sync,
{
  fn hold(&self, value: &Arc<V>) -> Held<V> {
    Held::Strong(value.clone())
  }

  fn on_access(&self, key: &K, _value: &Arc<V>) {
    self.lru.lock().move_to_front(key);
  }

  fn on_admit(&self, key: &K, _value: &Arc<V>) -> Victims<K> {
    let mut lru = self.lru.lock();
    lru.push_front(key.clone());
    self.evict_down_to(&mut lru, self.capacity)
  }

  fn on_remove(&self, key: &K) {
    self.lru.lock().remove(key);
  }

  fn shrink_to(&self, keep: usize) -> Victims<K> {
    let mut lru = self.lru.lock();
    self.evict_down_to(&mut lru, keep)
  }

  fn tracked(&self) -> usize {
    self.lru.lock().len()
  }
}
