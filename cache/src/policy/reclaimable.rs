use super::lru_list::LruList;
use super::{ResidencyPolicy, Victims};
use crate::entry::Held;

use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// Strong residency whose values are released under memory pressure while the
/// key mapping survives.
#[derive(Debug)]
pub(crate) struct Reclaimable<K: Eq + Hash + Clone> {
  lru: Mutex<LruList<K>>,
  soft_limit: Option<usize>,
}

impl<K: Eq + Hash + Clone> Reclaimable<K> {
  pub(crate) fn new(soft_limit: Option<usize>) -> Self {
    Self {
      lru: Mutex::new(LruList::new()),
      soft_limit,
    }
  }

  fn reclaim_down_to(lru: &mut LruList<K>, keep: usize) -> Victims<K> {
    let mut keys = Vec::new();
    while lru.len() > keep {
      match lru.pop_back() {
        Some(key) => keys.push(key),
        None => break,
      }
    }
    Victims { keys, retire: false }
  }
}

impl<K, V> ResidencyPolicy<K, V> for Reclaimable<K>
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
    match self.soft_limit {
      Some(limit) => Self::reclaim_down_to(&mut lru, limit),
      None => Victims::none(),
    }
  }

  fn on_remove(&self, key: &K) {
    self.lru.lock().remove(key);
  }

  fn shrink_to(&self, keep: usize) -> Victims<K> {
    Self::reclaim_down_to(&mut self.lru.lock(), keep)
  }

  fn tracked(&self) -> usize {
    self.lru.lock().len()
  }
}
