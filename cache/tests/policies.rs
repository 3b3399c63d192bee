mod common;

use cellcache::builder::sweep_frequency;
use cellcache::{Block, CacheBuilder, HandOff, LoadingCache, Residency};
use common::{bytes_of, MemoryStore};

use std::sync::Arc;

fn cache_with(
  residency: Residency,
  store: &Arc<MemoryStore>,
) -> LoadingCache<u64, Block, HandOff<MemoryStore>> {
  CacheBuilder::<u64, Block>::new()
    .residency(residency)
    .remover(store.clone())
    .build()
    .unwrap()
}

#[test]
fn test_bounded_evicts_least_recently_used() {
  let store = Arc::new(MemoryStore::new());
  let cache = cache_with(Residency::Bounded { max_entries: 2 }, &store);

  cache.get(&1, &*store).unwrap();
  cache.get(&2, &*store).unwrap();
  // Touch 1 so that 2 becomes the least recently used.
  cache.get(&1, &*store).unwrap();
  cache.get(&3, &*store).unwrap();

  assert!(cache.get_if_present(&2).is_none());
  assert!(cache.get_if_present(&1).is_some());
  assert!(cache.get_if_present(&3).is_some());
  assert_eq!(cache.len(), 2, "evicted keys are unmapped");
  assert_eq!(cache.metrics().evictions, 1);
}

#[test]
fn test_bounded_eviction_hands_off_to_remover() {
  let store = Arc::new(MemoryStore::new());
  let cache = cache_with(Residency::Bounded { max_entries: 1 }, &store);

  let block = cache.get(&1, &*store).unwrap();
  drop(block);
  cache.get(&2, &*store).unwrap();

  assert_eq!(store.writes_of(1), vec![vec![1, 1, 1, 1]]);
  assert_eq!(cache.metrics().hand_offs, 1);
}

#[test]
fn test_reclaim_leaves_a_clean_miss() {
  let store = Arc::new(MemoryStore::new());
  let cache = cache_with(Residency::Reclaimable { soft_limit: None }, &store);

  for key in 1..=3 {
    cache.get(&key, &*store).unwrap();
  }
  assert_eq!(cache.reclaim(1), 2);

  // 1. The two least recently used values went to the remover.
  assert_eq!(store.writes().len(), 2);
  assert!(cache.get_if_present(&1).is_none());
  assert!(cache.get_if_present(&3).is_some());

  // 2. Their keys stay mapped and load again on the next request.
  assert_eq!(cache.len(), 3);
  let reloaded = cache.get(&1, &*store).unwrap();
  assert_eq!(bytes_of(&reloaded), vec![1, 1, 1, 1]);
  assert_eq!(store.loads(), 4);
  assert_eq!(cache.metrics().reclaims, 2);
}

#[test]
fn test_reclaim_all_empties_memory() {
  let store = Arc::new(MemoryStore::new());
  let cache = cache_with(Residency::Reclaimable { soft_limit: None }, &store);
  for key in 0..5 {
    cache.get(&key, &*store).unwrap();
  }
  assert_eq!(cache.reclaim_all(), 5);
  assert_eq!(cache.resident(), 0);
  assert_eq!(cache.len(), 5);
}

#[test]
fn test_soft_limit_reclaims_automatically() {
  let store = Arc::new(MemoryStore::new());
  let cache = cache_with(Residency::Reclaimable { soft_limit: Some(2) }, &store);

  for key in 1..=3 {
    cache.get(&key, &*store).unwrap();
  }
  assert_eq!(cache.resident(), 2);
  assert!(cache.get_if_present(&1).is_none());
  assert_eq!(store.writes_of(1).len(), 1);
}

#[test]
fn test_weak_identity_while_held() {
  let store = Arc::new(MemoryStore::new());
  let cache = cache_with(Residency::Weak { retain: 0 }, &store);

  let first = cache.get(&4, &*store).unwrap();
  let second = cache.get(&4, &*store).unwrap();
  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(store.loads(), 1);
}

#[test]
fn test_weak_value_is_collected_when_dropped() {
  let store = Arc::new(MemoryStore::new());
  let cache = cache_with(Residency::Weak { retain: 0 }, &store);

  let block = cache.get(&4, &*store).unwrap();
  drop(block);
  assert!(cache.get_if_present(&4).is_none());

  // The next load first hands the collected block to the remover, then
  // finds it there.
  let reloaded = cache.get(&4, &*store).unwrap();
  assert_eq!(store.writes_of(4).len(), 1);
  assert_eq!(bytes_of(&reloaded), vec![4, 4, 4, 4]);
  assert_eq!(cache.metrics().collected, 1);
}

#[test]
fn test_clean_up_sweeps_collected_values() {
  let store = Arc::new(MemoryStore::new());
  let cache = CacheBuilder::<u64, Block>::new()
    .weak(0)
    .sweep_frequency(sweep_frequency::NEVER)
    .remover(store.clone())
    .build()
    .unwrap();

  let kept = cache.get(&1, &*store).unwrap();
  drop(cache.get(&2, &*store).unwrap());
  drop(cache.get(&3, &*store).unwrap());

  assert_eq!(cache.clean_up(), 2);
  assert_eq!(cache.len(), 1);
  assert!(Arc::ptr_eq(&cache.get_if_present(&1).unwrap(), &kept));
  assert_eq!(store.writes().len(), 2);
}

#[test]
fn test_weak_retention_pins_recent_values() {
  let store = Arc::new(MemoryStore::new());
  let cache = cache_with(Residency::Weak { retain: 1 }, &store);

  drop(cache.get(&1, &*store).unwrap());
  assert!(cache.get_if_present(&1).is_some(), "pinned by retention");

  drop(cache.get(&2, &*store).unwrap());
  assert!(cache.get_if_present(&1).is_none(), "unpinned once 2 was loaded");
  assert!(cache.get_if_present(&2).is_some());
}
