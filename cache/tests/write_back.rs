mod common;

use cellcache::{
  Block, BlockStorage, CacheBuilder, Dirty, Error, IoSync, IoSyncBuilder,
  DEFAULT_PARALLELISM_THRESHOLD,
};
use common::{bytes_of, MemoryStore};

use std::sync::{
  atomic::{AtomicBool, Ordering},
  mpsc, Arc,
};
use std::thread;
use std::time::Duration;

fn write_back(store: &Arc<MemoryStore>, writers: usize) -> Arc<IoSync<u64, Block, MemoryStore>> {
  Arc::new(
    IoSyncBuilder::new()
      .writer_threads(writers)
      .build(store.clone())
      .unwrap(),
  )
}

#[test]
fn test_read_through_serves_pending_record() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 1);
  let cache = CacheBuilder::<u64, Block>::new()
    .bounded(1)
    .remover(io.clone())
    .build()
    .unwrap();

  // 1. Load block 1 and modify it.
  let block = cache.get(&1, &*io).unwrap();
  *block.write() = BlockStorage::from(vec![9u8; 4]);
  drop(block);

  // 2. Evict it while the writer is held back.
  store.hold_writes();
  cache.get(&2, &*io).unwrap();
  assert!(io.is_pending(&1));

  // 3. Reading it again reconstructs the pending block without a disk load.
  let loads_before = store.loads();
  let again = cache.get(&1, &*io).unwrap();
  assert_eq!(bytes_of(&again), vec![9, 9, 9, 9]);
  assert_eq!(store.loads(), loads_before);

  // 4. Once written, the data is on disk.
  store.release_writes();
  io.flush().unwrap();
  assert_eq!(store.stored(1), Some(vec![9, 9, 9, 9]));
}

#[test]
fn test_repeated_evictions_coalesce_into_one_write() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 1);

  // 1. Occupy the only writer with another key.
  store.hold_writes();
  io.on_removal(99, Block::new(vec![0u8])).unwrap();
  store.wait_for_writes_started(1);

  // 2. Evict key 7 three times before any write of it can start.
  for fill in [1u8, 2, 3] {
    io.on_removal(7, Block::new(vec![fill; 4])).unwrap();
  }
  assert_eq!(io.pending_len(), 2);

  // 3. Only the last state reaches the store, exactly once.
  store.release_writes();
  io.flush().unwrap();
  assert_eq!(store.writes_of(7), vec![vec![3, 3, 3, 3]]);
  let stats = io.stats();
  assert_eq!(stats.coalesced, 2);
  assert_eq!(stats.pending, 0);
}

#[test]
fn test_invalidate_waits_for_inflight_write() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 1);

  store.hold_writes();
  io.on_removal(5, Block::new(vec![9u8; 4])).unwrap();
  store.wait_for_writes_started(1);

  let done = Arc::new(AtomicBool::new(false));
  let invalidator = {
    let io = io.clone();
    let done = done.clone();
    thread::spawn(move || {
      io.invalidate(&5).unwrap();
      done.store(true, Ordering::SeqCst);
    })
  };

  thread::sleep(Duration::from_millis(50));
  assert!(!done.load(Ordering::SeqCst), "invalidate must wait for the write");

  store.release_writes();
  invalidator.join().unwrap();
  assert!(done.load(Ordering::SeqCst));

  // The write landed first and was then discarded. Reads fall back to the
  // never-written fill.
  assert_eq!(store.writes_of(5), vec![vec![9, 9, 9, 9]]);
  assert_eq!(store.stored(5), None);
  assert!(!io.is_pending(&5));
  assert_eq!(bytes_of(&io.get(&5).unwrap()), vec![5, 5, 5, 5]);
}

#[test]
fn test_cache_invalidate_during_write_hides_old_value() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 1);
  let cache = Arc::new(
    CacheBuilder::<u64, Block>::new()
      .bounded(1)
      .remover(io.clone())
      .build()
      .unwrap(),
  );

  // 1. Modify block 5, then evict it while the writer is held mid-write.
  let block = cache.get(&5, &*io).unwrap();
  *block.write() = BlockStorage::from(vec![9u8; 4]);
  drop(block);
  store.hold_writes();
  cache.get(&6, &*io).unwrap();
  store.wait_for_writes_started(1);

  // 2. Invalidate through the cache while that write is in flight.
  let invalidator = {
    let cache = cache.clone();
    thread::spawn(move || cache.invalidate(&5).unwrap())
  };
  thread::sleep(Duration::from_millis(20));
  store.release_writes();
  invalidator.join().unwrap();

  // 3. Neither the cache nor the write-back stage serves the old state.
  assert_eq!(bytes_of(&cache.get(&5, &*io).unwrap()), vec![5, 5, 5, 5]);
  assert_eq!(bytes_of(&io.get(&5).unwrap()), vec![5, 5, 5, 5]);
  assert_eq!(store.stored(5), None);
}

#[test]
fn test_invalidate_drops_queued_records() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 1);

  store.hold_writes();
  io.on_removal(1, Block::new(vec![1u8])).unwrap();
  store.wait_for_writes_started(1);
  io.on_removal(2, Block::new(vec![2u8])).unwrap();
  io.on_removal(3, Block::new(vec![3u8])).unwrap();

  let releaser = {
    let store = store.clone();
    thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      store.release_writes();
    })
  };
  io.invalidate_if(DEFAULT_PARALLELISM_THRESHOLD, &|key| *key >= 2).unwrap();
  releaser.join().unwrap();

  io.flush().unwrap();
  assert!(store.writes_of(2).is_empty());
  assert!(store.writes_of(3).is_empty());
  assert_eq!(store.stored(1), Some(vec![1]));
}

#[test]
fn test_cache_invalidation_reaches_the_store() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 2);
  let cache = CacheBuilder::<u64, Block>::new()
    .bounded(1)
    .remover(io.clone())
    .build()
    .unwrap();

  for key in 0..4 {
    cache.get(&key, &*io).unwrap();
  }
  io.flush().unwrap();
  assert_eq!(store.writes().len(), 3);

  cache.invalidate_all(DEFAULT_PARALLELISM_THRESHOLD).unwrap();
  assert_eq!(io.pending_len(), 0);
  assert_eq!(store.stored(0), None);
  assert!(cache.is_empty());
}

#[test]
fn test_zero_writers_write_synchronously() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 0);
  assert_eq!(io.writer_threads(), 0);

  io.on_removal(3, Block::new(vec![3u8; 2])).unwrap();
  assert_eq!(io.pending_len(), 0);
  assert_eq!(store.stored(3), Some(vec![3, 3]));
  assert_eq!(io.stats().writes, 1);
}

#[test]
fn test_dirty_tracking_skips_clean_blocks() {
  let store = Arc::new(MemoryStore::new());
  let io: IoSync<u64, Block, MemoryStore> = IoSyncBuilder::new()
    .writer_threads(0)
    .dirty_tracking(true)
    .build(store.clone())
    .unwrap();

  let clean = Block::new(vec![1u8]);
  io.on_removal(1, clean).unwrap();

  let dirty = Block::new(vec![2u8]);
  *dirty.write() = BlockStorage::from(vec![7u8]);
  io.on_removal(2, dirty.clone()).unwrap();

  assert_eq!(store.stored(1), None);
  assert_eq!(store.stored(2), Some(vec![7]));
  assert_eq!(io.stats().skipped_clean, 1);
  assert!(!dirty.is_dirty());
}

#[test]
fn test_failed_write_keeps_the_record() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 1);
  store.fail_writes(true);

  io.on_removal(8, Block::new(vec![8u8])).unwrap();
  assert!(matches!(io.flush(), Err(Error::Io(_))));
  assert!(io.is_pending(&8));
  assert!(io.stats().write_failures >= 1);

  // The record is still there to retry. Let attempts already queued fail
  // first.
  thread::sleep(Duration::from_millis(20));
  store.fail_writes(false);
  io.flush().unwrap();
  assert_eq!(store.stored(8), Some(vec![8]));
}

#[test]
fn test_panicking_store_does_not_wedge_writers() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 1);

  // 1. The first write panics. The record survives as a failed write.
  store.panic_next_write();
  io.on_removal(1, Block::new(vec![1u8; 4])).unwrap();
  common::wait_until(Duration::from_secs(5), || io.stats().write_failures == 1);
  assert!(io.is_pending(&1));

  // 2. The same key can be written again.
  io.flush().unwrap();
  assert_eq!(store.stored(1), Some(vec![1, 1, 1, 1]));

  // 3. The writer still parks, so invalidation can pause it.
  let (done_tx, done_rx) = mpsc::channel();
  {
    let io = io.clone();
    thread::spawn(move || {
      io.invalidate(&1).unwrap();
      done_tx.send(()).unwrap();
    });
  }
  assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());
  assert_eq!(store.stored(1), None);
}

#[test]
fn test_zero_writers_keep_failed_writes() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 0);

  // 1. A failed synchronous write is reported and kept.
  store.fail_writes(true);
  assert!(matches!(
    io.on_removal(4, Block::new(vec![9u8; 4])),
    Err(Error::Io(_))
  ));
  assert!(io.is_pending(&4));

  // 2. Reads see the evicted state, not the stale store.
  assert_eq!(bytes_of(&io.get(&4).unwrap()), vec![9, 9, 9, 9]);
  assert!(io.flush().is_err());

  // 3. A panicking store counts as a failed write too.
  store.fail_writes(false);
  store.panic_next_write();
  assert!(matches!(
    io.on_removal(4, Block::new(vec![7u8; 4])),
    Err(Error::Panicked(_))
  ));
  assert_eq!(io.stats().coalesced, 1);

  // 4. Flush retries on the calling thread and persists the last state.
  io.flush().unwrap();
  assert_eq!(store.stored(4), Some(vec![7, 7, 7, 7]));
  assert_eq!(io.pending_len(), 0);
}

#[test]
fn test_shutdown_drains_then_rejects() {
  let store = Arc::new(MemoryStore::new());
  let io = write_back(&store, 2);
  for key in 0..6 {
    io.on_removal(key, Block::new(vec![key as u8])).unwrap();
  }
  io.shutdown();
  assert_eq!(store.writes().len(), 6);
  assert!(matches!(
    io.on_removal(10, Block::new(vec![0u8])),
    Err(Error::Shutdown)
  ));
}
