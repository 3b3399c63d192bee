#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cellcache::{Block, CacheLoader, CacheRemover, Dirty, Error, Result};

// An in-memory stand-in for a disk store. Blocks that were never written
// load as four bytes filled with the key. Writes can be held back to observe
// the write-back path mid-write.
#[derive(Default)]
pub struct MemoryStore {
  disk: Mutex<HashMap<u64, Vec<u8>>>,
  writes: Mutex<Vec<(u64, Vec<u8>)>>,
  invalidated: Mutex<Vec<u64>>,
  loads: AtomicUsize,
  entered: AtomicUsize,
  fail_writes: AtomicBool,
  panic_next_write: AtomicBool,
  held: Mutex<bool>,
  released: Condvar,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn hold_writes(&self) {
    *self.held.lock().unwrap() = true;
  }

  pub fn release_writes(&self) {
    *self.held.lock().unwrap() = false;
    self.released.notify_all();
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn panic_next_write(&self) {
    self.panic_next_write.store(true, Ordering::SeqCst);
  }

  // Waits until `count` writes have started.
  pub fn wait_for_writes_started(&self, count: usize) {
    wait_until(Duration::from_secs(5), || {
      self.entered.load(Ordering::SeqCst) >= count
    });
  }

  pub fn stored(&self, key: u64) -> Option<Vec<u8>> {
    self.disk.lock().unwrap().get(&key).cloned()
  }

  pub fn writes(&self) -> Vec<(u64, Vec<u8>)> {
    self.writes.lock().unwrap().clone()
  }

  pub fn writes_of(&self, key: u64) -> Vec<Vec<u8>> {
    self
      .writes()
      .into_iter()
      .filter(|(k, _)| *k == key)
      .map(|(_, bytes)| bytes)
      .collect()
  }

  pub fn invalidated(&self) -> Vec<u64> {
    self.invalidated.lock().unwrap().clone()
  }

  pub fn loads(&self) -> usize {
    self.loads.load(Ordering::SeqCst)
  }
}

impl CacheLoader<u64, Block> for MemoryStore {
  fn load(&self, key: &u64) -> Result<Block> {
    self.loads.fetch_add(1, Ordering::SeqCst);
    let bytes = self
      .stored(*key)
      .unwrap_or_else(|| vec![*key as u8; 4]);
    Ok(Block::new(bytes))
  }
}

impl CacheRemover<u64, Block> for MemoryStore {
  type Data = Block;

  fn extract(&self, value: &Block) -> Block {
    value.clone()
  }

  fn reconstruct(&self, _key: &u64, data: Block) -> Block {
    data
  }

  fn on_removal(&self, key: u64, data: Block) -> Result<()> {
    if self.panic_next_write.swap(false, Ordering::SeqCst) {
      panic!("store crashed mid-write");
    }
    self.entered.fetch_add(1, Ordering::SeqCst);
    let mut held = self.held.lock().unwrap();
    while *held {
      held = self.released.wait(held).unwrap();
    }
    drop(held);

    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(Error::from(std::io::Error::other("disk full")));
    }
    data.set_dirty(false);
    let bytes = data.read().to_le_bytes();
    self.disk.lock().unwrap().insert(key, bytes.clone());
    self.writes.lock().unwrap().push((key, bytes));
    Ok(())
  }

  fn needs_persist(&self, data: &Block) -> bool {
    data.is_dirty()
  }

  fn invalidate(&self, key: &u64) -> Result<()> {
    self.disk.lock().unwrap().remove(key);
    self.invalidated.lock().unwrap().push(*key);
    Ok(())
  }

  fn invalidate_if(
    &self,
    _parallelism_threshold: usize,
    condition: &(dyn Fn(&u64) -> bool + Sync),
  ) -> Result<()> {
    let mut disk = self.disk.lock().unwrap();
    let doomed: Vec<u64> = disk.keys().copied().filter(|key| condition(key)).collect();
    for key in &doomed {
      disk.remove(key);
    }
    self.invalidated.lock().unwrap().extend(doomed);
    Ok(())
  }

  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    self.invalidate_if(parallelism_threshold, &|_| true)
  }
}

// Polls `condition` until it holds, panicking after `timeout`.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) {
  let deadline = Instant::now() + timeout;
  while !condition() {
    assert!(Instant::now() < deadline, "condition not met within {:?}", timeout);
    thread::sleep(Duration::from_millis(1));
  }
}

pub fn bytes_of(block: &Block) -> Vec<u8> {
  block.read().to_le_bytes()
}
