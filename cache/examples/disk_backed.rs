use cellcache::{
  Block, BlockStorage, CacheBuilder, DiskBlockStore, ElementType, IoStatistics, IoSync,
  IoSyncBuilder, Result,
};
use std::sync::Arc;

fn fresh_block(key: &u64) -> Result<Block> {
  Ok(Block::new(vec![*key as u32; 1024]))
}

type Store = DiskBlockStore<u64, fn(&u64) -> Result<Block>>;

fn main() {
  let statistics = Arc::new(IoStatistics::new(1));

  // Blocks live in a temporary directory, one file per key. Keys that were
  // never written are produced by `fresh_block`.
  let store: Arc<Store> = Arc::new(
    DiskBlockStore::temporary(ElementType::U32, fresh_block as fn(&u64) -> Result<Block>)
      .expect("Failed to create block directory")
      .with_statistics(statistics.clone()),
  );
  println!("Blocks are stored in {}", store.directory().path().display());

  // Evicted blocks are written by two background threads. Untouched blocks
  // are not written at all.
  let io: Arc<IoSync<u64, Block, Store>> = Arc::new(
    IoSyncBuilder::new()
      .writer_threads(2)
      .dirty_tracking(true)
      .build(store.clone())
      .expect("Failed to start write-back"),
  );

  let cache = CacheBuilder::<u64, Block>::new()
    .bounded(16)
    .remover(io.clone())
    .build()
    .expect("Failed to build cache");

  // Modify every even block. Only 16 stay in memory.
  for key in 0..64u64 {
    let block = cache.get(&key, &*io).expect("load failed");
    if key % 2 == 0 {
      *block.write() = BlockStorage::from(vec![key as u32 * 10; 1024]);
    }
  }

  io.flush().expect("write-back failed");
  println!("\nWrite-back stats: {:#?}", io.stats());
  println!("Cache metrics: {:#?}", cache.metrics());

  // Block 2 was evicted long ago; it comes back from its file.
  let block = cache.get(&2, &*io).expect("load failed");
  if let BlockStorage::U32(values) = &*block.read() {
    println!("\nBlock 2 starts with {:?}", &values[..4]);
  }

  println!(
    "\n{} bytes moved, {:?} spent in I/O",
    statistics.io_bytes(),
    std::time::Duration::from_nanos(statistics.io_nanos())
  );

  io.shutdown();
}
