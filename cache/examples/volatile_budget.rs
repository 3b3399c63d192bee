use cellcache::{
  Block, BudgetedVolatileCache, CacheBuilder, CacheHints, CacheLoader, ElementType, FetcherPool,
  IoStatistics, PriorityFetchQueue, Result, ThreadNames, Volatile, VolatileCacheLoader,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// Pretends every block takes 30ms to read.
struct SlowLoader {
  statistics: Arc<IoStatistics>,
}

impl CacheLoader<u64, Block> for SlowLoader {
  fn load(&self, key: &u64) -> Result<Block> {
    let _timer = self.statistics.timer();
    thread::sleep(Duration::from_millis(30));
    self.statistics.add_io_bytes(256);
    Ok(Block::new(vec![*key as u8; 256]))
  }
}

impl VolatileCacheLoader<u64, Block> for SlowLoader {
  fn create_invalid(&self, _key: &u64) -> Result<Block> {
    Ok(Block::placeholder(ElementType::U8, 256))
  }
}

fn main() {
  let statistics = Arc::new(IoStatistics::new(2));
  let queue = Arc::new(PriorityFetchQueue::new(2, 64).expect("Failed to build queue"));
  let _fetchers = FetcherPool::spawn(queue.clone(), 4, &ThreadNames::new("fetcher"))
    .expect("Failed to start fetchers");

  let backing = CacheBuilder::<u64, Block>::new()
    .bounded(256)
    .build()
    .expect("Failed to build cache");
  let cache = BudgetedVolatileCache::new(backing, queue.clone(), statistics.clone());
  let loader: Arc<dyn VolatileCacheLoader<u64, Block>> = Arc::new(SlowLoader {
    statistics: statistics.clone(),
  });

  for frame in 0..5u64 {
    // Each frame may block 50ms for visible blocks and nothing for the rest.
    statistics
      .time_budget()
      .reset(&[Duration::from_millis(50), Duration::ZERO]);

    let visible: Vec<_> = (frame..frame + 4)
      .map(|key| cache.get(&key, loader.clone(), CacheHints::budgeted(0)))
      .collect::<Result<_>>()
      .expect("load failed");
    let nearby: Vec<_> = (frame + 4..frame + 12)
      .map(|key| cache.get(&key, loader.clone(), CacheHints::best_effort(1)))
      .collect::<Result<_>>()
      .expect("load failed");

    println!(
      "frame {frame}: {}/{} visible and {}/{} nearby blocks valid, {:?} budget left",
      visible.iter().filter(|block| block.is_valid()).count(),
      visible.len(),
      nearby.iter().filter(|block| block.is_valid()).count(),
      nearby.len(),
      statistics.time_budget().time_left(0),
    );

    // Whatever is still queued from this frame becomes prefetch for the next.
    queue.clear_to_prefetch();
    thread::sleep(Duration::from_millis(16));
  }

  println!("\n{} bytes loaded in the background", statistics.io_bytes());
}
