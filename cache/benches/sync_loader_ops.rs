use cellcache::{
  Block, BlockStorage, CacheBuilder, CacheLoader, CacheRemover, IoSync, IoSyncBuilder,
  LoadingCache, Residency, Result,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const BLOCK_LEN: usize = 256;

fn load_block(key: &u64) -> Result<Block> {
  Ok(Block::new(vec![*key as u32; BLOCK_LEN]))
}

// A store that drops every write. Keeps write-back cost to the bookkeeping.
struct NullStore;

impl CacheLoader<u64, Block> for NullStore {
  fn load(&self, key: &u64) -> Result<Block> {
    load_block(key)
  }
}

impl CacheRemover<u64, Block> for NullStore {
  type Data = Block;

  fn extract(&self, value: &Block) -> Block {
    value.clone()
  }

  fn reconstruct(&self, _key: &u64, data: Block) -> Block {
    data
  }

  fn on_removal(&self, _key: u64, data: Block) -> Result<()> {
    black_box(data.read().len());
    Ok(())
  }

  fn invalidate(&self, _key: &u64) -> Result<()> {
    Ok(())
  }

  fn invalidate_if(
    &self,
    _parallelism_threshold: usize,
    _condition: &(dyn Fn(&u64) -> bool + Sync),
  ) -> Result<()> {
    Ok(())
  }

  fn invalidate_all(&self, _parallelism_threshold: usize) -> Result<()> {
    Ok(())
  }
}

fn cache_for(residency: Residency) -> Arc<LoadingCache<u64, Block>> {
  Arc::new(CacheBuilder::new().residency(residency).build().unwrap())
}

// Runs one get per key on each of `threads` threads, all released at once,
// and returns the wall time.
fn run_gets<C>(
  cache: &C,
  loader: &dyn CacheLoader<u64, Block>,
  threads: usize,
  keys: &[Vec<u64>],
) -> Duration
where
  C: Fn(&u64, &dyn CacheLoader<u64, Block>) + Sync,
{
  let barrier = Barrier::new(threads);
  let start = Instant::now();
  thread::scope(|s| {
    for thread_keys in keys.iter().take(threads) {
      let barrier = &barrier;
      s.spawn(move || {
        barrier.wait();
        for key in thread_keys {
          cache(key, loader);
        }
      });
    }
  });
  start.elapsed()
}

fn keys_by_thread(threads: usize, per_thread: usize, key_space: u64) -> Vec<Vec<u64>> {
  // A cheap multiplicative scramble so threads don't walk the same keys in
  // lockstep.
  (0..threads)
    .map(|t| {
      (0..per_thread)
        .map(|i| ((t * per_thread + i) as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) % key_space)
        .collect()
    })
    .collect()
}

fn bench_get_hit(c: &mut Criterion) {
  let mut group = c.benchmark_group("get_hit");
  const PER_THREAD: usize = 10_000;

  for threads in [1usize, 4, 8] {
    let cache = cache_for(Residency::Bounded { max_entries: 4096 });
    for key in 0..1024u64 {
      cache.get(&key, &load_block).unwrap();
    }
    let keys = keys_by_thread(threads, PER_THREAD, 1024);

    group.throughput(Throughput::Elements((threads * PER_THREAD) as u64));
    group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
      b.iter_custom(|iters| {
        let get = |key: &u64, loader: &dyn CacheLoader<u64, Block>| {
          black_box(cache.get(key, loader).unwrap());
        };
        (0..iters)
          .map(|_| run_gets(&get, &load_block, threads, &keys))
          .sum()
      });
    });
  }
  group.finish();
}

fn bench_get_churn(c: &mut Criterion) {
  let mut group = c.benchmark_group("get_churn");
  const PER_THREAD: usize = 5_000;

  let residencies = [
    ("bounded", Residency::Bounded { max_entries: 512 }),
    ("reclaimable", Residency::Reclaimable { soft_limit: Some(512) }),
    ("weak", Residency::Weak { retain: 512 }),
  ];

  for (name, residency) in residencies {
    let threads = 4;
    let keys = keys_by_thread(threads, PER_THREAD, 8192);
    group.throughput(Throughput::Elements((threads * PER_THREAD) as u64));
    group.bench_function(name, |b| {
      b.iter_custom(|iters| {
        let mut total = Duration::ZERO;
        for _ in 0..iters {
          let cache = cache_for(residency);
          let get = |key: &u64, loader: &dyn CacheLoader<u64, Block>| {
            black_box(cache.get(key, loader).unwrap());
          };
          total += run_gets(&get, &load_block, threads, &keys);
        }
        total
      });
    });
  }
  group.finish();
}

fn bench_write_back(c: &mut Criterion) {
  let mut group = c.benchmark_group("write_back_evictions");
  const KEYS: u64 = 20_000;

  for writers in [0usize, 2] {
    group.throughput(Throughput::Elements(KEYS));
    group.bench_with_input(BenchmarkId::from_parameter(writers), &writers, |b, &writers| {
      b.iter_custom(|iters| {
        let mut total = Duration::ZERO;
        for _ in 0..iters {
          let io: Arc<IoSync<u64, Block, NullStore>> = Arc::new(
            IoSyncBuilder::new()
              .writer_threads(writers)
              .build(Arc::new(NullStore))
              .unwrap(),
          );
          let cache = CacheBuilder::<u64, Block>::new()
            .bounded(256)
            .remover(io.clone())
            .build()
            .unwrap();

          let start = Instant::now();
          for key in 0..KEYS {
            let block = cache.get(&key, &*io).unwrap();
            // Touch the block so it reads as modified.
            black_box(block.write().len());
          }
          io.flush().unwrap();
          total += start.elapsed();
        }
        total
      });
    });
  }
  group.finish();
}

fn bench_encode(c: &mut Criterion) {
  let storage = BlockStorage::from(vec![0xA5A5_A5A5u32; 64 * 1024]);
  let mut out = vec![0u8; storage.byte_len()];
  let mut group = c.benchmark_group("block_encode");
  group.throughput(Throughput::Bytes(out.len() as u64));
  group.bench_function("u32_le", |b| {
    b.iter(|| storage.write_le_bytes(black_box(&mut out)).unwrap())
  });
  group.finish();
}

criterion_group!(
  benches,
  bench_get_hit,
  bench_get_churn,
  bench_write_back,
  bench_encode
);
criterion_main!(benches);
