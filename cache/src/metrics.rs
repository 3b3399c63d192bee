use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector for the cache.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Metrics {
  // --- Hit/Miss Ratios ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,

  // --- Loads ---
  pub(crate) loads: CachePadded<AtomicU64>,
  pub(crate) load_failures: CachePadded<AtomicU64>,
  pub(crate) load_nanos: CachePadded<AtomicU64>,

  // --- Departures from memory ---
  pub(crate) evictions: CachePadded<AtomicU64>,
  pub(crate) reclaims: CachePadded<AtomicU64>,
  pub(crate) collected: CachePadded<AtomicU64>,
  pub(crate) invalidations: CachePadded<AtomicU64>,
  pub(crate) hand_offs: CachePadded<AtomicU64>,

  created_at: Instant,
}

impl Default for Metrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      loads: CachePadded::new(AtomicU64::new(0)),
      load_failures: CachePadded::new(AtomicU64::new(0)),
      load_nanos: CachePadded::new(AtomicU64::new(0)),
      evictions: CachePadded::new(AtomicU64::new(0)),
      reclaims: CachePadded::new(AtomicU64::new(0)),
      collected: CachePadded::new(AtomicU64::new(0)),
      invalidations: CachePadded::new(AtomicU64::new(0)),
      hand_offs: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
  counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self, resident: usize) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + misses;
    let loads = self.loads.load(Ordering::Relaxed);
    let load_nanos = self.load_nanos.load(Ordering::Relaxed);

    MetricsSnapshot {
      hits,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      loads,
      load_failures: self.load_failures.load(Ordering::Relaxed),
      average_load_micros: if loads == 0 {
        0
      } else {
        load_nanos / loads / 1_000
      },
      evictions: self.evictions.load(Ordering::Relaxed),
      reclaims: self.reclaims.load(Ordering::Relaxed),
      collected: self.collected.load(Ordering::Relaxed),
      invalidations: self.invalidations.load(Ordering::Relaxed),
      hand_offs: self.hand_offs.load(Ordering::Relaxed),
      resident,
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of the cache's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// Lookups answered from memory, including callers that waited on another
  /// thread's load.
  pub hits: u64,
  /// Lookups that ran the loader.
  pub misses: u64,
  /// The cache hit ratio (hits / (hits + misses)).
  pub hit_ratio: f64,
  /// Successful loader invocations.
  pub loads: u64,
  pub load_failures: u64,
  pub average_load_micros: u64,
  /// Values dropped by a bounded cache to stay within capacity.
  pub evictions: u64,
  /// Values released by `reclaim` or a soft limit; their keys stay mapped.
  pub reclaims: u64,
  /// Weakly held values found dead, either on access or during a sweep.
  pub collected: u64,
  /// The total number of manual invalidations.
  pub invalidations: u64,
  /// Values passed to the removal sink.
  pub hand_offs: u64,
  /// Values currently tracked by the residency policy.
  pub resident: usize,
  /// The number of seconds the cache has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("loads", &self.loads)
      .field("load_failures", &self.load_failures)
      .field("average_load_micros", &self.average_load_micros)
      .field("evictions", &self.evictions)
      .field("reclaims", &self.reclaims)
      .field("collected", &self.collected)
      .field("invalidations", &self.invalidations)
      .field("hand_offs", &self.hand_offs)
      .field("resident", &self.resident)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
