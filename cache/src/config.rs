//! Plain configuration structs. With the `serde` feature they can be read from
//! any serde format; every field has a default so partial documents work.

use crate::builder::sweep_frequency;
use crate::policy::Residency;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of entries above which bulk invalidation runs in parallel.
pub const DEFAULT_PARALLELISM_THRESHOLD: usize = 1 << 14;

/// Settings for a [`LoadingCache`](crate::LoadingCache).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
  pub residency: Residency,
  /// Rounded up to a power of two. Zero is rejected.
  pub shards: usize,
  /// Average number of loads per opportunistic sweep of a weak cache.
  /// Zero disables opportunistic sweeps.
  pub sweep_frequency: u32,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      residency: Residency::default(),
      shards: (num_cpus::get() * 4).max(1).next_power_of_two(),
      sweep_frequency: sweep_frequency::RESPONSIVE,
    }
  }
}

/// Settings for an [`IoSync`](crate::IoSync) write-back stage.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WriteBackConfig {
  /// Zero means evicted blocks are written synchronously by the evicting
  /// thread.
  pub writer_threads: usize,
  pub queue_capacity: usize,
  pub thread_name: String,
  /// Skip blocks whose remover reports nothing to persist.
  pub dirty_tracking: bool,
}

impl Default for WriteBackConfig {
  fn default() -> Self {
    Self {
      writer_threads: 1,
      queue_capacity: 10,
      thread_name: "io-sync".to_string(),
      dirty_tracking: false,
    }
  }
}

/// Settings for the fetch side: the priority queue and its thread pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FetchConfig {
  pub fetcher_threads: usize,
  pub priority_levels: usize,
  pub prefetch_capacity: usize,
  pub thread_name: String,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      fetcher_threads: num_cpus::get().max(1),
      priority_levels: 4,
      prefetch_capacity: crate::queue::DEFAULT_PREFETCH_CAPACITY,
      thread_name: "fetcher".to_string(),
    }
  }
}
