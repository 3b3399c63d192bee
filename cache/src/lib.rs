//! A concurrent loading cache for block-structured data that does not fit in
//! memory.
//!
//! # Features
//! - **At-most-once loading**: concurrent lookups of a missing key share one
//!   loader call and all see its value or its error.
//! - **Residency policies**: bounded LRU, reclaimable and weak residency over
//!   the same sharded key map.
//! - **Write-back**: evicted blocks are handed to [`IoSync`], which coalesces
//!   repeated evictions and writes them on background threads while serving
//!   reads from the pending records.
//! - **Prioritized background loading**: a [`PriorityFetchQueue`] drained by a
//!   [`FetcherPool`], and a [`BudgetedVolatileCache`] that returns whatever it
//!   has within a per-priority [`IoTimeBudget`].
//! - **Disk blocks**: [`DiskBlockStore`] keeps one memory-mapped file per block.
//! - **Configuration**: optional `serde` support for [`CacheConfig`],
//!   [`WriteBackConfig`] and [`FetchConfig`].

// Public modules that form the API
pub mod block;
pub mod bound;
pub mod builder;
pub mod cache;
pub mod config;
pub mod disk;
pub mod error;
pub mod io_sync;
pub mod loader;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod removal;
pub mod task;
pub mod timing;
pub mod volatile;

// Internal, crate-only modules
mod entry;
mod rng;
mod store;

// Re-export the primary user-facing types for convenience
pub use block::{Block, BlockStorage, Dirty, ElementType};
pub use bound::BoundCache;
pub use builder::CacheBuilder;
pub use cache::LoadingCache;
pub use config::{CacheConfig, FetchConfig, WriteBackConfig, DEFAULT_PARALLELISM_THRESHOLD};
pub use disk::{BlockDirectory, DiskBlockStore};
pub use error::{BoxError, BuildError, Error, Result};
pub use io_sync::{IoSync, IoSyncBuilder, WriteStats};
pub use loader::{CacheLoader, CacheRemover, LoaderCache};
pub use metrics::MetricsSnapshot;
pub use policy::Residency;
pub use queue::{PausableQueue, PriorityFetchQueue, QueueOrder};
pub use removal::{Discard, HandOff, RemovalReason, RemovalSink};
pub use task::fetcher::{FetchTask, FetcherPool};
pub use task::ThreadNames;
pub use timing::{IoStatistics, IoTimeBudget, IoTimer};
pub use volatile::{
  BudgetedVolatileCache, CacheHints, LoadingStrategy, Validity, Volatile, VolatileCacheLoader,
};
