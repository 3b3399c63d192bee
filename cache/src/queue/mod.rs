//! Blocking queues shared between the cache and its background threads.
//!
//! [`PausableQueue`] feeds the write-back threads and can be frozen while
//! pending writes are discarded. [`PriorityFetchQueue`] feeds the fetcher pool
//! with prioritized, re-prioritizable loads.

mod pausable;
mod priority;

pub use pausable::PausableQueue;
pub use priority::PriorityFetchQueue;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Capacity of the prefetch ring unless configured otherwise.
pub const DEFAULT_PREFETCH_CAPACITY: usize = 16384;

/// Which end of a [`PausableQueue`] consumers take from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum QueueOrder {
  #[default]
  Fifo,
  Lifo,
}
