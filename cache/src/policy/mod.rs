//! Residency policies decide how long a loaded value stays in memory.
//!
//! - [`Residency::Bounded`] keeps at most `max_entries` values and evicts the
//!   least recently used one past that.
//! - [`Residency::Reclaimable`] keeps every value until memory is reclaimed
//!   explicitly (or a soft limit is crossed). The key stays mapped and reloads
//!   on next access.
//! - [`Residency::Weak`] keeps a value only while something outside the cache
//!   holds it, optionally pinning the most recently used ones.

pub(crate) mod bounded;
pub(crate) mod lru_list;
pub(crate) mod reclaimable;
pub(crate) mod weak;

use crate::entry::Held;

use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The residency policy of a [`LoadingCache`](crate::LoadingCache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Residency {
  Bounded {
    max_entries: usize,
  },
  Reclaimable {
    #[cfg_attr(feature = "serde", serde(default))]
    soft_limit: Option<usize>,
  },
  Weak {
    #[cfg_attr(feature = "serde", serde(default))]
    retain: usize,
  },
}

impl Default for Residency {
  fn default() -> Self {
    Residency::Reclaimable { soft_limit: None }
  }
}

/// Keys a policy wants out of memory.
#[derive(Debug)]
pub(crate) struct Victims<K> {
  pub(crate) keys: Vec<K>,
  /// `true` drops the whole mapping; `false` only releases the value.
  pub(crate) retire: bool,
}

impl<K> Victims<K> {
  pub(crate) fn none() -> Self {
    Self {
      keys: Vec::new(),
      retire: false,
    }
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }
}

/// Tracks recency for resident keys and picks victims.
///
/// Callbacks run after the entry's own lock has been released, so a policy
/// only ever guards its own bookkeeping.
pub(crate) trait ResidencyPolicy<K, V>: Send + Sync {
  /// How a freshly loaded value is held by its entry.
  fn hold(&self, value: &Arc<V>) -> Held<V>;

  /// Called on every hit.
  fn on_access(&self, key: &K, value: &Arc<V>);

  /// Called once a load completes. Returns the keys that must leave memory.
  fn on_admit(&self, key: &K, value: &Arc<V>) -> Victims<K>;

  /// Called when a key is invalidated or evicted.
  fn on_remove(&self, key: &K);

  /// Picks victims until at most `keep` values remain tracked.
  fn shrink_to(&self, keep: usize) -> Victims<K>;

  /// Number of values the policy currently tracks.
  fn tracked(&self) -> usize;
}

pub(crate) fn for_residency<K, V>(residency: Residency) -> Box<dyn ResidencyPolicy<K, V>>
where
  K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  match residency {
    Residency::Bounded { max_entries } => Box::new(bounded::Bounded::new(max_entries)),
    Residency::Reclaimable { soft_limit } => Box::new(reclaimable::Reclaimable::new(soft_limit)),
    Residency::Weak { retain } => Box::new(weak::WeakRetention::new(retain)),
  }
}
