pub mod sweep_frequency;

use crate::cache::LoadingCache;
use crate::config::CacheConfig;
use crate::error::BuildError;
use crate::loader::CacheRemover;
use crate::policy::Residency;
use crate::removal::{Discard, HandOff, RemovalSink};

use core::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;

/// A builder for [`LoadingCache`] instances.
pub struct CacheBuilder<K, V, S = Discard, H = ahash::RandomState> {
  residency: Residency,
  shards: usize,
  sweep_frequency: u32,
  sink: S,
  hasher: H,
  _marker: PhantomData<fn(K) -> V>,
}

impl<K, V, S, H> fmt::Debug for CacheBuilder<K, V, S, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheBuilder")
      .field("residency", &self.residency)
      .field("shards", &self.shards)
      .field("sweep_frequency", &self.sweep_frequency)
      .finish_non_exhaustive()
  }
}

impl<K, V> CacheBuilder<K, V> {
  pub fn new() -> Self {
    Self::from_config(&CacheConfig::default())
  }

  /// Starts from a configuration, typically deserialized from a file.
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      residency: config.residency,
      shards: config.shards,
      sweep_frequency: config.sweep_frequency,
      sink: Discard,
      hasher: ahash::RandomState::new(),
      _marker: PhantomData,
    }
  }
}

impl<K, V> Default for CacheBuilder<K, V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V, S, H> CacheBuilder<K, V, S, H> {
  pub fn residency(mut self, residency: Residency) -> Self {
    self.residency = residency;
    self
  }

  /// Keeps at most `max_entries` values, evicting the least recently used.
  pub fn bounded(self, max_entries: usize) -> Self {
    self.residency(Residency::Bounded { max_entries })
  }

  /// Keeps values until they are reclaimed, or until more than `soft_limit`
  /// are resident if one is given.
  pub fn reclaimable(self, soft_limit: Option<usize>) -> Self {
    self.residency(Residency::Reclaimable { soft_limit })
  }

  /// Keeps values only while they are referenced elsewhere, plus the `retain`
  /// most recently used ones.
  pub fn weak(self, retain: usize) -> Self {
    self.residency(Residency::Weak { retain })
  }

  /// Sets the number of concurrent shards to use. Rounded up to a power of
  /// two when the cache is built.
  pub fn shards(mut self, shards: usize) -> Self {
    self.shards = shards;
    self
  }

  /// See [`sweep_frequency`] for presets.
  pub fn sweep_frequency(mut self, loads_per_sweep: u32) -> Self {
    self.sweep_frequency = loads_per_sweep;
    self
  }

  /// Sets the hasher for the cache.
  pub fn hasher<H2>(self, hasher: H2) -> CacheBuilder<K, V, S, H2> {
    CacheBuilder {
      residency: self.residency,
      shards: self.shards,
      sweep_frequency: self.sweep_frequency,
      sink: self.sink,
      hasher,
      _marker: PhantomData,
    }
  }

  /// Sends values that leave memory to `sink`.
  pub fn removal_sink<S2>(self, sink: S2) -> CacheBuilder<K, V, S2, H> {
    CacheBuilder {
      residency: self.residency,
      shards: self.shards,
      sweep_frequency: self.sweep_frequency,
      sink,
      hasher: self.hasher,
      _marker: PhantomData,
    }
  }

  /// Sends values that leave memory to `remover`, and forwards invalidations
  /// to it.
  pub fn remover<R>(self, remover: Arc<R>) -> CacheBuilder<K, V, HandOff<R>, H>
  where
    R: CacheRemover<K, V>,
  {
    self.removal_sink(HandOff::new(remover))
  }

  fn validate(&self) -> Result<(), BuildError> {
    if self.shards == 0 {
      return Err(BuildError::ZeroShards);
    }
    if let Residency::Bounded { max_entries: 0 } = self.residency {
      return Err(BuildError::ZeroCapacity);
    }
    Ok(())
  }
}

impl<K, V, S, H> CacheBuilder<K, V, S, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  S: RemovalSink<K, V>,
  H: BuildHasher + Clone + Send + Sync,
{
  pub fn build(self) -> Result<LoadingCache<K, V, S, H>, BuildError> {
    self.validate()?;
    let sweep_chance = sweep_frequency::to_chance(self.sweep_frequency);
    Ok(LoadingCache::from_parts(
      self.residency,
      self.sink,
      self.shards.next_power_of_two(),
      self.hasher,
      sweep_chance,
    ))
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn rejects_zero_shards_and_zero_capacity() {
    let err = CacheBuilder::<u32, u32>::new().shards(0).build().unwrap_err();
    assert_eq!(err, BuildError::ZeroShards);

    let err = CacheBuilder::<u32, u32>::new().bounded(0).build().unwrap_err();
    assert_eq!(err, BuildError::ZeroCapacity);
  }

  #[test]
  fn config_carries_over() {
    let config = CacheConfig {
      residency: Residency::Weak { retain: 3 },
      shards: 3,
      ..CacheConfig::default()
    };
    let cache = CacheBuilder::<u32, u32>::from_config(&config).build().unwrap();
    assert_eq!(cache.residency(), Residency::Weak { retain: 3 });
  }

  #[test]
  fn huge_sweep_frequency_saturates() {
    assert_eq!(sweep_frequency::to_chance(0), 0);
    assert_eq!(sweep_frequency::to_chance(20), 32);
    assert_eq!(sweep_frequency::to_chance((1 << 31) + 1), 1 << 31);
    assert_eq!(sweep_frequency::to_chance(u32::MAX), 1 << 31);

    let cache = CacheBuilder::<u32, u32>::new()
      .weak(0)
      .sweep_frequency(u32::MAX)
      .build()
      .unwrap();
    let load = |key: &u32| -> crate::error::Result<u32> { Ok(*key) };
    assert_eq!(*cache.get(&1, &load).unwrap(), 1);
  }
}
