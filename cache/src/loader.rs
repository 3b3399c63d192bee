//! The two narrow contracts the cache consumes from the outside world:
//! producing a value for a key ([`CacheLoader`]) and persisting/reconstructing
//! an evicted value ([`CacheRemover`]), plus the common [`LoaderCache`]
//! surface shared by every residency policy.

use crate::error::Result;

use std::sync::Arc;

/// Produces the value for a key.
///
/// A loader must be safe to call concurrently for distinct keys. For a given
/// key the cache only ever calls it once at a time.
pub trait CacheLoader<K, V>: Send + Sync {
  fn load(&self, key: &K) -> Result<V>;
}

impl<K, V, F> CacheLoader<K, V> for F
where
  F: Fn(&K) -> Result<V> + Send + Sync,
{
  fn load(&self, key: &K) -> Result<V> {
    self(key)
  }
}

/// Receives values that leave the memory tier and is able to bring them back.
///
/// `Data` is the persistable form of a value. Extracting data from a value and
/// reconstructing a value from data must share the underlying storage, so a
/// value that is evicted, reconstructed and evicted again yields the same data
/// instance.
pub trait CacheRemover<K, V>: Send + Sync {
  type Data: Clone + Send + Sync + 'static;

  /// Extracts the persistable form of `value`.
  fn extract(&self, value: &V) -> Self::Data;

  /// Rebuilds a value for `key` from previously extracted data.
  fn reconstruct(&self, key: &K, data: Self::Data) -> V;

  /// Called when the value for `key` has been evicted.
  fn on_removal(&self, key: K, data: Self::Data) -> Result<()>;

  /// Whether `data` has anything worth persisting. Removers that track
  /// modifications return `false` for untouched blocks.
  fn needs_persist(&self, _data: &Self::Data) -> bool {
    true
  }

  /// Discards any durable state for `key`.
  fn invalidate(&self, key: &K) -> Result<()>;

  /// Discards durable state for every key matching `condition`.
  fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()>;

  /// Discards all durable state.
  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()>;
}

impl<K, V, R> CacheRemover<K, V> for Arc<R>
where
  R: CacheRemover<K, V> + ?Sized,
{
  type Data = R::Data;

  fn extract(&self, value: &V) -> Self::Data {
    (**self).extract(value)
  }

  fn reconstruct(&self, key: &K, data: Self::Data) -> V {
    (**self).reconstruct(key, data)
  }

  fn on_removal(&self, key: K, data: Self::Data) -> Result<()> {
    (**self).on_removal(key, data)
  }

  fn needs_persist(&self, data: &Self::Data) -> bool {
    (**self).needs_persist(data)
  }

  fn invalidate(&self, key: &K) -> Result<()> {
    (**self).invalidate(key)
  }

  fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    (**self).invalidate_if(parallelism_threshold, condition)
  }

  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    (**self).invalidate_all(parallelism_threshold)
  }
}

/// The surface shared by every residency policy: look up, load at most once,
/// and invalidate.
pub trait LoaderCache<K, V>: Send + Sync {
  /// Returns the resident value for `key` without loading it.
  fn get_if_present(&self, key: &K) -> Option<Arc<V>>;

  /// Returns the value for `key`, calling `loader` on a miss.
  ///
  /// Concurrent callers for the same missing key share a single invocation of
  /// the loader and all observe its value or its error.
  fn get(&self, key: &K, loader: &dyn CacheLoader<K, V>) -> Result<Arc<V>>;

  /// Removes `key`, including any durable state behind the cache.
  fn invalidate(&self, key: &K) -> Result<()>;

  /// Removes every key matching `condition`. Above `parallelism_threshold`
  /// entries the scan runs in parallel.
  fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()>;

  /// Removes every key.
  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()>;
}

impl<K, V, C> LoaderCache<K, V> for Arc<C>
where
  C: LoaderCache<K, V> + ?Sized,
{
  fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
    (**self).get_if_present(key)
  }

  fn get(&self, key: &K, loader: &dyn CacheLoader<K, V>) -> Result<Arc<V>> {
    (**self).get(key, loader)
  }

  fn invalidate(&self, key: &K) -> Result<()> {
    (**self).invalidate(key)
  }

  fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    (**self).invalidate_if(parallelism_threshold, condition)
  }

  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    (**self).invalidate_all(parallelism_threshold)
  }
}
