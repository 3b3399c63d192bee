use crate::error::Result;
use crate::loader::{CacheLoader, LoaderCache};

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A [`LoaderCache`] paired with the loader it should always use, so callers
/// can simply ask for a key.
pub struct BoundCache<K, V, C, L> {
  cache: C,
  loader: L,
  _marker: PhantomData<fn(&K) -> V>,
}

impl<K, V, C: fmt::Debug, L> fmt::Debug for BoundCache<K, V, C, L> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BoundCache")
      .field("cache", &self.cache)
      .finish_non_exhaustive()
  }
}

impl<K, V, C, L> BoundCache<K, V, C, L>
where
  C: LoaderCache<K, V>,
  L: CacheLoader<K, V>,
{
  pub fn new(cache: C, loader: L) -> Self {
    Self {
      cache,
      loader,
      _marker: PhantomData,
    }
  }

  /// Returns the value for `key`, loading it with the bound loader on a miss.
  pub fn get(&self, key: &K) -> Result<Arc<V>> {
    self.cache.get(key, &self.loader)
  }

  pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
    self.cache.get_if_present(key)
  }

  pub fn invalidate(&self, key: &K) -> Result<()> {
    self.cache.invalidate(key)
  }

  pub fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    self.cache.invalidate_if(parallelism_threshold, condition)
  }

  pub fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    self.cache.invalidate_all(parallelism_threshold)
  }

  pub fn cache(&self) -> &C {
    &self.cache
  }

  pub fn loader(&self) -> &L {
    &self.loader
  }

  pub fn into_parts(self) -> (C, L) {
    (self.cache, self.loader)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::LoadingCache;

  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn bound_loader_runs_once_per_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = LoadingCache::<u32, String>::builder().bounded(8).build().unwrap();
    let bound = BoundCache::new(cache, move |key: &u32| -> Result<String> {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(format!("block-{key}"))
    });

    assert_eq!(*bound.get(&1).unwrap(), "block-1");
    assert_eq!(*bound.get(&1).unwrap(), "block-1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    bound.invalidate(&1).unwrap();
    assert!(bound.get_if_present(&1).is_none());
  }
}
