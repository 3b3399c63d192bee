use crate::error::Result;
use crate::loader::CacheRemover;

use std::fmt;
use std::sync::Arc;

/// Why a value left memory and was handed to the removal sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
  /// A bounded cache went over capacity.
  Capacity,
  /// Memory was reclaimed explicitly or a soft limit was crossed.
  Reclaimed,
  /// A weakly held value was no longer referenced.
  Collected,
  /// The value is still resident; `persist` asked for a copy to be written.
  Persist,
}

impl fmt::Display for RemovalReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RemovalReason::Capacity => write!(f, "evicted due to capacity"),
      RemovalReason::Reclaimed => write!(f, "reclaimed"),
      RemovalReason::Collected => write!(f, "collected"),
      RemovalReason::Persist => write!(f, "persisted while resident"),
    }
  }
}

/// Where a cache sends values that leave memory, and where invalidations are
/// forwarded after the memory tier has dropped a key.
///
/// The data is captured when the value is loaded, so it is still available
/// after a weakly held value has been collected.
pub trait RemovalSink<K, V>: Send + Sync {
  type Data: Clone + Send + Sync + 'static;

  fn capture(&self, value: &V) -> Self::Data;

  fn hand_off(&self, key: K, data: Self::Data, reason: RemovalReason);

  fn invalidate(&self, key: &K) -> Result<()>;

  fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()>;

  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()>;
}

/// A sink that drops everything. Values leaving memory are simply gone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl<K, V> RemovalSink<K, V> for Discard {
  type Data = ();

  fn capture(&self, _value: &V) {}

  fn hand_off(&self, _key: K, _data: (), _reason: RemovalReason) {}

  fn invalidate(&self, _key: &K) -> Result<()> {
    Ok(())
  }

  fn invalidate_if(
    &self,
    _parallelism_threshold: usize,
    _condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    Ok(())
  }

  fn invalidate_all(&self, _parallelism_threshold: usize) -> Result<()> {
    Ok(())
  }
}

/// A sink that forwards to a [`CacheRemover`].
///
/// `on_removal` failures cannot be returned to whoever triggered the eviction,
/// so they are logged.
#[derive(Debug)]
pub struct HandOff<R> {
  remover: Arc<R>,
}

impl<R> HandOff<R> {
  pub fn new(remover: Arc<R>) -> Self {
    Self { remover }
  }

  pub fn remover(&self) -> &Arc<R> {
    &self.remover
  }
}

impl<R> Clone for HandOff<R> {
  fn clone(&self) -> Self {
    Self {
      remover: self.remover.clone(),
    }
  }
}

impl<K, V, R> RemovalSink<K, V> for HandOff<R>
where
  K: Clone + fmt::Debug,
  R: CacheRemover<K, V>,
{
  type Data = R::Data;

  fn capture(&self, value: &V) -> Self::Data {
    self.remover.extract(value)
  }

  fn hand_off(&self, key: K, data: Self::Data, reason: RemovalReason) {
    tracing::trace!(?key, %reason, "handing off block");
    if let Err(e) = self.remover.on_removal(key.clone(), data) {
      tracing::warn!(?key, %reason, error = %e, "removal hand-off failed");
    }
  }

  fn invalidate(&self, key: &K) -> Result<()> {
    self.remover.invalidate(key)
  }

  fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    self.remover.invalidate_if(parallelism_threshold, condition)
  }

  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    self.remover.invalidate_all(parallelism_threshold)
  }
}
