use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// A boxed error produced by a user-supplied loader.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while loading, persisting or waiting on blocks.
///
/// `Error` is cheaply cloneable: a single failed load is delivered to every
/// caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
  /// The loader failed to produce a value for a key.
  #[error("failed to load block: {0}")]
  Load(Arc<dyn std::error::Error + Send + Sync + 'static>),

  /// Reading or writing durable block storage failed.
  #[error("block storage i/o failed: {0}")]
  Io(Arc<io::Error>),

  /// A block read back from storage did not match what the codec expects.
  #[error("block '{key}' is corrupt: {reason}")]
  Corrupt { key: String, reason: String },

  /// A user-supplied store panicked. Carries the panic message.
  #[error("store panicked: {0}")]
  Panicked(String),

  /// A blocking wait was cut short before its condition was met.
  #[error("wait was interrupted")]
  Interrupted,

  /// The component was shut down while the call was in progress.
  #[error("component has been shut down")]
  Shutdown,

  /// A component could not be built from its configuration.
  #[error(transparent)]
  Config(#[from] BuildError),
}

impl Error {
  /// Wraps an arbitrary loader failure.
  pub fn load<E>(error: E) -> Self
  where
    E: Into<BoxError>,
  {
    Error::Load(Arc::from(error.into()))
  }

  /// Convenience constructor for a loader failure described by a message.
  pub fn load_msg(message: impl fmt::Display) -> Self {
    Error::load(message.to_string())
  }

  pub(crate) fn corrupt(key: impl fmt::Display, reason: impl Into<String>) -> Self {
    Error::Corrupt {
      key: key.to_string(),
      reason: reason.into(),
    }
  }
}

impl From<io::Error> for Error {
  fn from(error: io::Error) -> Self {
    Error::Io(Arc::new(error))
  }
}

/// A specialized `Result` type for cache operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur when building a cache or one of its components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  /// A bounded cache was configured with a capacity of zero.
  #[error("bounded cache capacity cannot be zero")]
  ZeroCapacity,
  /// The cache was configured with zero shards, which is not allowed.
  #[error("shard count cannot be zero")]
  ZeroShards,
  /// A queue was configured with a capacity of zero.
  #[error("queue capacity cannot be zero")]
  ZeroQueueCapacity,
  /// A priority fetch queue was configured without any priority level.
  #[error("fetch queue needs at least one priority level")]
  ZeroPriorityLevels,
  /// The block directory could not be created.
  #[error("failed to prepare block directory '{path}': {reason}")]
  Directory { path: String, reason: String },
}
