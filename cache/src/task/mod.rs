//! Background threads: the fetcher pool that runs prioritized loads and the
//! writers that drain the write-back queue.

pub mod fetcher;
pub(crate) mod writer;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out thread names for one pool: `"<prefix>-0"`, `"<prefix>-1"`, ...
///
/// Each pool owns its generator, so names restart at zero per pool.
#[derive(Debug)]
pub struct ThreadNames {
  prefix: String,
  next: AtomicUsize,
}

impl ThreadNames {
  pub fn new(prefix: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      next: AtomicUsize::new(0),
    }
  }

  pub fn next_name(&self) -> String {
    let index = self.next.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", self.prefix, index)
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    message
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.as_str()
  } else {
    "unknown panic payload"
  }
}

/// Runs one unit of background work, logging a panic instead of letting it
/// take the thread down. Returns `false` if `work` panicked.
pub(crate) fn run_guarded<F: FnOnce()>(what: &str, work: F) -> bool {
  match panic::catch_unwind(AssertUnwindSafe(work)) {
    Ok(()) => true,
    Err(payload) => {
      tracing::error!(task = what, panic = panic_message(payload.as_ref()), "background task panicked");
      false
    }
  }
}
