use super::{run_guarded, ThreadNames};
use crate::error::{Error, Result};
use crate::queue::PausableQueue;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// The threads draining a write-back queue.
///
/// Each thread takes a key and hands it to `write`. The threads stop once the
/// queue is closed and drained.
pub(crate) struct Writers {
  handles: Vec<(String, JoinHandle<()>)>,
}

impl Writers {
  pub(crate) fn spawn<K>(
    count: usize,
    names: &ThreadNames,
    queue: Arc<PausableQueue<K>>,
    write: Arc<dyn Fn(K) + Send + Sync>,
  ) -> Result<Self>
  where
    K: Send + 'static,
  {
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
      let name = names.next_name();
      let worker_queue = queue.clone();
      let write = write.clone();
      let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
          tracing::debug!("writer started");
          while let Some(key) = worker_queue.take() {
            run_guarded("write-back", || write(key));
          }
          tracing::debug!("writer stopped");
        })
        .map_err(Error::from);
      match handle {
        Ok(handle) => handles.push((name, handle)),
        Err(e) => {
          // Threads already running would otherwise block forever in `take`.
          queue.close();
          Self { handles }.join();
          return Err(e);
        }
      }
    }
    Ok(Self { handles })
  }

  pub(crate) fn len(&self) -> usize {
    self.handles.len()
  }

  /// Waits for every thread. The queue must have been closed.
  pub(crate) fn join(&mut self) {
    for (name, handle) in self.handles.drain(..) {
      if handle.join().is_err() {
        tracing::error!(thread = %name, "writer thread panicked");
      }
    }
  }
}
