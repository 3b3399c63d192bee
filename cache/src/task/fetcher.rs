use super::{run_guarded, ThreadNames};
use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::queue::PriorityFetchQueue;

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A unit of background loading.
pub struct FetchTask {
  label: String,
  work: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl fmt::Debug for FetchTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetchTask").field("label", &self.label).finish_non_exhaustive()
  }
}

impl FetchTask {
  pub fn new<F>(label: impl Into<String>, work: F) -> Self
  where
    F: FnOnce() -> Result<()> + Send + 'static,
  {
    Self {
      label: label.into(),
      work: Box::new(work),
    }
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn run(self) -> Result<()> {
    (self.work)()
  }
}

/// Per-thread pause deadline shared between a worker and the pool handle.
#[derive(Debug, Default)]
struct PauseGate {
  until: Mutex<Option<Instant>>,
  changed: Condvar,
}

impl PauseGate {
  fn pause_until(&self, deadline: Instant) {
    *self.until.lock() = Some(deadline);
    self.changed.notify_all();
  }

  fn wake_up(&self) {
    *self.until.lock() = None;
    self.changed.notify_all();
  }

  /// Sleeps until the deadline passes or `wake_up` is called.
  fn wait(&self) {
    let mut until = self.until.lock();
    while let Some(deadline) = *until {
      if Instant::now() >= deadline {
        *until = None;
        break;
      }
      self.changed.wait_until(&mut until, deadline);
    }
  }
}

struct Worker {
  name: String,
  gate: Arc<PauseGate>,
  handle: Option<JoinHandle<()>>,
}

/// A fixed set of threads executing [`FetchTask`]s from a shared
/// [`PriorityFetchQueue`].
///
/// Task failures and panics are logged and the thread moves on to the next
/// task. The threads exit only through [`shutdown`](Self::shutdown), which is
/// also called on drop.
pub struct FetcherPool {
  queue: Arc<PriorityFetchQueue<FetchTask>>,
  workers: Vec<Worker>,
}

impl fmt::Debug for FetcherPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetcherPool")
      .field("threads", &self.workers.iter().map(|w| &w.name).collect::<Vec<_>>())
      .field("queue", &self.queue)
      .finish()
  }
}

impl FetcherPool {
  /// Starts `threads` workers named from `names`.
  pub fn spawn(
    queue: Arc<PriorityFetchQueue<FetchTask>>,
    threads: usize,
    names: &ThreadNames,
  ) -> Result<Self> {
    let mut pool = Self {
      queue,
      workers: Vec::with_capacity(threads),
    };
    for _ in 0..threads {
      let name = names.next_name();
      let gate = Arc::new(PauseGate::default());
      // Registered before the thread exists so a pause already waits for it.
      pool.queue.add_consumers(1);
      let spawned = {
        let queue = pool.queue.clone();
        let gate = gate.clone();
        thread::Builder::new()
          .name(name.clone())
          .spawn(move || Self::run(queue, gate))
      };
      let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
          pool.queue.remove_consumers(1);
          return Err(Error::from(e));
        }
      };
      pool.workers.push(Worker {
        name,
        gate,
        handle: Some(handle),
      });
    }
    Ok(pool)
  }

  /// Builds the queue and the pool described by `config`.
  pub fn from_config(config: &FetchConfig) -> Result<Self> {
    let queue = PriorityFetchQueue::new(config.priority_levels, config.prefetch_capacity)?;
    Self::spawn(
      Arc::new(queue),
      config.fetcher_threads,
      &ThreadNames::new(config.thread_name.clone()),
    )
  }

  fn run(queue: Arc<PriorityFetchQueue<FetchTask>>, gate: Arc<PauseGate>) {
    tracing::debug!("fetcher started");
    while let Some(task) = queue.take() {
      gate.wait();
      let label = task.label.clone();
      run_guarded(&label, || {
        if let Err(e) = task.run() {
          tracing::warn!(task = %label, error = %e, "fetch task failed");
        }
      });
    }
    tracing::debug!("fetcher stopped");
  }

  pub fn queue(&self) -> &Arc<PriorityFetchQueue<FetchTask>> {
    &self.queue
  }

  pub fn threads(&self) -> usize {
    self.workers.len()
  }

  pub fn thread_names(&self) -> impl Iterator<Item = &str> {
    self.workers.iter().map(|worker| worker.name.as_str())
  }

  /// Queues `task` on the pool's queue.
  pub fn submit(&self, task: FetchTask, priority: usize, to_front: bool) -> Result<()> {
    self.queue.put(task, priority, to_front)
  }

  /// Holds every worker back until `deadline` before it runs its next task.
  /// A task already running is not interrupted.
  ///
  /// To stop the workers from taking anything at all, pause the queue
  /// instead; that waits for tasks in hand to finish.
  pub fn pause_until(&self, deadline: Instant) {
    for worker in &self.workers {
      worker.gate.pause_until(deadline);
    }
  }

  pub fn pause_for(&self, duration: Duration) {
    self.pause_until(Instant::now() + duration);
  }

  /// Lifts any pause deadline.
  pub fn wake_up(&self) {
    for worker in &self.workers {
      worker.gate.wake_up();
    }
  }

  /// Closes the queue and joins every worker. Queued tasks that have not
  /// started are dropped.
  pub fn shutdown(&mut self) {
    self.queue.close();
    self.wake_up();
    let mut stopped = 0;
    for worker in &mut self.workers {
      if let Some(handle) = worker.handle.take() {
        if handle.join().is_err() {
          tracing::error!(thread = %worker.name, "fetcher thread panicked");
        }
        stopped += 1;
      }
    }
    self.queue.remove_consumers(stopped);
  }
}

impl Drop for FetcherPool {
  fn drop(&mut self) {
    self.shutdown();
  }
}
