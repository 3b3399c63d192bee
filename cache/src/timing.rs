//! Accounting for time spent blocked on I/O.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use ahash::HashMap;
use parking_lot::Mutex;

fn nanos(duration: Duration) -> i64 {
  i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Remaining time per priority level, in nanoseconds.
///
/// Level 0 is the highest priority. A lower priority level never has more
/// time left than a higher one; every update restores that order by clamping.
pub struct IoTimeBudget {
  budgets: Mutex<Vec<i64>>,
}

impl fmt::Debug for IoTimeBudget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IoTimeBudget")
      .field("remaining_nanos", &*self.budgets.lock())
      .finish()
  }
}

fn clamp_descending(budgets: &mut [i64]) {
  for i in 1..budgets.len() {
    if budgets[i] > budgets[i - 1] {
      budgets[i] = budgets[i - 1];
    }
  }
}

impl IoTimeBudget {
  /// Creates a budget with `levels` levels and no time on any of them.
  pub fn new(levels: usize) -> Self {
    Self {
      budgets: Mutex::new(vec![0; levels]),
    }
  }

  pub fn levels(&self) -> usize {
    self.budgets.lock().len()
  }

  /// Starts a new accounting period. Levels past the end of `budgets` get the
  /// last given value; extra values are ignored.
  pub fn reset(&self, budgets: &[Duration]) {
    let mut current = self.budgets.lock();
    let fill = budgets.last().copied().map(nanos).unwrap_or(0);
    for (i, slot) in current.iter_mut().enumerate() {
      *slot = budgets.get(i).copied().map(nanos).unwrap_or(fill);
    }
    clamp_descending(&mut current);
  }

  /// Charges `time` to `level` and every higher priority level.
  pub fn use_time(&self, time: Duration, level: usize) {
    let t = nanos(time);
    let mut current = self.budgets.lock();
    let last = level.min(current.len().saturating_sub(1));
    for slot in current.iter_mut().take(last + 1) {
      *slot = slot.saturating_sub(t);
    }
    clamp_descending(&mut current);
  }

  /// Time left at `level`, never negative. Levels past the end read the last
  /// level.
  pub fn time_left(&self, level: usize) -> Duration {
    let current = self.budgets.lock();
    match current.get(level).or_else(|| current.last()) {
      Some(&left) if left > 0 => Duration::from_nanos(left as u64),
      _ => Duration::ZERO,
    }
  }

  /// Remaining nanoseconds per level; may be negative after overspending.
  pub fn remaining_nanos(&self) -> Vec<i64> {
    self.budgets.lock().clone()
  }
}

#[derive(Debug, Default)]
struct Stopwatches {
  // Start time and nesting depth of each thread currently in I/O.
  running: HashMap<ThreadId, (Instant, u32)>,
  // Set while at least one thread is in I/O.
  wall_started: Option<Instant>,
  wall_nanos: u64,
  cumulative_nanos: u64,
}

/// Measures blocking I/O: wall-clock time during which any thread was in I/O,
/// the sum over all threads, and bytes moved. Also carries the time budget
/// that the measured time is charged against.
#[derive(Debug)]
pub struct IoStatistics {
  stopwatches: Mutex<Stopwatches>,
  io_bytes: AtomicU64,
  budget: IoTimeBudget,
}

impl IoStatistics {
  pub fn new(budget_levels: usize) -> Self {
    Self {
      stopwatches: Mutex::new(Stopwatches::default()),
      io_bytes: AtomicU64::new(0),
      budget: IoTimeBudget::new(budget_levels),
    }
  }

  /// Marks the calling thread as blocked on I/O. Calls nest.
  pub fn start(&self) {
    let now = Instant::now();
    let mut watches = self.stopwatches.lock();
    if watches.running.is_empty() {
      watches.wall_started = Some(now);
    }
    watches
      .running
      .entry(thread::current().id())
      .and_modify(|(_, depth)| *depth += 1)
      .or_insert((now, 1));
  }

  /// Ends the calling thread's I/O started by the matching [`start`](Self::start).
  /// Returns the time this thread spent, or zero for an inner nested call.
  pub fn stop(&self) -> Duration {
    let now = Instant::now();
    let id = thread::current().id();
    let mut watches = self.stopwatches.lock();
    let Some((started, depth)) = watches.running.get_mut(&id).map(|(s, d)| (*s, d)) else {
      return Duration::ZERO;
    };
    if *depth > 1 {
      *depth -= 1;
      return Duration::ZERO;
    }
    watches.running.remove(&id);

    let elapsed = now.saturating_duration_since(started);
    watches.cumulative_nanos += elapsed.as_nanos() as u64;
    if watches.running.is_empty() {
      if let Some(wall_started) = watches.wall_started.take() {
        watches.wall_nanos += now.saturating_duration_since(wall_started).as_nanos() as u64;
      }
    }
    elapsed
  }

  /// Brackets I/O with a guard that stops the stopwatch when dropped.
  pub fn timer(&self) -> IoTimer<'_> {
    self.start();
    IoTimer { statistics: self }
  }

  /// Wall-clock nanoseconds during which at least one thread was in I/O.
  pub fn io_nanos(&self) -> u64 {
    self.stopwatches.lock().wall_nanos
  }

  /// Sum of the I/O time of every thread.
  pub fn cumulative_io_nanos(&self) -> u64 {
    self.stopwatches.lock().cumulative_nanos
  }

  pub fn add_io_bytes(&self, bytes: u64) {
    self.io_bytes.fetch_add(bytes, Ordering::Relaxed);
  }

  pub fn io_bytes(&self) -> u64 {
    self.io_bytes.load(Ordering::Relaxed)
  }

  pub fn time_budget(&self) -> &IoTimeBudget {
    &self.budget
  }
}

/// Stops its thread's I/O stopwatch when dropped.
#[must_use = "the stopwatch stops as soon as the timer is dropped"]
#[derive(Debug)]
pub struct IoTimer<'a> {
  statistics: &'a IoStatistics,
}

impl Drop for IoTimer<'_> {
  fn drop(&mut self) {
    self.statistics.stop();
  }
}
