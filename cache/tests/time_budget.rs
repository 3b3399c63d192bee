use cellcache::{IoStatistics, IoTimeBudget};

use pretty_assertions::assert_eq;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn ns(nanos: u64) -> Duration {
  Duration::from_nanos(nanos)
}

#[test]
fn test_use_time_charges_higher_levels_and_clamps_lower() {
  let budget = IoTimeBudget::new(4);
  budget.reset(&[ns(100); 4]);

  budget.use_time(ns(60), 2);

  assert_eq!(budget.remaining_nanos(), vec![40, 40, 40, 40]);
}

#[test]
fn test_use_time_on_top_level_only() {
  let budget = IoTimeBudget::new(3);
  budget.reset(&[ns(100), ns(80), ns(50)]);

  budget.use_time(ns(30), 0);

  assert_eq!(budget.remaining_nanos(), vec![70, 70, 50]);
}

#[test]
fn test_reset_fills_and_clamps() {
  let budget = IoTimeBudget::new(4);
  budget.reset(&[ns(10), ns(50)]);
  assert_eq!(budget.remaining_nanos(), vec![10, 10, 10, 10]);

  budget.reset(&[ns(50), ns(10)]);
  assert_eq!(budget.remaining_nanos(), vec![50, 10, 10, 10]);

  budget.reset(&[]);
  assert_eq!(budget.remaining_nanos(), vec![0, 0, 0, 0]);
}

#[test]
fn test_time_left_is_never_negative() {
  let budget = IoTimeBudget::new(2);
  budget.reset(&[ns(100), ns(100)]);
  budget.use_time(Duration::from_micros(1), 1);

  assert!(budget.remaining_nanos().iter().all(|left| *left < 0));
  assert_eq!(budget.time_left(0), Duration::ZERO);
  assert_eq!(budget.time_left(1), Duration::ZERO);
}

#[test]
fn test_time_left_past_last_level_reads_last() {
  let budget = IoTimeBudget::new(2);
  budget.reset(&[ns(100), ns(30)]);
  assert_eq!(budget.time_left(1), ns(30));
  assert_eq!(budget.time_left(7), ns(30));
}

#[test]
fn test_overlapping_io_counts_wall_time_once() {
  let statistics = Arc::new(IoStatistics::new(1));
  let barrier = Arc::new(Barrier::new(2));

  let handles: Vec<_> = (0..2)
    .map(|_| {
      let statistics = statistics.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        let _timer = statistics.timer();
        thread::sleep(Duration::from_millis(30));
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }

  let wall = statistics.io_nanos();
  let cumulative = statistics.cumulative_io_nanos();
  assert!(wall >= 30_000_000);
  assert!(cumulative >= 60_000_000);
  assert!(wall < cumulative);
}

#[test]
fn test_io_bytes_accumulate() {
  let statistics = IoStatistics::new(1);
  statistics.add_io_bytes(4096);
  statistics.add_io_bytes(512);
  assert_eq!(statistics.io_bytes(), 4608);
  assert_eq!(statistics.time_budget().levels(), 1);
}
