use cellcache::PriorityFetchQueue;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn drain<T>(queue: &PriorityFetchQueue<T>) -> Vec<T> {
  std::iter::from_fn(|| queue.try_take()).collect()
}

#[test]
fn test_levels_are_served_strictly_by_priority() {
  let queue = PriorityFetchQueue::new(2, 16).unwrap();
  queue.put("A", 0, false).unwrap();
  queue.put("B", 1, false).unwrap();
  queue.put("C", 0, true).unwrap();

  assert_eq!(drain(&queue), vec!["C", "A", "B"]);
}

#[test]
fn test_clear_to_prefetch_keeps_priority_order() {
  let queue = PriorityFetchQueue::new(2, 16).unwrap();
  queue.put("x1", 0, false).unwrap();
  queue.put("x2", 0, false).unwrap();
  queue.put("y1", 1, false).unwrap();
  assert_eq!(queue.current_frame(), 0);

  queue.clear_to_prefetch();

  assert_eq!(queue.current_frame(), 1);
  assert_eq!(queue.len(), 3);
  assert_eq!(drain(&queue), vec!["x1", "x2", "y1"]);
}

#[test]
fn test_prefetch_ring_is_capped() {
  let queue = PriorityFetchQueue::new(2, 2).unwrap();
  queue.put("x1", 0, false).unwrap();
  queue.put("x2", 0, false).unwrap();
  queue.put("y1", 1, false).unwrap();

  queue.clear_to_prefetch();

  assert_eq!(drain(&queue), vec!["x1", "x2"]);
}

#[test]
fn test_new_work_is_served_before_prefetch() {
  let queue = PriorityFetchQueue::new(3, 16).unwrap();
  queue.put("old", 0, false).unwrap();
  queue.clear_to_prefetch();
  queue.put("new", 2, false).unwrap();

  assert_eq!(drain(&queue), vec!["new", "old"]);
}

#[test]
fn test_older_prefetch_goes_behind_newer() {
  let queue = PriorityFetchQueue::new(1, 16).unwrap();
  queue.put("first", 0, false).unwrap();
  queue.clear_to_prefetch();
  queue.put("second", 0, false).unwrap();
  queue.clear_to_prefetch();

  assert_eq!(queue.current_frame(), 2);
  assert_eq!(drain(&queue), vec!["second", "first"]);
}

#[test]
fn test_take_blocks_until_put() {
  let queue = Arc::new(PriorityFetchQueue::new(1, 4).unwrap());
  let consumer = {
    let queue = queue.clone();
    thread::spawn(move || queue.take())
  };
  thread::sleep(Duration::from_millis(20));
  queue.put(42, 0, false).unwrap();
  assert_eq!(consumer.join().unwrap(), Some(42));
}

#[test]
fn test_close_releases_consumers() {
  let queue = Arc::new(PriorityFetchQueue::<u32>::new(1, 4).unwrap());
  let consumer = {
    let queue = queue.clone();
    thread::spawn(move || queue.take())
  };
  thread::sleep(Duration::from_millis(20));
  queue.close();
  assert_eq!(consumer.join().unwrap(), None);
  assert!(queue.put(1, 0, false).is_err());
}

#[test]
fn test_clear_drops_everything() {
  let queue = PriorityFetchQueue::new(2, 4).unwrap();
  queue.put(1, 0, false).unwrap();
  queue.clear_to_prefetch();
  queue.put(2, 1, false).unwrap();
  assert_eq!(queue.clear(), 2);
  assert!(queue.is_empty());
}
