use super::QueueOrder;
use crate::error::{BuildError, Error, Result};

use std::collections::VecDeque;
use std::fmt;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
  items: VecDeque<T>,
  paused: bool,
  closed: bool,
  // Consumers currently blocked in `take`.
  parked: usize,
}

/// A bounded blocking queue for a fixed, known number of consumer threads.
///
/// [`pause`](Self::pause) freezes the consumers and returns only once every one
/// of them is parked in [`take`](Self::take). While paused the content can be
/// edited without racing a consumer that has already taken an item.
pub struct PausableQueue<T> {
  inner: Mutex<Inner<T>>,
  // Signalled when an item arrives, on resume and on close.
  consumers_cv: Condvar,
  // Signalled when space frees up, on resume and on close.
  producers_cv: Condvar,
  // Signalled when the last consumer parks while paused.
  parked_cv: Condvar,
  capacity: usize,
  consumers: usize,
  order: QueueOrder,
}

impl<T> fmt::Debug for PausableQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("PausableQueue")
      .field("len", &inner.items.len())
      .field("capacity", &self.capacity)
      .field("consumers", &self.consumers)
      .field("parked", &inner.parked)
      .field("paused", &inner.paused)
      .field("closed", &inner.closed)
      .field("order", &self.order)
      .finish()
  }
}

impl<T> PausableQueue<T> {
  /// Creates a queue served by exactly `consumers` threads.
  pub fn new(capacity: usize, consumers: usize, order: QueueOrder) -> Result<Self, BuildError> {
    if capacity == 0 {
      return Err(BuildError::ZeroQueueCapacity);
    }
    Ok(Self {
      inner: Mutex::new(Inner {
        items: VecDeque::with_capacity(capacity),
        paused: false,
        closed: false,
        parked: 0,
      }),
      consumers_cv: Condvar::new(),
      producers_cv: Condvar::new(),
      parked_cv: Condvar::new(),
      capacity,
      consumers,
      order,
    })
  }

  /// Appends `item`, blocking while the queue is full or paused.
  pub fn put(&self, item: T) -> Result<()> {
    let mut inner = self.inner.lock();
    loop {
      if inner.closed {
        return Err(Error::Shutdown);
      }
      if !inner.paused && inner.items.len() < self.capacity {
        inner.items.push_back(item);
        drop(inner);
        self.consumers_cv.notify_one();
        return Ok(());
      }
      self.producers_cv.wait(&mut inner);
    }
  }

  /// Takes the next item, blocking while the queue is empty or paused.
  /// Returns `None` once the queue is closed and drained.
  pub fn take(&self) -> Option<T> {
    let mut inner = self.inner.lock();
    loop {
      if !inner.paused || inner.closed {
        let next = match self.order {
          QueueOrder::Fifo => inner.items.pop_front(),
          QueueOrder::Lifo => inner.items.pop_back(),
        };
        if let Some(item) = next {
          drop(inner);
          self.producers_cv.notify_one();
          return Some(item);
        }
        if inner.closed {
          return None;
        }
      }

      inner.parked += 1;
      if inner.paused && inner.parked >= self.consumers {
        self.parked_cv.notify_all();
      }
      self.consumers_cv.wait(&mut inner);
      inner.parked -= 1;
    }
  }

  /// Freezes the consumers and waits until all of them are parked. Calling it
  /// again while paused only waits.
  pub fn pause(&self) {
    let mut inner = self.inner.lock();
    inner.paused = true;
    tracing::trace!(consumers = self.consumers, "pausing queue");
    while inner.parked < self.consumers && !inner.closed {
      self.parked_cv.wait(&mut inner);
    }
  }

  pub fn resume(&self) {
    let mut inner = self.inner.lock();
    if !inner.paused {
      return;
    }
    inner.paused = false;
    drop(inner);
    tracing::trace!("resuming queue");
    self.consumers_cv.notify_all();
    self.producers_cv.notify_all();
  }

  pub fn is_paused(&self) -> bool {
    self.inner.lock().paused
  }

  /// Removes every queued item equal to `item`. Returns how many were removed.
  pub fn remove(&self, item: &T) -> usize
  where
    T: PartialEq,
  {
    self.remove_if(|queued| queued == item)
  }

  /// Removes every queued item matching `predicate`.
  pub fn remove_if(&self, mut predicate: impl FnMut(&T) -> bool) -> usize {
    let mut inner = self.inner.lock();
    let before = inner.items.len();
    inner.items.retain(|item| !predicate(item));
    let removed = before - inner.items.len();
    drop(inner);
    if removed > 0 {
      self.producers_cv.notify_all();
    }
    removed
  }

  pub fn clear(&self) -> usize {
    self.remove_if(|_| true)
  }

  /// Wakes every blocked producer and consumer. Consumers drain what is left,
  /// then receive `None`; producers fail with [`Error::Shutdown`].
  pub fn close(&self) {
    let mut inner = self.inner.lock();
    inner.closed = true;
    drop(inner);
    self.consumers_cv.notify_all();
    self.producers_cv.notify_all();
    self.parked_cv.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self.inner.lock().closed
  }

  pub fn len(&self) -> usize {
    self.inner.lock().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn consumers(&self) -> usize {
    self.consumers
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn lifo_takes_newest_first() {
    let queue = PausableQueue::new(4, 1, QueueOrder::Lifo).unwrap();
    for i in 0..3 {
      queue.put(i).unwrap();
    }
    assert_eq!(queue.take(), Some(2));
    assert_eq!(queue.take(), Some(1));
    assert_eq!(queue.take(), Some(0));
  }

  #[test]
  fn pause_without_consumers_returns_immediately() {
    let queue: PausableQueue<u32> = PausableQueue::new(1, 0, QueueOrder::Fifo).unwrap();
    queue.pause();
    queue.pause();
    assert!(queue.is_paused());
    queue.resume();
    assert!(!queue.is_paused());
  }

  #[test]
  fn closed_queue_drains_then_ends() {
    let queue = PausableQueue::new(2, 1, QueueOrder::Fifo).unwrap();
    queue.put(1).unwrap();
    queue.close();
    assert!(matches!(queue.put(2), Err(Error::Shutdown)));
    assert_eq!(queue.take(), Some(1));
    assert_eq!(queue.take(), None);
  }

  #[test]
  fn zero_capacity_is_rejected() {
    assert_eq!(
      PausableQueue::<u8>::new(0, 1, QueueOrder::Fifo).unwrap_err(),
      BuildError::ZeroQueueCapacity
    );
  }
}
