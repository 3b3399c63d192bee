use std::sync::atomic::{AtomicU64, Ordering};

const WEYL_CONSTANT: u64 = 0x9E3779B97F4A7C15;

/// A fast, thread-safe, non-cryptographic pseudo-random number generator
/// using a Weyl sequence on an atomic integer. Used to decide when a lookup
/// also sweeps dead weak entries.
#[derive(Debug)]
pub(crate) struct FastRng {
  state: AtomicU64,
}

impl FastRng {
  pub fn new(seed: u64) -> Self {
    Self {
      state: AtomicU64::new(if seed == 0 { 1 } else { seed }),
    }
  }

  #[inline(always)]
  fn next_weyl(&self) -> u64 {
    // Relaxed is enough: only this value needs atomicity.
    self.state.fetch_add(WEYL_CONSTANT, Ordering::Relaxed)
  }

  /// Returns true with a probability of 1 in `denominator_pow2`, which must be
  /// a power of two.
  #[inline(always)]
  pub fn should_run(&self, denominator_pow2: u32) -> bool {
    let mask = (denominator_pow2 - 1) as u64;
    ((self.next_weyl() >> 32) & mask) == 0
  }
}
