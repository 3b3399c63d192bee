//! Presets for how often a load into a weak cache also sweeps its shard for
//! collected values. Each is the average number of loads per sweep.

/// Sweeps on roughly one load in 16. Dead entries are found quickly, which
/// suits caches whose values are written back on collection.
pub const RESPONSIVE: u32 = 16;

/// Sweeps on roughly one load in 64.
pub const THROUGHPUT: u32 = 64;

/// Sweeps on roughly one load in 256. Dead entries linger longer and are
/// mostly reaped lazily on their next access or by `clean_up`.
pub const LOW_OVERHEAD: u32 = 256;

/// Never sweeps opportunistically.
pub const NEVER: u32 = 0;

/// Rounds `loads_per_sweep` up to the power of two the sampler needs.
/// Saturates at 2^31 loads per sweep.
pub(crate) fn to_chance(loads_per_sweep: u32) -> u32 {
  match loads_per_sweep {
    0 => 0,
    n => n.checked_next_power_of_two().unwrap_or(1 << 31),
  }
}
