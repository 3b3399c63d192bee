//! Blocks of primitive elements, the unit the disk store persists.

use crate::error::{Error, Result};
use crate::volatile::Volatile;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Width of the elements stored in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ElementType {
  U8,
  U16,
  U32,
  U64,
}

impl ElementType {
  pub const fn bytes_per_element(self) -> usize {
    match self {
      ElementType::U8 => 1,
      ElementType::U16 => 2,
      ElementType::U32 => 4,
      ElementType::U64 => 8,
    }
  }
}

/// The raw elements of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStorage {
  U8(Vec<u8>),
  U16(Vec<u16>),
  U32(Vec<u32>),
  U64(Vec<u64>),
}

macro_rules! encode_le {
  ($values:expr, $out:expr, $width:expr) => {
    for (value, chunk) in $values.iter().zip($out.chunks_exact_mut($width)) {
      chunk.copy_from_slice(&value.to_le_bytes());
    }
  };
}

macro_rules! decode_le {
  ($ty:ty, $bytes:expr, $width:expr) => {
    $bytes
      .chunks_exact($width)
      .map(|chunk| {
        let mut raw = [0u8; $width];
        raw.copy_from_slice(chunk);
        <$ty>::from_le_bytes(raw)
      })
      .collect()
  };
}

impl BlockStorage {
  /// `len` zeroed elements of `element_type`.
  pub fn zeroed(element_type: ElementType, len: usize) -> Self {
    match element_type {
      ElementType::U8 => BlockStorage::U8(vec![0; len]),
      ElementType::U16 => BlockStorage::U16(vec![0; len]),
      ElementType::U32 => BlockStorage::U32(vec![0; len]),
      ElementType::U64 => BlockStorage::U64(vec![0; len]),
    }
  }

  pub fn element_type(&self) -> ElementType {
    match self {
      BlockStorage::U8(_) => ElementType::U8,
      BlockStorage::U16(_) => ElementType::U16,
      BlockStorage::U32(_) => ElementType::U32,
      BlockStorage::U64(_) => ElementType::U64,
    }
  }

  /// Number of elements.
  pub fn len(&self) -> usize {
    match self {
      BlockStorage::U8(v) => v.len(),
      BlockStorage::U16(v) => v.len(),
      BlockStorage::U32(v) => v.len(),
      BlockStorage::U64(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Size of the encoded form.
  pub fn byte_len(&self) -> usize {
    self.len() * self.element_type().bytes_per_element()
  }

  /// Writes the little-endian form into `out`, which must be exactly
  /// [`byte_len`](Self::byte_len) bytes long.
  pub fn write_le_bytes(&self, out: &mut [u8]) -> Result<()> {
    if out.len() != self.byte_len() {
      return Err(Error::from(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("expected {} bytes, got {}", self.byte_len(), out.len()),
      )));
    }
    match self {
      BlockStorage::U8(v) => out.copy_from_slice(v),
      BlockStorage::U16(v) => encode_le!(v, out, 2),
      BlockStorage::U32(v) => encode_le!(v, out, 4),
      BlockStorage::U64(v) => encode_le!(v, out, 8),
    }
    Ok(())
  }

  pub fn to_le_bytes(&self) -> Vec<u8> {
    let mut out = vec![0u8; self.byte_len()];
    // The buffer has the exact size, so this cannot fail.
    let _ = self.write_le_bytes(&mut out);
    out
  }

  /// Decodes little-endian bytes. Returns `None` if `bytes` is not a whole
  /// number of elements.
  pub fn from_le_bytes(element_type: ElementType, bytes: &[u8]) -> Option<Self> {
    if bytes.len() % element_type.bytes_per_element() != 0 {
      return None;
    }
    Some(match element_type {
      ElementType::U8 => BlockStorage::U8(bytes.to_vec()),
      ElementType::U16 => BlockStorage::U16(decode_le!(u16, bytes, 2)),
      ElementType::U32 => BlockStorage::U32(decode_le!(u32, bytes, 4)),
      ElementType::U64 => BlockStorage::U64(decode_le!(u64, bytes, 8)),
    })
  }
}

impl From<Vec<u8>> for BlockStorage {
  fn from(values: Vec<u8>) -> Self {
    BlockStorage::U8(values)
  }
}

impl From<Vec<u16>> for BlockStorage {
  fn from(values: Vec<u16>) -> Self {
    BlockStorage::U16(values)
  }
}

impl From<Vec<u32>> for BlockStorage {
  fn from(values: Vec<u32>) -> Self {
    BlockStorage::U32(values)
  }
}

impl From<Vec<u64>> for BlockStorage {
  fn from(values: Vec<u64>) -> Self {
    BlockStorage::U64(values)
  }
}

/// A value that remembers whether it was modified since it was last
/// persisted.
pub trait Dirty {
  fn is_dirty(&self) -> bool;
  fn set_dirty(&self, dirty: bool);
}

struct BlockInner {
  storage: RwLock<BlockStorage>,
  dirty: AtomicBool,
  valid: AtomicBool,
}

/// A shared handle to one block of elements.
///
/// Clones share the same storage and flags. This is what lets the write-back
/// path extract a block from an evicted value and hand the very same block
/// back on a read-through.
#[derive(Clone)]
pub struct Block {
  inner: Arc<BlockInner>,
}

impl fmt::Debug for Block {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let storage = self.inner.storage.read();
    f.debug_struct("Block")
      .field("element_type", &storage.element_type())
      .field("len", &storage.len())
      .field("dirty", &self.is_dirty())
      .field("valid", &self.is_valid())
      .finish()
  }
}

impl Block {
  /// A valid, clean block.
  pub fn new(storage: impl Into<BlockStorage>) -> Self {
    Self::with_flags(storage.into(), true)
  }

  /// A zeroed block marked invalid, standing in for data still loading.
  pub fn placeholder(element_type: ElementType, len: usize) -> Self {
    Self::with_flags(BlockStorage::zeroed(element_type, len), false)
  }

  fn with_flags(storage: BlockStorage, valid: bool) -> Self {
    Self {
      inner: Arc::new(BlockInner {
        storage: RwLock::new(storage),
        dirty: AtomicBool::new(false),
        valid: AtomicBool::new(valid),
      }),
    }
  }

  pub fn read(&self) -> RwLockReadGuard<'_, BlockStorage> {
    self.inner.storage.read()
  }

  /// Write access to the elements. Marks the block dirty.
  pub fn write(&self) -> RwLockWriteGuard<'_, BlockStorage> {
    let guard = self.inner.storage.write();
    self.inner.dirty.store(true, Ordering::Release);
    guard
  }

  pub fn element_type(&self) -> ElementType {
    self.read().element_type()
  }

  pub fn len(&self) -> usize {
    self.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether both handles refer to the same storage.
  pub fn same_block(&self, other: &Block) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl Dirty for Block {
  fn is_dirty(&self) -> bool {
    self.inner.dirty.load(Ordering::Acquire)
  }

  fn set_dirty(&self, dirty: bool) {
    self.inner.dirty.store(dirty, Ordering::Release);
  }
}

impl Volatile for Block {
  fn is_valid(&self) -> bool {
    self.inner.valid.load(Ordering::Acquire)
  }
}
