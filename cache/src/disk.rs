//! One file per block on local disk.
//!
//! A [`DiskBlockStore`] names each block file by the decimal form of its key
//! and stores the little-endian elements with no header. Keys that were never
//! written fall through to a backing loader, typically one that computes or
//! zero-fills the block.

use crate::block::{Block, BlockStorage, Dirty, ElementType};
use crate::error::{BuildError, Error, Result};
use crate::loader::{CacheLoader, CacheRemover};
use crate::timing::{IoStatistics, IoTimer};

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use tempfile::TempDir;

#[cfg(feature = "bulk")]
use rayon::prelude::*;

/// The directory a [`DiskBlockStore`] writes to.
///
/// The directory is created when this value is built. Temporary directories
/// are always deleted on drop; other directories only when asked to.
pub struct BlockDirectory {
  path: PathBuf,
  temp: Option<TempDir>,
  remove_on_drop: bool,
}

impl fmt::Debug for BlockDirectory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BlockDirectory")
      .field("path", &self.path)
      .field("temporary", &self.temp.is_some())
      .field("remove_on_drop", &self.remove_on_drop)
      .finish()
  }
}

fn directory_error(path: &Path, error: io::Error) -> BuildError {
  BuildError::Directory {
    path: path.display().to_string(),
    reason: error.to_string(),
  }
}

impl BlockDirectory {
  /// A fresh directory under the system temp dir, deleted on drop.
  pub fn temporary() -> Result<Self, BuildError> {
    let temp = tempfile::Builder::new()
      .prefix("cellcache-")
      .tempdir()
      .map_err(|e| directory_error(&std::env::temp_dir(), e))?;
    Ok(Self {
      path: temp.path().to_path_buf(),
      temp: Some(temp),
      remove_on_drop: true,
    })
  }

  /// Uses `path`, creating it and its parents if needed. The directory is
  /// kept on drop.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self, BuildError> {
    let path = path.into();
    fs::create_dir_all(&path).map_err(|e| directory_error(&path, e))?;
    Ok(Self {
      path,
      temp: None,
      remove_on_drop: false,
    })
  }

  /// Whether to delete the directory and its contents on drop. Has no
  /// effect on temporary directories.
  pub fn remove_on_drop(mut self, remove: bool) -> Self {
    if self.temp.is_none() {
      self.remove_on_drop = remove;
    }
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn is_temporary(&self) -> bool {
    self.temp.is_some()
  }
}

impl Drop for BlockDirectory {
  fn drop(&mut self) {
    // `TempDir` cleans up after itself.
    if self.temp.is_none() && self.remove_on_drop {
      if let Err(e) = fs::remove_dir_all(&self.path) {
        tracing::warn!(path = %self.path.display(), error = %e, "failed to remove block directory");
      }
    }
  }
}

/// Persists [`Block`]s as files and loads them back.
///
/// Implements [`CacheLoader`] and [`CacheRemover`], so it can sit directly
/// behind a cache or behind an [`IoSync`](crate::IoSync).
pub struct DiskBlockStore<K, L> {
  directory: BlockDirectory,
  element_type: ElementType,
  backing: L,
  statistics: Option<Arc<IoStatistics>>,
  _marker: PhantomData<fn(&K)>,
}

impl<K, L> fmt::Debug for DiskBlockStore<K, L> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DiskBlockStore")
      .field("directory", &self.directory)
      .field("element_type", &self.element_type)
      .finish_non_exhaustive()
  }
}

impl<K, L> DiskBlockStore<K, L>
where
  K: fmt::Display + FromStr,
  L: CacheLoader<K, Block>,
{
  pub fn new(directory: BlockDirectory, element_type: ElementType, backing: L) -> Self {
    Self {
      directory,
      element_type,
      backing,
      statistics: None,
      _marker: PhantomData,
    }
  }

  /// A store in a temporary directory that disappears with the store.
  pub fn temporary(element_type: ElementType, backing: L) -> Result<Self> {
    Ok(Self::new(BlockDirectory::temporary()?, element_type, backing))
  }

  /// A store in `path`, which is created if missing and kept on drop.
  pub fn open(path: impl Into<PathBuf>, element_type: ElementType, backing: L) -> Result<Self> {
    Ok(Self::new(BlockDirectory::open(path)?, element_type, backing))
  }

  /// Times reads and writes and counts their bytes in `statistics`.
  pub fn with_statistics(mut self, statistics: Arc<IoStatistics>) -> Self {
    self.statistics = Some(statistics);
    self
  }

  pub fn directory(&self) -> &BlockDirectory {
    &self.directory
  }

  pub fn element_type(&self) -> ElementType {
    self.element_type
  }

  pub fn backing(&self) -> &L {
    &self.backing
  }

  /// The file that holds `key`.
  pub fn path_for(&self, key: &K) -> PathBuf {
    self.directory.path.join(key.to_string())
  }

  pub fn contains(&self, key: &K) -> bool {
    self.path_for(key).is_file()
  }

  fn timer(&self) -> Option<IoTimer<'_>> {
    self.statistics.as_deref().map(IoStatistics::timer)
  }

  fn count_bytes(&self, bytes: usize) {
    if let Some(statistics) = &self.statistics {
      statistics.add_io_bytes(bytes as u64);
    }
  }

  /// Reads `key` from disk, or `None` if it was never written.
  pub fn read(&self, key: &K) -> Result<Option<Block>> {
    let path = self.path_for(key);
    let _timer = self.timer();
    let file = match File::open(&path) {
      Ok(file) => file,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len();
    if len == 0 {
      return Ok(Some(Block::new(BlockStorage::zeroed(self.element_type, 0))));
    }
    // SAFETY: block files are only written by `write`, and the cache never
    // loads and persists the same key at the same time.
    let map = unsafe { Mmap::map(&file)? };
    let storage = BlockStorage::from_le_bytes(self.element_type, &map).ok_or_else(|| {
      Error::corrupt(
        key,
        format!(
          "{} bytes is not a whole number of {}-byte elements",
          map.len(),
          self.element_type.bytes_per_element()
        ),
      )
    })?;
    self.count_bytes(map.len());
    tracing::trace!(path = %path.display(), bytes = map.len(), "read block");
    Ok(Some(Block::new(storage)))
  }

  /// Writes `block` as the durable state of `key`. The file is sized to
  /// exactly the encoded block.
  pub fn write(&self, key: &K, block: &Block) -> Result<()> {
    let storage = block.read();
    if storage.element_type() != self.element_type {
      return Err(Error::corrupt(
        key,
        format!(
          "block holds {:?} elements, store expects {:?}",
          storage.element_type(),
          self.element_type
        ),
      ));
    }

    let path = self.path_for(key);
    let bytes = storage.byte_len();
    let _timer = self.timer();
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(true)
      .open(&path)?;
    file.set_len(bytes as u64)?;
    if bytes > 0 {
      // SAFETY: the file was just truncated and resized by us; nothing else
      // maps it while the cache persists this key.
      let mut map = unsafe { MmapMut::map_mut(&file)? };
      storage.write_le_bytes(&mut map[..])?;
      map.flush()?;
    }
    self.count_bytes(bytes);
    tracing::trace!(path = %path.display(), bytes, "wrote block");
    Ok(())
  }

  /// Deletes the file of `key`. Missing files are fine.
  pub fn delete(&self, key: &K) -> Result<()> {
    remove_block_file(&self.path_for(key))
  }

  /// Keys of every block file in the directory. Files whose names do not
  /// parse as a key are ignored.
  pub fn stored_keys(&self) -> Result<Vec<K>> {
    Ok(
      self
        .block_files()?
        .into_iter()
        .filter_map(|(key, _)| key)
        .collect(),
    )
  }

  fn block_files(&self) -> Result<Vec<(Option<K>, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(&self.directory.path)? {
      let entry = entry?;
      if !entry.file_type()?.is_file() {
        continue;
      }
      let key = entry.file_name().to_str().and_then(|name| name.parse().ok());
      files.push((key, entry.path()));
    }
    Ok(files)
  }
}

fn remove_block_file(path: &Path) -> Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e.into()),
  }
}

#[cfg(feature = "bulk")]
fn remove_block_files(paths: Vec<PathBuf>, parallelism_threshold: usize) -> Result<()> {
  if paths.len() > parallelism_threshold {
    paths.par_iter().try_for_each(|path| remove_block_file(path))
  } else {
    paths.iter().try_for_each(|path| remove_block_file(path))
  }
}

#[cfg(not(feature = "bulk"))]
fn remove_block_files(paths: Vec<PathBuf>, _parallelism_threshold: usize) -> Result<()> {
  paths.iter().try_for_each(|path| remove_block_file(path))
}

impl<K, L> CacheLoader<K, Block> for DiskBlockStore<K, L>
where
  K: fmt::Display + FromStr,
  L: CacheLoader<K, Block>,
{
  fn load(&self, key: &K) -> Result<Block> {
    match self.read(key)? {
      Some(block) => Ok(block),
      None => self.backing.load(key),
    }
  }
}

impl<K, L> CacheRemover<K, Block> for DiskBlockStore<K, L>
where
  K: fmt::Display + FromStr,
  L: CacheLoader<K, Block>,
{
  type Data = Block;

  fn extract(&self, value: &Block) -> Block {
    value.clone()
  }

  fn reconstruct(&self, _key: &K, data: Block) -> Block {
    data
  }

  /// Clears the dirty flag before writing so that a modification made during
  /// the write marks the block dirty again. A failed write restores the flag.
  fn on_removal(&self, key: K, data: Block) -> Result<()> {
    data.set_dirty(false);
    self.write(&key, &data).inspect_err(|_| data.set_dirty(true))
  }

  fn needs_persist(&self, data: &Block) -> bool {
    data.is_dirty()
  }

  fn invalidate(&self, key: &K) -> Result<()> {
    self.delete(key)
  }

  fn invalidate_if(
    &self,
    parallelism_threshold: usize,
    condition: &(dyn Fn(&K) -> bool + Sync),
  ) -> Result<()> {
    let doomed = self
      .block_files()?
      .into_iter()
      .filter_map(|(key, path)| match key {
        Some(key) if condition(&key) => Some(path),
        _ => None,
      })
      .collect();
    remove_block_files(doomed, parallelism_threshold)
  }

  fn invalidate_all(&self, parallelism_threshold: usize) -> Result<()> {
    let everything = self.block_files()?.into_iter().map(|(_, path)| path).collect();
    remove_block_files(everything, parallelism_threshold)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn no_backing(key: &u64) -> Result<Block> {
    Err(Error::load_msg(format!("block {key} was never written")))
  }

  #[test]
  fn file_is_named_by_decimal_key_and_sized_exactly() {
    let store: DiskBlockStore<u64, _> = DiskBlockStore::temporary(ElementType::U32, no_backing).unwrap();
    store.write(&42u64, &Block::new(vec![1u32, 2, 3])).unwrap();
    let path = store.directory().path().join("42");
    assert_eq!(store.path_for(&42), path);
    assert_eq!(fs::metadata(&path).unwrap().len(), 12);
  }

  #[test]
  fn unwritten_keys_fall_through_to_backing() {
    let store: DiskBlockStore<u64, _> = DiskBlockStore::temporary(ElementType::U8, no_backing).unwrap();
    assert!(store.read(&7).unwrap().is_none());
    assert!(matches!(store.load(&7), Err(Error::Load(_))));
  }

  #[test]
  fn truncated_files_are_corrupt() {
    let store: DiskBlockStore<u64, _> = DiskBlockStore::temporary(ElementType::U64, no_backing).unwrap();
    fs::write(store.path_for(&3), [0u8; 5]).unwrap();
    assert!(matches!(store.load(&3), Err(Error::Corrupt { .. })));
  }

  #[test]
  fn temporary_directory_is_removed_on_drop() {
    let store: DiskBlockStore<u64, _> = DiskBlockStore::temporary(ElementType::U8, no_backing).unwrap();
    let path = store.directory().path().to_path_buf();
    assert!(path.is_dir());
    drop(store);
    assert!(!path.exists());
  }

  #[test]
  fn opened_directory_is_kept_unless_asked() {
    let parent = tempfile::tempdir().unwrap();
    let kept = parent.path().join("kept");
    let removed = parent.path().join("removed");
    drop(BlockDirectory::open(&kept).unwrap());
    drop(BlockDirectory::open(&removed).unwrap().remove_on_drop(true));
    assert!(kept.is_dir());
    assert!(!removed.exists());
  }
}
