//! Durable at-rest storage for raw blocks, one file per height.
//!
//! Layout is `{data_dir}/blocks/{height/1000}/{height:09}.blk`, which caps
//! subdirectories at about a thousand entries. Files hold the serialized
//! block and nothing else: no magic, no length prefix, no checksum. The
//! block's own hash is the integrity check, applied at validation time.
//!
//! Writes land under a temporary name and are renamed into place, so a torn
//! write can never be confused with a complete block file.

use std::fs;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::warn;

use crate::error::BlockchainError;

/// Reads refuse anything above four times the maximum block weight. A longer
/// file cannot be a block.
const MAX_BLOCK_FILE_SIZE: u64 = 4 * 4_000_000;

/// How many block files share one subdirectory.
const FILES_PER_DIR: u32 = 1000;

pub struct BlockStore {
    blocks_dir: PathBuf,
    /// Running sum of all `.blk` file sizes, maintained on write and prune so
    /// storage-pressure checks don't re-stat the whole tree.
    total_size: AtomicU64,
}

impl BlockStore {
    /// Opens (and creates, if needed) the store under `{data_dir}/blocks`.
    /// Walks the existing files once to seed the size counter and to sweep
    /// temporaries left behind by a crash.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, BlockchainError> {
        let blocks_dir = data_dir.as_ref().join("blocks");
        fs::create_dir_all(&blocks_dir)?;

        let store = BlockStore {
            blocks_dir,
            total_size: AtomicU64::new(0),
        };

        let mut total = 0;
        store.walk_files(|path, len| {
            if path.extension().is_some_and(|ext| ext == "tmp") {
                warn!("removing stale temporary {}", path.display());
                let _ = fs::remove_file(path);
            } else {
                total += len;
            }
        })?;
        store.total_size.store(total, Ordering::Relaxed);

        Ok(store)
    }

    fn subdir_for(&self, height: u32) -> PathBuf {
        self.blocks_dir.join((height / FILES_PER_DIR).to_string())
    }

    fn path_for(&self, height: u32) -> PathBuf {
        self.subdir_for(height).join(format!("{height:09}.blk"))
    }

    /// Writes the raw block at `height`. Overwriting is allowed; re-receiving
    /// the same block is safe.
    pub fn write_height(&self, height: u32, bytes: &[u8]) -> Result<(), BlockchainError> {
        let subdir = self.subdir_for(height);
        fs::create_dir_all(&subdir)?;

        let final_path = self.path_for(height);
        let tmp_path = subdir.join(format!("{height:09}.blk.tmp"));

        let mut file = File::create(&tmp_path)?;
        if let Err(e) = file.write_all(bytes).and_then(|()| file.flush()) {
            drop(file);
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        drop(file);

        // Size of the file being replaced, if any
        let replaced = fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);

        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        self.total_size
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.total_size.fetch_sub(replaced, Ordering::Relaxed);
        Ok(())
    }

    pub fn read_height(&self, height: u32) -> Result<Vec<u8>, BlockchainError> {
        let path = self.path_for(height);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlockchainError::BlockNotFound(height));
            }
            Err(e) => return Err(e.into()),
        };

        let length = file.metadata()?.len();
        if length == 0 || length > MAX_BLOCK_FILE_SIZE {
            return Err(BlockchainError::CorruptBlockFile { height, length });
        }

        let mut bytes = Vec::with_capacity(length as usize);
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    pub fn exists_height(&self, height: u32) -> bool {
        self.path_for(height).is_file()
    }

    /// Removes the block file at `height`. Absence is success, so pruning the
    /// same range twice is fine. Empty subdirectories are left behind.
    pub fn prune_height(&self, height: u32) -> Result<bool, BlockchainError> {
        let path = self.path_for(height);
        let removed = fs::metadata(&path).map(|m| m.len());
        match fs::remove_file(&path) {
            Ok(()) => {
                self.total_size
                    .fetch_sub(removed.unwrap_or(0), Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every height with a block file, ascending.
    pub fn scan_heights(&self) -> Result<Vec<u32>, BlockchainError> {
        let mut heights = Vec::new();
        self.walk_files(|path, _| {
            if let Some(height) = parse_height(path) {
                heights.push(height);
            }
        })?;
        heights.sort_unstable();
        Ok(heights)
    }

    /// Total bytes of block files currently on disk.
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Visits every regular file in the two-level tree. The depth is fixed,
    /// so a worklist of subdirectories is all the recursion needed.
    fn walk_files(&self, mut visit: impl FnMut(&Path, u64)) -> Result<(), BlockchainError> {
        let mut subdirs = Vec::new();
        for entry in fs::read_dir(&self.blocks_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                subdirs.push(entry.path());
            }
        }

        for subdir in subdirs {
            for entry in fs::read_dir(&subdir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    visit(&entry.path(), entry.metadata()?.len());
                }
            }
        }
        Ok(())
    }
}

/// Parses `{height:09}.blk` back into a height. Anything else returns `None`.
fn parse_height(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_suffix(".blk")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
