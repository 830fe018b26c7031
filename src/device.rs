//! Block device abstraction
//!
//! The filesystem core drives a single backing device through the
//! [`BlockDevice`] trait: aligned reads and writes of fixed-size blocks plus
//! a clustered write used by the page cache to emit large sequential runs.
//! Two implementations are provided, a file-backed device for real storage
//! and a memory-backed device used by tests and as a ramdisk.

use crate::{BlockNumber, FsError, FsResult, BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Aligned block I/O on a backing device.
///
/// Buffers handed to the device must be exactly [`BLOCK_SIZE`] bytes. The
/// device performs no caching of its own; short reads or writes surface as
/// [`FsError::IoError`].
pub trait BlockDevice: Send + Sync {
    /// Total number of addressable blocks
    fn block_count(&self) -> u64;

    /// Read one block into `buf`
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> FsResult<()>;

    /// Write one block from `buf`
    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> FsResult<()>;

    /// Write consecutive blocks starting at `first` in a single operation.
    ///
    /// The default implementation degrades to per-block writes; devices that
    /// can issue one large write should override it.
    fn write_cluster(&self, first: BlockNumber, bufs: &[Vec<u8>]) -> FsResult<()> {
        for (i, buf) in bufs.iter().enumerate() {
            self.write_block(first + i as u64, buf)?;
        }
        Ok(())
    }

    /// Flush device-level write caches
    fn sync(&self) -> FsResult<()> {
        Ok(())
    }
}

fn check_range(dev: &dyn BlockDevice, block: BlockNumber, count: u64) -> FsResult<()> {
    if count == 0 || block.checked_add(count).map_or(true, |end| end > dev.block_count()) {
        return Err(FsError::Invalid);
    }
    Ok(())
}

// ============================================================================
// File-backed device
// ============================================================================

/// Block device backed by a regular file or a raw device node
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    blocks: u64,
}

impl FileDevice {
    /// Open an existing file as a device.
    ///
    /// The file length is truncated down to a whole number of blocks.
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let blocks = len / BLOCK_SIZE as u64;
        if blocks == 0 {
            return Err(FsError::Invalid);
        }
        Ok(Self { file, blocks })
    }

    /// Create a sparse backing file of `blocks` blocks
    pub fn create<P: AsRef<Path>>(path: P, blocks: u64) -> FsResult<Self> {
        if blocks == 0 {
            return Err(FsError::Invalid);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(blocks * BLOCK_SIZE as u64)?;
        Ok(Self { file, blocks })
    }
}

impl BlockDevice for FileDevice {
    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> FsResult<()> {
        check_range(self, block, 1)?;
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::Invalid);
        }
        self.file
            .read_exact_at(buf, block * BLOCK_SIZE as u64)
            .map_err(|_| FsError::IoError)
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> FsResult<()> {
        check_range(self, block, 1)?;
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::Invalid);
        }
        self.file
            .write_all_at(buf, block * BLOCK_SIZE as u64)
            .map_err(|_| FsError::IoError)
    }

    fn write_cluster(&self, first: BlockNumber, bufs: &[Vec<u8>]) -> FsResult<()> {
        check_range(self, first, bufs.len() as u64)?;
        let mut joined = Vec::with_capacity(bufs.len() * BLOCK_SIZE);
        for buf in bufs {
            if buf.len() != BLOCK_SIZE {
                return Err(FsError::Invalid);
            }
            joined.extend_from_slice(buf);
        }
        self.file
            .write_all_at(&joined, first * BLOCK_SIZE as u64)
            .map_err(|_| FsError::IoError)
    }

    fn sync(&self) -> FsResult<()> {
        self.file.sync_data().map_err(|_| FsError::IoError)
    }
}

// ============================================================================
// Memory-backed device
// ============================================================================

/// Block device held entirely in memory.
///
/// Doubles as the test device and as a ramdisk backend.
#[derive(Debug)]
pub struct MemDevice {
    data: spin::Mutex<Vec<u8>>,
    blocks: u64,
}

impl MemDevice {
    /// Create a zero-filled device of `blocks` blocks
    pub fn new(blocks: u64) -> Self {
        Self {
            data: spin::Mutex::new(vec![0u8; blocks as usize * BLOCK_SIZE]),
            blocks,
        }
    }
}

impl BlockDevice for MemDevice {
    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> FsResult<()> {
        check_range(self, block, 1)?;
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::Invalid);
        }
        let data = self.data.lock();
        let off = block as usize * BLOCK_SIZE;
        buf.copy_from_slice(&data[off..off + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> FsResult<()> {
        check_range(self, block, 1)?;
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::Invalid);
        }
        let mut data = self.data.lock();
        let off = block as usize * BLOCK_SIZE;
        data[off..off + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn write_cluster(&self, first: BlockNumber, bufs: &[Vec<u8>]) -> FsResult<()> {
        check_range(self, first, bufs.len() as u64)?;
        let mut data = self.data.lock();
        let mut off = first as usize * BLOCK_SIZE;
        for buf in bufs {
            if buf.len() != BLOCK_SIZE {
                return Err(FsError::Invalid);
            }
            data[off..off + BLOCK_SIZE].copy_from_slice(buf);
            off += BLOCK_SIZE;
        }
        Ok(())
    }
}
