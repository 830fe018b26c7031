//! LCFS - Layered Copy-on-Write Filesystem
//!
//! This crate implements a user-space, block-addressed filesystem whose
//! layers stack the way container images do:
//! - Immutable parent layers share all unchanged inodes and data blocks
//! - A writable top layer clones inodes on first modification (copy-up)
//! - Branching a new layer is O(1) in metadata
//! - Writes are coalesced into large sequential clusters and flushed lazily
//!
//! The kernel transport (the userspace-filesystem protocol) and the
//! container runtime's storage driver are external collaborators. They drive
//! the request surface on [`fs::Lcfs`] from worker threads and hand the
//! crate a block device implementing [`device::BlockDevice`].

pub mod balloc;
pub mod bmap;
pub mod buffer;
pub mod device;
pub mod dir;
pub mod disk;
pub mod extent;
pub mod fs;
pub mod inode;
pub mod layer;
pub mod xattr;

use core::fmt;

/// Inode number type
pub type InodeNumber = u64;

/// Block number type
pub type BlockNumber = u64;

/// Layer identifier type
pub type LayerId = u32;

/// Size of a device block in bytes
pub const BLOCK_SIZE: usize = 4096;

/// Maximum number of blocks staged in one write cluster
pub const CLUSTER_MAX_BLOCKS: usize = 256;

/// Number of buckets in each layer's inode hash
pub const ICACHE_BUCKETS: usize = 512;

/// Blocks pulled from the global free pool into a layer pool at a time
pub const SLAB_BLOCKS: u64 = 256;

/// Directory entry count at which a directory switches to hashed buckets
pub const DIR_HASH_MIN_ENTRIES: usize = 32;

/// Number of name-hash buckets in a wide directory
pub const DIR_HASH_BUCKETS: usize = 512;

/// Inode number of a layer's root directory
pub const ROOT_INO: InodeNumber = 2;

/// First inode number handed out for regular allocation
pub const FIRST_INO: InodeNumber = 3;

/// File type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    SymbolicLink,
    /// Character device
    CharacterDevice,
    /// Block device
    BlockDevice,
    /// Named pipe (FIFO)
    NamedPipe,
    /// Unix domain socket
    Socket,
}

/// File system error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// File already exists
    Exists,
    /// Directory not empty
    NotEmpty,
    /// Not a directory
    NotADirectory,
    /// Is a directory
    IsADirectory,
    /// Allocator exhausted
    NoSpace,
    /// Modification attempted on a frozen or snapshot layer
    ReadOnly,
    /// Malformed request (bad offset, bad handle, bad name)
    Invalid,
    /// Block device failure
    IoError,
    /// Filesystem is unmounting
    ShuttingDown,
    /// On-disk state failed validation at mount
    Corrupt,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "No such file or directory"),
            FsError::Exists => write!(f, "File exists"),
            FsError::NotEmpty => write!(f, "Directory not empty"),
            FsError::NotADirectory => write!(f, "Not a directory"),
            FsError::IsADirectory => write!(f, "Is a directory"),
            FsError::NoSpace => write!(f, "No space left on device"),
            FsError::ReadOnly => write!(f, "Read-only file system"),
            FsError::Invalid => write!(f, "Invalid argument"),
            FsError::IoError => write!(f, "Input/output error"),
            FsError::ShuttingDown => write!(f, "Filesystem is shutting down"),
            FsError::Corrupt => write!(f, "Filesystem is corrupted"),
        }
    }
}

impl FsError {
    /// OS error number for the transport boundary
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => 2,      // ENOENT
            FsError::Exists => 17,       // EEXIST
            FsError::NotEmpty => 39,     // ENOTEMPTY
            FsError::NotADirectory => 20, // ENOTDIR
            FsError::IsADirectory => 21, // EISDIR
            FsError::NoSpace => 28,      // ENOSPC
            FsError::ReadOnly => 30,     // EROFS
            FsError::Invalid => 22,      // EINVAL
            FsError::IoError => 5,       // EIO
            FsError::ShuttingDown => 5,  // EIO
            FsError::Corrupt => 117,     // EUCLEAN
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(_: std::io::Error) -> Self {
        FsError::IoError
    }
}

/// File system result type
pub type FsResult<T> = Result<T, FsError>;

/// File metadata as reported to the request layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Inode number
    pub ino: InodeNumber,
    /// File type
    pub file_type: FileType,
    /// Permission bits (low 12 bits of the mode)
    pub perms: u32,
    /// Number of hard links
    pub nlink: u32,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// Device number for device nodes
    pub rdev: u32,
    /// File size in bytes
    pub size: u64,
    /// Allocated blocks
    pub blocks: u64,
    /// Last access time (Unix seconds)
    pub atime: u64,
    /// Last modification time
    pub mtime: u64,
    /// Last status change time
    pub ctime: u64,
    /// Preferred I/O size
    pub blksize: u32,
}

/// Attribute changes requested by a setattr call.
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    /// New permission bits
    pub perms: Option<u32>,
    /// New owner
    pub uid: Option<u32>,
    /// New group
    pub gid: Option<u32>,
    /// New size (truncate or extend)
    pub size: Option<u64>,
    /// New access time
    pub atime: Option<u64>,
    /// New modification time
    pub mtime: Option<u64>,
}

/// File system statistics
#[derive(Debug, Clone)]
pub struct StatFs {
    /// Total blocks in filesystem
    pub total_blocks: u64,
    /// Free blocks available
    pub free_blocks: u64,
    /// Total inodes created
    pub total_inodes: u64,
    /// Block size in bytes
    pub block_size: u32,
    /// Maximum filename length
    pub max_filename_length: u32,
    /// Number of mounted layers
    pub layers: u32,
}

/// Open file flags
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    /// Read access
    pub read: bool,
    /// Write access
    pub write: bool,
    /// Truncate file to zero length
    pub truncate: bool,
    /// Append to end of file
    pub append: bool,
}

impl OpenFlags {
    /// Read-only flags
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            truncate: false,
            append: false,
        }
    }

    /// Read-write flags
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            truncate: false,
            append: false,
        }
    }
}

/// Mount-time configuration
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Reject all modifications
    pub read_only: bool,
    /// Background flusher wakeup interval in milliseconds
    pub flush_interval_ms: u64,
    /// Format the device if its superblock is blank
    pub format_if_blank: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            flush_interval_ms: 5000,
            format_if_blank: true,
        }
    }
}

/// Filesystem operation counters snapshot
#[derive(Debug, Default, Clone)]
pub struct FsStats {
    /// Inodes currently cached in memory across all layers
    pub inodes_cached: u64,
    /// Inodes cloned into child layers (copy-up operations)
    pub clones: u64,
    /// Completed read calls
    pub reads: u64,
    /// Completed write calls
    pub writes: u64,
    /// Layer commits
    pub commits: u64,
    /// Background flusher passes
    pub flusher_passes: u64,
}

/// Current time in Unix seconds
pub(crate) fn now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
