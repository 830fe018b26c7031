//! Filesystem context and request dispatch
//!
//! [`Lcfs`] is the explicit context every entry point receives; there is no
//! process-global state. The transport resolves its protocol requests into
//! `(layer, inode)` pairs and calls the operations here; open files carry a
//! handle with a direct inode reference so the hash is not consulted again.
//! A background flusher thread commits dirty layers on an interval and is
//! joined at unmount.

use crate::balloc::BlockAllocator;
use crate::buffer::{CacheStats, PageCache};
use crate::device::BlockDevice;
use crate::disk::{
    self, read_struct, write_struct, ChainHeader, DiskExtent, DiskInode, DiskLayerRecord,
    DiskSuper, CHAIN_HEADER_SIZE, LAYER_NAME_MAX, NAME_MAX, SUPERBLOCK_BLOCK,
};
use crate::inode::{Body, Inode, InodeFlags};
use crate::layer::{Layer, LayerSet, LayerStat};
use crate::{
    now, FileType, FsError, FsResult, FsStats, InodeNumber, LayerId, MountOptions, OpenFlags,
    SetAttr, Stat, StatFs, BLOCK_SIZE, FIRST_INO, ROOT_INO,
};
use log::{error, info, warn};
use spin::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration;

/// Smallest device the filesystem can live on
const MIN_DEVICE_BLOCKS: u64 = 8;

/// On-disk blocks the global tail occupied at the last write
#[derive(Debug, Default)]
pub(crate) struct SbChains {
    /// Free-extent chain blocks
    pub free: Vec<u64>,
    /// Layer-table chain blocks
    pub layers: Vec<u64>,
}

/// Operation counters
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub clones: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub commits: AtomicU64,
    pub flusher_passes: AtomicU64,
}

/// An open file or directory handle
#[derive(Clone)]
struct OpenFile {
    layer: LayerId,
    inode: Arc<Inode>,
    flags: OpenFlags,
}

/// One directory entry returned by readdir
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Entry name
    pub name: String,
    /// Inode number
    pub ino: InodeNumber,
    /// File type
    pub kind: FileType,
    /// Cookie to resume iteration after this entry
    pub cookie: u64,
}

/// Layer-management request dispatched on the snapshot root
#[derive(Debug, Clone)]
pub enum LayerIoctl {
    /// Create a layer over `parent` (empty selects the base layer)
    Create {
        /// New layer name
        name: String,
        /// Parent layer name
        parent: String,
        /// Mark the new layer read-only
        readonly: bool,
    },
    /// Remove a childless layer
    Remove(String),
    /// Commit a layer to disk
    Commit(String),
    /// Per-layer statistics
    Stat(String),
}

/// Reply to a [`LayerIoctl`]
#[derive(Debug, Clone)]
pub enum LayerIoctlReply {
    /// Id of the created layer
    Created(LayerId),
    /// Operation completed
    Done,
    /// Statistics for the named layer
    Stat(LayerStat),
}

/// Block accounting snapshot; at a stable point the categories sum to the
/// device size
#[derive(Debug, Clone, Default)]
pub struct BlockUsage {
    /// Device size in blocks
    pub total: u64,
    /// Reserved superblock blocks
    pub superblock: u64,
    /// Blocks in the global free pool
    pub global_free: u64,
    /// Blocks reserved in layer pools
    pub layer_reserved: u64,
    /// Blocks mapped by file block maps and extents
    pub file_data: u64,
    /// Inode, index, chain and layer-table blocks
    pub metadata: u64,
}

impl BlockUsage {
    /// Sum of every category
    pub fn accounted(&self) -> u64 {
        self.superblock + self.global_free + self.layer_reserved + self.file_data + self.metadata
    }
}

/// The filesystem instance
pub struct Lcfs {
    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) cache: PageCache,
    pub(crate) alloc: BlockAllocator,
    pub(crate) layers: LayerSet,
    pub(crate) sb_chains: Mutex<SbChains>,
    pub(crate) next_inode: AtomicU64,
    pub(crate) inode_count: AtomicU64,
    pub(crate) snapshot_root: InodeNumber,
    pub(crate) counters: Counters,
    unmounting: AtomicBool,
    read_only: bool,
    opts: MountOptions,
    handles: RwLock<BTreeMap<u64, OpenFile>>,
    next_handle: AtomicU64,
    flusher: Mutex<Option<std::thread::JoinHandle<()>>>,
    flush_signal: Arc<(StdMutex<bool>, Condvar)>,
}

// ============================================================================
// Format, mount, unmount
// ============================================================================

impl Lcfs {
    /// Initialize a blank device: superblock, base layer, empty root
    /// directory.
    pub fn format(dev: &dyn BlockDevice) -> FsResult<()> {
        let blocks = dev.block_count();
        if blocks < MIN_DEVICE_BLOCKS {
            return Err(FsError::Invalid);
        }
        let t = now();

        // Block 1: the root directory inode.
        let root = DiskInode {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: t,
            mtime: t,
            ctime: t,
            parent: ROOT_INO,
            extent_start: 0,
            extent_len: 0,
            bmap_head: 0,
            dir_head: 0,
            xattr_head: 0,
            mode: disk::mode_from(FileType::Directory, 0o755),
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            target_len: 0,
        };
        let mut buf = disk::zeroed_block();
        write_struct(&mut buf, 0, &root);
        dev.write_block(1, &buf)?;

        // Block 2: index chain with the single inode block.
        let mut buf = disk::zeroed_block();
        write_struct(&mut buf, 0, &ChainHeader { next: 0, count: 1, pad: 0 });
        buf[CHAIN_HEADER_SIZE..CHAIN_HEADER_SIZE + 8].copy_from_slice(&1u64.to_ne_bytes());
        dev.write_block(2, &buf)?;

        // Block 3: layer table with the base layer.
        let mut buf = disk::zeroed_block();
        write_struct(&mut buf, 0, &ChainHeader { next: 0, count: 1, pad: 0 });
        let record = DiskLayerRecord {
            id: 0,
            parent: -1,
            flags: 0,
            pad: 0,
            root_ino: ROOT_INO,
            index_head: 2,
            name: [0u8; LAYER_NAME_MAX],
        };
        write_struct(&mut buf, CHAIN_HEADER_SIZE, &record);
        dev.write_block(3, &buf)?;

        // Block 4: free-extent chain covering the rest of the device.
        let mut buf = disk::zeroed_block();
        write_struct(&mut buf, 0, &ChainHeader { next: 0, count: 1, pad: 0 });
        let free = DiskExtent {
            start: 5,
            len: blocks - 5,
        };
        write_struct(&mut buf, CHAIN_HEADER_SIZE, &free);
        dev.write_block(4, &buf)?;

        // Block 0: the superblock, written last.
        let mut sb = DiskSuper {
            magic: disk::SUPER_MAGIC,
            version: disk::LAYOUT_VERSION,
            checksum: 0,
            flags: 0,
            block_count: blocks,
            next_inode: FIRST_INO,
            inode_count: 1,
            snapshot_root: ROOT_INO,
            free_head: 4,
            layer_head: 3,
            layer_count: 1,
            pad: 0,
        };
        sb.checksum = disk::super_checksum(&sb);
        let mut buf = disk::zeroed_block();
        write_struct(&mut buf, 0, &sb);
        dev.write_block(SUPERBLOCK_BLOCK, &buf)?;
        dev.sync()?;
        info!("formatted device with {blocks} blocks");
        Ok(())
    }

    /// Mount a device and return the filesystem context.
    ///
    /// A blank device is formatted first when the options allow it; any
    /// other validation failure is fatal.
    pub fn mount(dev: Arc<dyn BlockDevice>, opts: MountOptions) -> FsResult<Arc<Self>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        dev.read_block(SUPERBLOCK_BLOCK, &mut buf)?;
        let mut sb: DiskSuper = read_struct(&buf)?;
        if sb.magic == 0 && opts.format_if_blank && !opts.read_only {
            Self::format(dev.as_ref())?;
            dev.read_block(SUPERBLOCK_BLOCK, &mut buf)?;
            sb = read_struct(&buf)?;
        }
        disk::validate_super(&sb, dev.block_count())?;

        let fs = Arc::new(Self {
            dev: dev.clone(),
            cache: PageCache::new(dev),
            alloc: BlockAllocator::new(),
            layers: LayerSet::new(),
            sb_chains: Mutex::new(SbChains::default()),
            next_inode: AtomicU64::new(sb.next_inode),
            inode_count: AtomicU64::new(0),
            snapshot_root: sb.snapshot_root,
            counters: Counters::default(),
            unmounting: AtomicBool::new(false),
            read_only: opts.read_only,
            opts,
            handles: RwLock::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
            flusher: Mutex::new(None),
            flush_signal: Arc::new((StdMutex::new(false), Condvar::new())),
        });
        fs.load_from_disk(&sb)?;
        fs.layers.get(0).map_err(|_| {
            error!("mounted device has no base layer");
            FsError::Corrupt
        })?;
        fs.start_flusher()?;
        info!(
            "mounted {} layers, {} inodes, {} free blocks",
            fs.layers.count(),
            fs.inode_count.load(Ordering::Relaxed),
            fs.alloc.free_blocks()
        );
        Ok(fs)
    }

    /// Stop the flusher, commit everything and quiesce the device. Entry
    /// points fail with `ShuttingDown` from this point on.
    pub fn unmount(&self) -> FsResult<()> {
        if self.unmounting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.flusher.lock().take() {
            if let Ok(mut stop) = self.flush_signal.0.lock() {
                *stop = true;
            }
            self.flush_signal.1.notify_all();
            let _ = handle.join();
        }
        self.handles.write().clear();
        if !self.read_only {
            self.sync_all()?;
        }
        self.dev.sync()?;
        info!("unmounted");
        Ok(())
    }

    fn start_flusher(self: &Arc<Self>) -> FsResult<()> {
        let weak = Arc::downgrade(self);
        let signal = self.flush_signal.clone();
        let interval = Duration::from_millis(self.opts.flush_interval_ms.max(100));
        let handle = std::thread::Builder::new()
            .name("lcfs-flusher".into())
            .spawn(move || {
                let (lock, cvar) = &*signal;
                let mut stop = match lock.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                loop {
                    let Ok((guard, _)) = cvar.wait_timeout(stop, interval) else {
                        return;
                    };
                    stop = guard;
                    if *stop {
                        return;
                    }
                    let Some(fs) = weak.upgrade() else { return };
                    fs.flusher_pass();
                }
            })?;
        *self.flusher.lock() = Some(handle);
        Ok(())
    }

    fn flusher_pass(&self) {
        self.counters.flusher_passes.fetch_add(1, Ordering::Relaxed);
        if self.read_only || self.unmounting.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.layers.lock.lock();
        let mut flushed = false;
        for layer in self.layers.all() {
            if layer.is_dirty() {
                match self.commit_internal(&layer) {
                    Ok(()) => flushed = true,
                    Err(e) => warn!("background commit of layer {} failed: {e}", layer.id),
                }
            }
        }
        if flushed {
            if let Err(e) = self.write_global_tail() {
                warn!("superblock update failed: {e}");
            }
        }
    }

    /// Every entry point bails out while unmounting
    pub(crate) fn check_entry(&self) -> FsResult<()> {
        if self.unmounting.load(Ordering::SeqCst) {
            return Err(FsError::ShuttingDown);
        }
        Ok(())
    }

    /// Admission check for a mutating operation. The returned barrier
    /// guard must live until the operation's inode locks are released;
    /// [`Layer::freeze`] waits on it, which is what makes the
    /// mutable-to-frozen transition safe against in-flight writers.
    fn check_mutable<'a>(&self, layer: &'a Layer) -> FsResult<spin::RwLockReadGuard<'a, ()>> {
        self.check_entry()?;
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        layer.begin_write()
    }

    /// The snapshot root must not change while layers hang off it; the
    /// storage driver owns that directory.
    fn snapshot_root_guard(&self, layer: &Arc<Layer>, dir_ino: InodeNumber) -> FsResult<()> {
        if layer.id == 0 && dir_ino == self.snapshot_root && self.layers.count() > 1 {
            warn!("modification of the snapshot root refused while layers exist");
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }
}

// ============================================================================
// Request surface
// ============================================================================

impl Lcfs {
    /// Resolve `name` in a directory
    pub fn lookup(&self, layer: LayerId, parent: InodeNumber, name: &str) -> FsResult<Stat> {
        self.check_entry()?;
        let layer = self.layers.get(layer)?;
        let dir_inode = self.resolve_inode(&layer, parent)?;
        let child_ino = {
            let inner = dir_inode.read();
            match name {
                "." => return Ok(dir_inode.stat_locked(&inner)),
                ".." => inner.parent,
                _ => inner.dir()?.lookup(name).ok_or(FsError::NotFound)?.ino,
            }
        };
        let child = self.resolve_inode(&layer, child_ino)?;
        let inner = child.read();
        Ok(child.stat_locked(&inner))
    }

    /// Attributes of an inode
    pub fn getattr(&self, layer: LayerId, ino: InodeNumber) -> FsResult<Stat> {
        self.check_entry()?;
        let layer = self.layers.get(layer)?;
        let inode = self.resolve_inode(&layer, ino)?;
        let inner = inode.read();
        Ok(inode.stat_locked(&inner))
    }

    /// Change attributes; `None` fields keep their value
    pub fn setattr(&self, layer: LayerId, ino: InodeNumber, attr: &SetAttr) -> FsResult<Stat> {
        let layer = self.layers.get(layer)?;
        let _barrier = self.check_mutable(&layer)?;
        self.snapshot_root_guard(&layer, ino)?;
        let inode = self.resolve_for_write(&layer, ino)?;
        let mut inner = inode.write();
        if let Some(perms) = attr.perms {
            inner.perms = perms & 0o7777;
        }
        if let Some(uid) = attr.uid {
            inner.uid = uid;
        }
        if let Some(gid) = attr.gid {
            inner.gid = gid;
        }
        if let Some(atime) = attr.atime {
            inner.atime = atime;
        }
        if let Some(mtime) = attr.mtime {
            inner.mtime = mtime;
        }
        if let Some(size) = attr.size {
            if inner.kind != FileType::Regular {
                return Err(FsError::Invalid);
            }
            self.truncate_locked(&layer, &mut inner, size)?;
        }
        inner.ctime = now();
        inner.flags.insert(InodeFlags::DIRTY);
        layer.mark_dirty();
        Ok(inode.stat_locked(&inner))
    }

    /// Target of a symlink
    pub fn readlink(&self, layer: LayerId, ino: InodeNumber) -> FsResult<String> {
        self.check_entry()?;
        let layer = self.layers.get(layer)?;
        let inode = self.resolve_inode(&layer, ino)?;
        let inner = inode.read();
        match &inner.body {
            Body::Symlink(target) => Ok((**target).clone()),
            _ => Err(FsError::Invalid),
        }
    }

    /// Create a device node, FIFO or socket
    #[allow(clippy::too_many_arguments)]
    pub fn mknod(
        &self,
        layer: LayerId,
        parent: InodeNumber,
        name: &str,
        kind: FileType,
        perms: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
    ) -> FsResult<Stat> {
        if matches!(kind, FileType::Directory | FileType::SymbolicLink) {
            return Err(FsError::Invalid);
        }
        let inode = self.create_entry(layer, parent, name, kind, perms, uid, gid, rdev, None)?;
        let inner = inode.read();
        Ok(inode.stat_locked(&inner))
    }

    /// Create a directory
    pub fn mkdir(
        &self,
        layer: LayerId,
        parent: InodeNumber,
        name: &str,
        perms: u32,
        uid: u32,
        gid: u32,
    ) -> FsResult<Stat> {
        let inode = self.create_entry(
            layer,
            parent,
            name,
            FileType::Directory,
            perms,
            uid,
            gid,
            0,
            None,
        )?;
        let inner = inode.read();
        Ok(inode.stat_locked(&inner))
    }

    /// Create a symlink
    #[allow(clippy::too_many_arguments)]
    pub fn symlink(
        &self,
        layer: LayerId,
        parent: InodeNumber,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> FsResult<Stat> {
        let inode = self.create_entry(
            layer,
            parent,
            name,
            FileType::SymbolicLink,
            0o777,
            uid,
            gid,
            0,
            Some(target),
        )?;
        let inner = inode.read();
        Ok(inode.stat_locked(&inner))
    }

    /// Remove a file name; the inode goes away with its last link
    pub fn unlink(&self, layer: LayerId, parent: InodeNumber, name: &str) -> FsResult<()> {
        let layer = self.layers.get(layer)?;
        let _barrier = self.check_mutable(&layer)?;
        self.snapshot_root_guard(&layer, parent)?;

        let dir_inode = self.resolve_for_write(&layer, parent)?;
        let target_ino = {
            let mut inner = dir_inode.write();
            let entry = inner.dir()?.lookup(name).ok_or(FsError::NotFound)?.clone();
            if entry.kind == FileType::Directory {
                return Err(FsError::IsADirectory);
            }
            inner.materialize_body();
            if let Body::Directory(dir) = &mut inner.body {
                Arc::make_mut(dir).remove(name)?;
                inner.size = dir.len() as u64;
            }
            inner.mtime = now();
            inner.ctime = inner.mtime;
            inner.flags.insert(InodeFlags::DIRTY | InodeFlags::DIR_DIRTY);
            entry.ino
        };
        self.drop_link(&layer, target_ino, false)?;
        layer.mark_dirty();
        Ok(())
    }

    /// Remove an empty directory
    pub fn rmdir(&self, layer: LayerId, parent: InodeNumber, name: &str) -> FsResult<()> {
        let layer = self.layers.get(layer)?;
        let _barrier = self.check_mutable(&layer)?;
        self.snapshot_root_guard(&layer, parent)?;

        let dir_inode = self.resolve_for_write(&layer, parent)?;
        let target_ino = {
            let inner = dir_inode.read();
            let entry = inner.dir()?.lookup(name).ok_or(FsError::NotFound)?;
            if entry.kind != FileType::Directory {
                return Err(FsError::NotADirectory);
            }
            entry.ino
        };
        {
            // The directory must be empty in this layer's view.
            let target = self.resolve_inode(&layer, target_ino)?;
            let inner = target.read();
            if !inner.dir()?.is_empty() {
                return Err(FsError::NotEmpty);
            }
        }
        {
            let mut inner = dir_inode.write();
            inner.materialize_body();
            if let Body::Directory(dir) = &mut inner.body {
                Arc::make_mut(dir).remove(name)?;
                inner.size = dir.len() as u64;
            }
            inner.nlink = inner.nlink.saturating_sub(1);
            inner.mtime = now();
            inner.ctime = inner.mtime;
            inner.flags.insert(InodeFlags::DIRTY | InodeFlags::DIR_DIRTY);
        }
        self.drop_link(&layer, target_ino, true)?;
        layer.mark_dirty();
        Ok(())
    }

    /// Rename within or across directories.
    ///
    /// Every inode the swap touches, both directories and whatever the
    /// target name currently displaces, is locked together in ascending
    /// inode order for the whole operation, so concurrent lookups see
    /// either the old or the new binding, never a torn state, and a
    /// displaced directory is proven empty under the same locks that
    /// remove it.
    pub fn rename(
        &self,
        layer: LayerId,
        old_parent: InodeNumber,
        old_name: &str,
        new_parent: InodeNumber,
        new_name: &str,
    ) -> FsResult<()> {
        let layer = self.layers.get(layer)?;
        let _barrier = self.check_mutable(&layer)?;
        self.snapshot_root_guard(&layer, old_parent)?;
        self.snapshot_root_guard(&layer, new_parent)?;
        if old_parent == new_parent && old_name == new_name {
            // Renaming a name onto itself changes nothing.
            return self.lookup(layer.id, old_parent, old_name).map(|_| ());
        }

        let src_dir = self.resolve_for_write(&layer, old_parent)?;
        let dst_dir = self.resolve_for_write(&layer, new_parent)?;

        let (moved, displaced, displaced_is_dir) = loop {
            // Peek at the target binding to learn which inode joins the
            // lock set; the binding is re-read once the locks are held and
            // the attempt repeats if it moved in between.
            let hint_ino = {
                let guard = dst_dir.read();
                guard.dir()?.lookup(new_name).map(|e| e.ino)
            };
            let hint = match hint_ino {
                Some(ino) => match self.resolve_inode(&layer, ino) {
                    Ok(inode) => Some(inode),
                    // Unlinked while unlocked; the binding is gone.
                    Err(FsError::NotFound) => continue,
                    Err(e) => return Err(e),
                },
                None => None,
            };

            let mut order: Vec<&Arc<Inode>> = vec![&src_dir];
            if dst_dir.ino != src_dir.ino {
                order.push(&dst_dir);
            }
            if let Some(h) = &hint {
                if h.ino != src_dir.ino && h.ino != dst_dir.ino {
                    order.push(h);
                }
            }
            order.sort_by_key(|i| i.ino);
            let mut guards: Vec<_> = order.iter().map(|i| i.write()).collect();
            let src_idx = order.iter().position(|i| i.ino == src_dir.ino).unwrap();
            let dst_idx = order.iter().position(|i| i.ino == dst_dir.ino).unwrap();

            let current = guards[dst_idx]
                .dir()?
                .lookup(new_name)
                .map(|e| (e.ino, e.kind));
            if current.map(|(ino, _)| ino) != hint.as_ref().map(|h| h.ino) {
                continue;
            }
            if let Some((ino, FileType::Directory)) = current {
                // A directory can only displace an empty directory.
                let disp_idx = order.iter().position(|i| i.ino == ino).unwrap();
                if !guards[disp_idx].dir()?.is_empty() {
                    return Err(FsError::NotEmpty);
                }
            }
            let displaced_is_dir = matches!(current, Some((_, FileType::Directory)));

            let t = now();
            let swapped = if src_idx == dst_idx {
                guards[src_idx].materialize_body();
                rename_entries(&mut guards[src_idx], old_name, &mut None, new_name)?
            } else {
                let (lo_idx, hi_idx) = if src_idx < dst_idx {
                    (src_idx, dst_idx)
                } else {
                    (dst_idx, src_idx)
                };
                let (lo_half, hi_half) = guards.split_at_mut(hi_idx);
                let lo = &mut lo_half[lo_idx];
                let hi = &mut hi_half[0];
                let (src_guard, dst_guard) = if src_idx < dst_idx {
                    (lo, hi)
                } else {
                    (hi, lo)
                };
                src_guard.materialize_body();
                dst_guard.materialize_body();
                let swapped =
                    rename_entries(src_guard, old_name, &mut Some(&mut **dst_guard), new_name)?;
                if swapped.2 {
                    // A directory changed parents.
                    src_guard.nlink = src_guard.nlink.saturating_sub(1);
                    dst_guard.nlink += 1;
                }
                dst_guard.mtime = t;
                dst_guard.ctime = t;
                dst_guard.flags.insert(InodeFlags::DIRTY | InodeFlags::DIR_DIRTY);
                swapped
            };
            if displaced_is_dir {
                // The displaced subdirectory no longer counts against its
                // parent's link count.
                guards[dst_idx].nlink = guards[dst_idx].nlink.saturating_sub(1);
            }
            let src_guard = &mut guards[src_idx];
            src_guard.mtime = t;
            src_guard.ctime = t;
            src_guard.flags.insert(InodeFlags::DIRTY | InodeFlags::DIR_DIRTY);
            break (swapped.0, swapped.1, displaced_is_dir);
        };

        if let Some(displaced) = displaced {
            self.drop_link(&layer, displaced, displaced_is_dir)?;
        }
        // The moved inode records its new parent directory.
        let inode = self.resolve_for_write(&layer, moved)?;
        {
            let mut inner = inode.write();
            inner.parent = dst_dir.ino;
            inner.ctime = now();
            inner.flags.insert(InodeFlags::DIRTY);
        }
        layer.mark_dirty();
        Ok(())
    }

    /// Add a hard link to a regular file
    pub fn link(
        &self,
        layer: LayerId,
        ino: InodeNumber,
        parent: InodeNumber,
        name: &str,
    ) -> FsResult<Stat> {
        let layer = self.layers.get(layer)?;
        let _barrier = self.check_mutable(&layer)?;
        self.snapshot_root_guard(&layer, parent)?;

        let target = self.resolve_for_write(&layer, ino)?;
        let kind = {
            let inner = target.read();
            if inner.kind == FileType::Directory {
                return Err(FsError::IsADirectory);
            }
            inner.kind
        };

        let dir_inode = self.resolve_for_write(&layer, parent)?;
        {
            let mut inner = dir_inode.write();
            inner.materialize_body();
            if let Body::Directory(dir) = &mut inner.body {
                Arc::make_mut(dir).insert(name, ino, kind)?;
                inner.size = dir.len() as u64;
            }
            inner.mtime = now();
            inner.ctime = inner.mtime;
            inner.flags.insert(InodeFlags::DIRTY | InodeFlags::DIR_DIRTY);
        }
        let mut inner = target.write();
        inner.nlink += 1;
        inner.ctime = now();
        inner.flags.insert(InodeFlags::DIRTY);
        layer.mark_dirty();
        Ok(target.stat_locked(&inner))
    }

    /// Open a regular file and return a handle
    pub fn open(&self, layer: LayerId, ino: InodeNumber, flags: OpenFlags) -> FsResult<u64> {
        self.check_entry()?;
        let layer = self.layers.get(layer)?;
        let wants_write = flags.write || flags.truncate;
        let _barrier = if wants_write {
            Some(self.check_mutable(&layer)?)
        } else {
            None
        };
        let inode = if wants_write {
            self.resolve_for_write(&layer, ino)?
        } else {
            self.resolve_inode(&layer, ino)?
        };
        {
            let inner = inode.read();
            match inner.kind {
                FileType::Regular => {}
                FileType::Directory => return Err(FsError::IsADirectory),
                _ => return Err(FsError::Invalid),
            }
        }
        if flags.truncate {
            let mut inner = inode.write();
            self.truncate_locked(&layer, &mut inner, 0)?;
            inner.flags.insert(InodeFlags::DIRTY);
            layer.mark_dirty();
        }
        Ok(self.install_handle(&layer, inode, flags))
    }

    /// Create a regular file and open it
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        layer: LayerId,
        parent: InodeNumber,
        name: &str,
        perms: u32,
        uid: u32,
        gid: u32,
        flags: OpenFlags,
    ) -> FsResult<(u64, Stat)> {
        let inode = self.create_entry(
            layer,
            parent,
            name,
            FileType::Regular,
            perms,
            uid,
            gid,
            0,
            None,
        )?;
        let stat = {
            let inner = inode.read();
            inode.stat_locked(&inner)
        };
        let layer = self.layers.get(layer)?;
        Ok((self.install_handle(&layer, inode, flags), stat))
    }

    /// Read from an open file
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.check_entry()?;
        let open = self.handle(fh)?;
        if !open.flags.read {
            return Err(FsError::Invalid);
        }
        let inner = open.inode.read();
        let file_size = inner.size;
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let len = (size as u64).min(file_size - offset) as usize;
        let mut out = vec![0u8; len];

        let (map, dirty) = match &inner.body {
            Body::Regular { map, dirty } => (map, dirty),
            _ => return Err(FsError::Invalid),
        };
        let mut filled = 0usize;
        while filled < len {
            let pos = offset + filled as u64;
            let logical = pos / BLOCK_SIZE as u64;
            let block_off = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - block_off).min(len - filled);
            if let Some(page) = dirty.get(&logical) {
                out[filled..filled + chunk].copy_from_slice(&page[block_off..block_off + chunk]);
            } else if let Some(physical) = map.lookup(logical) {
                let data = self.cache.read_data(open.layer, physical)?;
                out[filled..filled + chunk].copy_from_slice(&data[block_off..block_off + chunk]);
            }
            // else: hole, stays zero
            filled += chunk;
        }
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    /// Write to an open file; pages are staged in memory and flushed lazily
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.check_entry()?;
        let open = self.handle(fh)?;
        if !open.flags.write {
            return Err(FsError::Invalid);
        }
        let layer = self.layers.get(open.layer)?;
        let _barrier = self.check_mutable(&layer)?;
        if data.is_empty() {
            return Ok(0);
        }

        let mut inner = open.inode.write();
        let offset = if open.flags.append { inner.size } else { offset };

        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let logical = pos / BLOCK_SIZE as u64;
            let block_off = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - block_off).min(data.len() - written);

            let needs_merge = block_off != 0 || chunk < BLOCK_SIZE;
            let mapped = match &inner.body {
                Body::Regular { map, .. } => map.lookup(logical),
                _ => return Err(FsError::Invalid),
            };
            let base = if needs_merge {
                match mapped {
                    Some(physical) => self.cache.read_data(open.layer, physical)?.as_ref().clone(),
                    None => vec![0u8; BLOCK_SIZE],
                }
            } else {
                vec![0u8; BLOCK_SIZE]
            };
            if let Body::Regular { dirty, .. } = &mut inner.body {
                let page = dirty.entry(logical).or_insert(base);
                page[block_off..block_off + chunk]
                    .copy_from_slice(&data[written..written + chunk]);
            }
            written += chunk;
        }
        inner.size = inner.size.max(offset + data.len() as u64);
        inner.mtime = now();
        inner.ctime = inner.mtime;
        inner.flags.insert(InodeFlags::DIRTY);
        layer.mark_dirty();
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(data.len())
    }

    /// Flush point for an open file. Writes are coalesced and flushed
    /// lazily; this is a no-op by design.
    pub fn flush(&self, fh: u64) -> FsResult<()> {
        self.check_entry()?;
        self.handle(fh).map(|_| ())
    }

    /// Drop an open file handle
    pub fn release(&self, fh: u64) -> FsResult<()> {
        self.handles.write().remove(&fh).map(|_| ()).ok_or(FsError::Invalid)
    }

    /// Persist one file's data and metadata now
    pub fn fsync(&self, fh: u64) -> FsResult<()> {
        self.check_entry()?;
        let open = self.handle(fh)?;
        // A read-only handle may point at an ancestor's inode; dirty state
        // only ever lives in the layer that owns the copy.
        let layer = self.layers.get(open.inode.layer)?;
        if layer.is_frozen() {
            return Ok(());
        }
        self.flush_inode(&layer, &open.inode)?;
        self.cache.drain(layer.id, &layer.cluster)?;
        self.dev.sync()
    }

    /// Open a directory for iteration
    pub fn opendir(&self, layer: LayerId, ino: InodeNumber) -> FsResult<u64> {
        self.check_entry()?;
        let layer = self.layers.get(layer)?;
        let inode = self.resolve_inode(&layer, ino)?;
        {
            let inner = inode.read();
            inner.dir()?;
        }
        Ok(self.install_handle(&layer, inode, OpenFlags::read_only()))
    }

    /// Entries of an open directory starting at `cookie`. The synthetic
    /// `.` and `..` entries occupy cookies 1 and 2.
    pub fn readdir(&self, fh: u64, cookie: u64) -> FsResult<Vec<DirectoryEntry>> {
        self.check_entry()?;
        let open = self.handle(fh)?;
        let inner = open.inode.read();
        let dir = inner.dir()?;
        let mut out = Vec::new();
        if cookie < 1 {
            out.push(DirectoryEntry {
                name: ".".to_string(),
                ino: open.inode.ino,
                kind: FileType::Directory,
                cookie: 1,
            });
        }
        if cookie < 2 {
            out.push(DirectoryEntry {
                name: "..".to_string(),
                ino: inner.parent,
                kind: FileType::Directory,
                cookie: 2,
            });
        }
        let skip = cookie.saturating_sub(2) as usize;
        for (i, entry) in dir.entries_from(skip).into_iter().enumerate() {
            out.push(DirectoryEntry {
                name: entry.name,
                ino: entry.ino,
                kind: entry.kind,
                cookie: 3 + (skip + i) as u64,
            });
        }
        Ok(out)
    }

    /// Drop a directory handle
    pub fn releasedir(&self, fh: u64) -> FsResult<()> {
        self.release(fh)
    }

    /// Persist a directory now
    pub fn fsyncdir(&self, fh: u64) -> FsResult<()> {
        self.fsync(fh)
    }

    /// Filesystem statistics
    pub fn statfs(&self) -> FsResult<StatFs> {
        self.check_entry()?;
        let mut free = self.alloc.free_blocks();
        for layer in self.layers.all() {
            free += layer.pools.reserved_blocks();
        }
        Ok(StatFs {
            total_blocks: self.dev.block_count(),
            free_blocks: free,
            total_inodes: self.inode_count.load(Ordering::Relaxed),
            block_size: BLOCK_SIZE as u32,
            max_filename_length: NAME_MAX as u32,
            layers: self.layers.count(),
        })
    }

    /// Set an extended attribute
    pub fn setxattr(
        &self,
        layer: LayerId,
        ino: InodeNumber,
        name: &str,
        value: &[u8],
    ) -> FsResult<()> {
        let layer = self.layers.get(layer)?;
        let _barrier = self.check_mutable(&layer)?;
        let inode = self.resolve_for_write(&layer, ino)?;
        let mut inner = inode.write();
        inner.materialize_xattrs();
        Arc::make_mut(&mut inner.xattrs).set(name, value)?;
        inner.ctime = now();
        inner.flags.insert(InodeFlags::DIRTY | InodeFlags::XATTR_DIRTY);
        layer.mark_dirty();
        Ok(())
    }

    /// Value of an extended attribute
    pub fn getxattr(&self, layer: LayerId, ino: InodeNumber, name: &str) -> FsResult<Vec<u8>> {
        self.check_entry()?;
        let layer = self.layers.get(layer)?;
        let inode = self.resolve_inode(&layer, ino)?;
        let inner = inode.read();
        inner.xattrs.get(name).map(|v| v.to_vec()).ok_or(FsError::NotFound)
    }

    /// All extended attribute names
    pub fn listxattr(&self, layer: LayerId, ino: InodeNumber) -> FsResult<Vec<String>> {
        self.check_entry()?;
        let layer = self.layers.get(layer)?;
        let inode = self.resolve_inode(&layer, ino)?;
        let inner = inode.read();
        Ok(inner.xattrs.names())
    }

    /// Remove an extended attribute
    pub fn removexattr(&self, layer: LayerId, ino: InodeNumber, name: &str) -> FsResult<()> {
        let layer = self.layers.get(layer)?;
        let _barrier = self.check_mutable(&layer)?;
        let inode = self.resolve_for_write(&layer, ino)?;
        let mut inner = inode.write();
        if inner.xattrs.get(name).is_none() {
            return Err(FsError::NotFound);
        }
        inner.materialize_xattrs();
        Arc::make_mut(&mut inner.xattrs).remove(name)?;
        inner.ctime = now();
        inner.flags.insert(InodeFlags::DIRTY | InodeFlags::XATTR_DIRTY);
        layer.mark_dirty();
        Ok(())
    }

    /// Layer management, dispatched against the snapshot root directory
    pub fn ioctl(
        &self,
        layer: LayerId,
        ino: InodeNumber,
        cmd: LayerIoctl,
    ) -> FsResult<LayerIoctlReply> {
        self.check_entry()?;
        let _ = self.layers.get(layer)?;
        if ino != self.snapshot_root {
            return Err(FsError::Invalid);
        }
        match cmd {
            LayerIoctl::Create {
                name,
                parent,
                readonly,
            } => {
                let parent = if parent.is_empty() { None } else { Some(parent.as_str()) };
                self.create_layer(&name, parent, readonly).map(LayerIoctlReply::Created)
            }
            LayerIoctl::Remove(name) => self.remove_layer(&name).map(|_| LayerIoctlReply::Done),
            LayerIoctl::Commit(name) => self.commit_layer(&name).map(|_| LayerIoctlReply::Done),
            LayerIoctl::Stat(name) => self.stat_layer(&name).map(LayerIoctlReply::Stat),
        }
    }

    /// Operation counter snapshot
    pub fn stats(&self) -> FsStats {
        FsStats {
            inodes_cached: self.inode_count.load(Ordering::Relaxed),
            clones: self.counters.clones.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            flusher_passes: self.counters.flusher_passes.load(Ordering::Relaxed),
        }
    }

    /// Page cache counter snapshot
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Block accounting across every structure that can hold a block. At a
    /// stable point `accounted()` equals the device size.
    pub fn block_usage(&self) -> BlockUsage {
        let _guard = self.layers.lock.lock();
        let mut usage = BlockUsage {
            total: self.dev.block_count(),
            superblock: 1,
            global_free: self.alloc.free_blocks(),
            ..Default::default()
        };
        {
            let chains = self.sb_chains.lock();
            usage.metadata += (chains.free.len() + chains.layers.len()) as u64;
        }
        for layer in self.layers.all() {
            usage.layer_reserved += layer.pools.reserved_blocks();
            usage.metadata += layer.meta_block_count();
            for inode in layer.icache.all() {
                let inner = inode.read();
                let cloned = inner.flags.contains(InodeFlags::CLONED);
                if let Body::Regular { map, .. } = &inner.body {
                    for ext in map.owned_extents(cloned) {
                        usage.file_data += ext.len;
                    }
                }
                usage.metadata += (inner.bmap_chain.len()
                    + inner.dir_chain.len()
                    + inner.xattr_chain.len()) as u64;
            }
        }
        usage
    }
}

// ============================================================================
// Internals
// ============================================================================

impl Lcfs {
    fn handle(&self, fh: u64) -> FsResult<OpenFile> {
        self.handles.read().get(&fh).cloned().ok_or(FsError::Invalid)
    }

    fn install_handle(&self, layer: &Arc<Layer>, inode: Arc<Inode>, flags: OpenFlags) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.write().insert(
            fh,
            OpenFile {
                layer: layer.id,
                inode,
                flags,
            },
        );
        fh
    }

    /// Shared create path for files, directories, symlinks and nodes
    #[allow(clippy::too_many_arguments)]
    fn create_entry(
        &self,
        layer: LayerId,
        parent: InodeNumber,
        name: &str,
        kind: FileType,
        perms: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
        target: Option<&str>,
    ) -> FsResult<Arc<Inode>> {
        let layer = self.layers.get(layer)?;
        let _barrier = self.check_mutable(&layer)?;
        self.snapshot_root_guard(&layer, parent)?;

        let dir_inode = self.resolve_for_write(&layer, parent)?;
        let mut inner = dir_inode.write();
        if inner.dir()?.lookup(name).is_some() {
            return Err(FsError::Exists);
        }
        let new_inode = self.alloc_inode(&layer, kind, perms, uid, gid, rdev, dir_inode.ino);
        if let Some(target) = target {
            let mut target_inner = new_inode.write();
            target_inner.size = target.len() as u64;
            target_inner.body = Body::Symlink(Arc::new(target.to_string()));
        }

        inner.materialize_body();
        if let Body::Directory(dir) = &mut inner.body {
            Arc::make_mut(dir).insert(name, new_inode.ino, kind)?;
            inner.size = dir.len() as u64;
        }
        if kind == FileType::Directory {
            inner.nlink += 1;
        }
        inner.mtime = now();
        inner.ctime = inner.mtime;
        inner.flags.insert(InodeFlags::DIRTY | InodeFlags::DIR_DIRTY);
        layer.mark_dirty();
        Ok(new_inode)
    }

    /// Decrement a link and retire the inode when the last one goes
    fn drop_link(&self, layer: &Arc<Layer>, ino: InodeNumber, is_dir: bool) -> FsResult<()> {
        let inode = self.resolve_for_write(layer, ino)?;
        let mut inner = inode.write();
        inner.nlink = if is_dir { 0 } else { inner.nlink.saturating_sub(1) };
        inner.ctime = now();
        if inner.nlink == 0 {
            inner.flags.insert(InodeFlags::REMOVED | InodeFlags::DIRTY);
            self.release_inode_storage(Some(&layer.pools), &mut inner);
        } else {
            inner.flags.insert(InodeFlags::DIRTY);
        }
        Ok(())
    }

    /// Shrink or extend a regular file under its write lock
    fn truncate_locked(
        &self,
        layer: &Arc<Layer>,
        inner: &mut crate::inode::InodeInner,
        new_size: u64,
    ) -> FsResult<()> {
        if new_size >= inner.size {
            inner.size = new_size;
            inner.mtime = now();
            return Ok(());
        }
        let keep = new_size.div_euclid(BLOCK_SIZE as u64)
            + u64::from(new_size % BLOCK_SIZE as u64 != 0);
        inner.materialize_body();
        let cloned = inner.flags.contains(InodeFlags::CLONED);
        let tail_off = (new_size % BLOCK_SIZE as u64) as usize;
        let tail_logical = new_size / BLOCK_SIZE as u64;

        let mut tail_base: Option<Vec<u8>> = None;
        if let Body::Regular { map, dirty } = &mut inner.body {
            let freed = Arc::make_mut(map).truncate_blocks(keep, cloned);
            for ext in freed {
                self.alloc.free(Some(&layer.pools), ext, false);
            }
            dirty.retain(|&l, _| l < keep);
            if tail_off != 0 {
                if let Some(page) = dirty.get_mut(&tail_logical) {
                    page[tail_off..].fill(0);
                } else if let Some(physical) = map.lookup(tail_logical) {
                    tail_base = Some(self.cache.read_data(layer.id, physical)?.as_ref().clone());
                }
            }
            inner.flags.insert(InodeFlags::BMAP_DIRTY);
        }
        if let Some(mut page) = tail_base {
            page[tail_off..].fill(0);
            if let Body::Regular { dirty, .. } = &mut inner.body {
                dirty.insert(tail_logical, page);
            }
        }
        inner.size = new_size;
        inner.mtime = now();
        Ok(())
    }
}

/// Move `old_name` out of `src`, into `dst` (or within `src` when `dst` is
/// `None`) as `new_name`. Returns the moved inode, any displaced target
/// inode and whether the moved entry is a directory.
fn rename_entries(
    src: &mut crate::inode::InodeInner,
    old_name: &str,
    dst: &mut Option<&mut crate::inode::InodeInner>,
    new_name: &str,
) -> FsResult<(InodeNumber, Option<InodeNumber>, bool)> {
    let entry = {
        let src_dir = src.dir()?;
        src_dir.lookup(old_name).ok_or(FsError::NotFound)?.clone()
    };
    let is_dir = entry.kind == FileType::Directory;

    let displaced = {
        let dst_body = match dst {
            Some(inner) => inner.dir()?,
            None => src.dir()?,
        };
        match dst_body.lookup(new_name) {
            Some(existing) => {
                if existing.kind == FileType::Directory && !is_dir {
                    return Err(FsError::IsADirectory);
                }
                if !matches!(existing.kind, FileType::Directory) && is_dir {
                    return Err(FsError::NotADirectory);
                }
                Some(existing.ino)
            }
            None => None,
        }
    };

    if let Body::Directory(dir) = &mut src.body {
        Arc::make_mut(dir).remove(old_name)?;
        src.size = dir.len() as u64;
    }
    let dst_inner: &mut crate::inode::InodeInner = match dst {
        Some(inner) => &mut **inner,
        None => src,
    };
    if let Body::Directory(dir) = &mut dst_inner.body {
        let dir = Arc::make_mut(dir);
        if displaced.is_some() {
            dir.remove(new_name)?;
        }
        dir.insert(new_name, entry.ino, entry.kind)?;
        dst_inner.size = dir.len() as u64;
    }
    Ok((entry.ino, displaced, is_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn mounted(blocks: u64) -> Arc<Lcfs> {
        let dev = Arc::new(MemDevice::new(blocks));
        Lcfs::mount(dev, MountOptions::default()).unwrap()
    }

    #[test]
    fn blank_device_formats_and_mounts() {
        let fs = mounted(256);
        let stat = fs.getattr(0, ROOT_INO).unwrap();
        assert_eq!(stat.file_type, FileType::Directory);
        assert_eq!(stat.nlink, 2);
        let sfs = fs.statfs().unwrap();
        assert_eq!(sfs.total_blocks, 256);
        assert_eq!(sfs.layers, 1);
        fs.unmount().unwrap();
    }

    #[test]
    fn create_write_read_in_base_layer() {
        let fs = mounted(512);
        let (fh, stat) = fs
            .create(0, ROOT_INO, "hello.txt", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        assert_eq!(stat.size, 0);

        fs.write(fh, 0, b"hello world").unwrap();
        assert_eq!(fs.read(fh, 0, 64).unwrap(), b"hello world");
        assert_eq!(fs.read(fh, 6, 5).unwrap(), b"world");
        assert_eq!(fs.getattr(0, stat.ino).unwrap().size, 11);
        fs.release(fh).unwrap();

        let found = fs.lookup(0, ROOT_INO, "hello.txt").unwrap();
        assert_eq!(found.ino, stat.ino);
        assert_eq!(fs.lookup(0, ROOT_INO, "missing"), Err(FsError::NotFound));
        fs.unmount().unwrap();
    }

    #[test]
    fn sparse_write_reads_back_zeros_in_hole() {
        let fs = mounted(512);
        let (fh, _) = fs
            .create(0, ROOT_INO, "sparse", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        let far = 3 * BLOCK_SIZE as u64 + 100;
        fs.write(fh, far, b"tail").unwrap();

        let head = fs.read(fh, 0, 16).unwrap();
        assert!(head.iter().all(|&b| b == 0));
        assert_eq!(fs.read(fh, far, 4).unwrap(), b"tail");
        fs.unmount().unwrap();
    }

    #[test]
    fn unlink_then_lookup_fails() {
        let fs = mounted(512);
        let (fh, _) = fs
            .create(0, ROOT_INO, "gone", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        fs.release(fh).unwrap();
        fs.unlink(0, ROOT_INO, "gone").unwrap();
        assert_eq!(fs.lookup(0, ROOT_INO, "gone"), Err(FsError::NotFound));
        assert_eq!(fs.unlink(0, ROOT_INO, "gone"), Err(FsError::NotFound));
        fs.unmount().unwrap();
    }

    #[test]
    fn rmdir_refuses_non_empty() {
        let fs = mounted(512);
        let d = fs.mkdir(0, ROOT_INO, "d", 0o755, 0, 0).unwrap();
        fs.mkdir(0, d.ino, "sub", 0o755, 0, 0).unwrap();
        assert_eq!(fs.rmdir(0, ROOT_INO, "d"), Err(FsError::NotEmpty));
        fs.rmdir(0, d.ino, "sub").unwrap();
        fs.rmdir(0, ROOT_INO, "d").unwrap();
        assert_eq!(fs.lookup(0, ROOT_INO, "d"), Err(FsError::NotFound));
        fs.unmount().unwrap();
    }

    #[test]
    fn rename_moves_between_directories() {
        let fs = mounted(512);
        let a = fs.mkdir(0, ROOT_INO, "a", 0o755, 0, 0).unwrap();
        let b = fs.mkdir(0, ROOT_INO, "b", 0o755, 0, 0).unwrap();
        let (fh, f) = fs
            .create(0, a.ino, "f", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        fs.write(fh, 0, b"data").unwrap();
        fs.release(fh).unwrap();

        fs.rename(0, a.ino, "f", b.ino, "g").unwrap();
        assert_eq!(fs.lookup(0, a.ino, "f"), Err(FsError::NotFound));
        assert_eq!(fs.lookup(0, b.ino, "g").unwrap().ino, f.ino);
        assert_eq!(fs.getattr(0, f.ino).unwrap().size, 4);
        fs.unmount().unwrap();
    }

    #[test]
    fn rename_refuses_to_displace_non_empty_directory() {
        let fs = mounted(512);
        let a = fs.mkdir(0, ROOT_INO, "a", 0o755, 0, 0).unwrap();
        let b = fs.mkdir(0, ROOT_INO, "b", 0o755, 0, 0).unwrap();
        fs.create(0, b.ino, "kept", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();

        assert_eq!(
            fs.rename(0, ROOT_INO, "a", ROOT_INO, "b"),
            Err(FsError::NotEmpty)
        );
        // Nothing moved and nothing was orphaned.
        assert!(fs.lookup(0, ROOT_INO, "a").is_ok());
        assert_eq!(fs.lookup(0, b.ino, "kept").unwrap().file_type, FileType::Regular);

        // An empty directory is displaced and fully retired.
        fs.unlink(0, b.ino, "kept").unwrap();
        fs.rename(0, ROOT_INO, "a", ROOT_INO, "b").unwrap();
        assert_eq!(fs.lookup(0, ROOT_INO, "a"), Err(FsError::NotFound));
        assert_eq!(fs.lookup(0, ROOT_INO, "b").unwrap().ino, a.ino);
        assert_eq!(fs.getattr(0, b.ino), Err(FsError::NotFound));
        // Root lost one subdirectory: two became one.
        assert_eq!(fs.getattr(0, ROOT_INO).unwrap().nlink, 3);
        fs.unmount().unwrap();
    }

    #[test]
    fn rename_onto_same_name_is_a_no_op() {
        let fs = mounted(512);
        let (fh, f) = fs
            .create(0, ROOT_INO, "same", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        fs.write(fh, 0, b"body").unwrap();
        fs.release(fh).unwrap();

        fs.rename(0, ROOT_INO, "same", ROOT_INO, "same").unwrap();
        let stat = fs.lookup(0, ROOT_INO, "same").unwrap();
        assert_eq!(stat.ino, f.ino);
        assert_eq!(stat.nlink, 1);
        assert_eq!(
            fs.rename(0, ROOT_INO, "ghost", ROOT_INO, "ghost"),
            Err(FsError::NotFound)
        );
        fs.unmount().unwrap();
    }

    #[test]
    fn symlink_round_trip() {
        let fs = mounted(512);
        let s = fs.symlink(0, ROOT_INO, "lib", "usr/lib64", 0, 0).unwrap();
        assert_eq!(s.file_type, FileType::SymbolicLink);
        assert_eq!(s.size, 9);
        assert_eq!(fs.readlink(0, s.ino).unwrap(), "usr/lib64");
        fs.unmount().unwrap();
    }

    #[test]
    fn hard_link_shares_inode() {
        let fs = mounted(512);
        let (fh, f) = fs
            .create(0, ROOT_INO, "one", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        fs.write(fh, 0, b"shared").unwrap();
        fs.release(fh).unwrap();

        let linked = fs.link(0, f.ino, ROOT_INO, "two").unwrap();
        assert_eq!(linked.nlink, 2);
        assert_eq!(fs.lookup(0, ROOT_INO, "two").unwrap().ino, f.ino);

        fs.unlink(0, ROOT_INO, "one").unwrap();
        let stat = fs.getattr(0, f.ino).unwrap();
        assert_eq!(stat.nlink, 1);
        let fh = fs.open(0, f.ino, OpenFlags::read_only()).unwrap();
        assert_eq!(fs.read(fh, 0, 16).unwrap(), b"shared");
        fs.release(fh).unwrap();
        fs.unmount().unwrap();
    }

    #[test]
    fn truncate_drops_tail() {
        let fs = mounted(512);
        let (fh, f) = fs
            .create(0, ROOT_INO, "t", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        fs.write(fh, 0, &vec![7u8; 2 * BLOCK_SIZE + 100]).unwrap();
        let attr = SetAttr {
            size: Some(50),
            ..Default::default()
        };
        fs.setattr(0, f.ino, &attr).unwrap();
        assert_eq!(fs.getattr(0, f.ino).unwrap().size, 50);
        let data = fs.read(fh, 0, 4096).unwrap();
        assert_eq!(data.len(), 50);
        assert!(data.iter().all(|&b| b == 7));
        fs.unmount().unwrap();
    }

    #[test]
    fn ioctl_requires_snapshot_root() {
        let fs = mounted(512);
        let d = fs.mkdir(0, ROOT_INO, "dir", 0o755, 0, 0).unwrap();
        let err = fs.ioctl(0, d.ino, LayerIoctl::Stat(String::new()));
        assert_eq!(err.err(), Some(FsError::Invalid));

        let reply = fs
            .ioctl(
                0,
                ROOT_INO,
                LayerIoctl::Create {
                    name: "img".into(),
                    parent: String::new(),
                    readonly: false,
                },
            )
            .unwrap();
        assert!(matches!(reply, LayerIoctlReply::Created(1)));
        fs.unmount().unwrap();
    }

    #[test]
    fn shutting_down_rejects_requests() {
        let fs = mounted(512);
        fs.unmount().unwrap();
        assert_eq!(fs.getattr(0, ROOT_INO), Err(FsError::ShuttingDown));
        assert_eq!(
            fs.mkdir(0, ROOT_INO, "x", 0o755, 0, 0),
            Err(FsError::ShuttingDown)
        );
    }

    #[test]
    fn block_accounting_is_conserved() {
        let fs = mounted(1024);
        let usage = fs.block_usage();
        assert_eq!(usage.accounted(), usage.total);

        let (fh, _) = fs
            .create(0, ROOT_INO, "f", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        fs.write(fh, 0, &vec![1u8; 10 * BLOCK_SIZE]).unwrap();
        fs.release(fh).unwrap();
        fs.commit_layer("").unwrap();

        let usage = fs.block_usage();
        assert_eq!(usage.accounted(), usage.total);
        assert!(usage.file_data >= 10);
        fs.unmount().unwrap();
    }

    fn file_extent(fs: &Lcfs, layer: LayerId, ino: InodeNumber) -> Option<crate::extent::Extent> {
        let layer = fs.layers.get(layer).unwrap();
        let inode = fs.resolve_inode(&layer, ino).unwrap();
        let inner = inode.read();
        inner.contig_extent()
    }

    #[test]
    fn fresh_file_flushes_to_one_extent() {
        let fs = mounted(1024);
        let (fh, stat) = fs
            .create(0, ROOT_INO, "img", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        fs.write(fh, 0, &vec![3u8; 300 * BLOCK_SIZE]).unwrap();
        fs.release(fh).unwrap();
        fs.commit_layer("").unwrap();

        let ext = file_extent(&fs, 0, stat.ino).expect("compact representation");
        assert_eq!(ext.len, 300);
        fs.unmount().unwrap();
    }

    #[test]
    fn append_extends_the_extent_in_place() {
        let fs = mounted(1024);
        let (fh, stat) = fs
            .create(0, ROOT_INO, "log", 0o644, 0, 0, OpenFlags::read_write())
            .unwrap();
        fs.write(fh, 0, &vec![1u8; 4 * BLOCK_SIZE]).unwrap();
        fs.commit_layer("").unwrap();
        let first = file_extent(&fs, 0, stat.ino).unwrap();
        assert_eq!(first.len, 4);

        // The next run of the file continues right where the last ended.
        fs.write(fh, 4 * BLOCK_SIZE as u64, &vec![2u8; 2 * BLOCK_SIZE]).unwrap();
        fs.commit_layer("").unwrap();
        let grown = file_extent(&fs, 0, stat.ino).unwrap();
        assert_eq!(grown.start, first.start);
        assert_eq!(grown.len, 6);

        // A write that breaks contiguity converts to the sparse map.
        fs.write(fh, 20 * BLOCK_SIZE as u64, b"far").unwrap();
        fs.commit_layer("").unwrap();
        assert!(file_extent(&fs, 0, stat.ino).is_none());
        fs.release(fh).unwrap();

        let usage = fs.block_usage();
        assert_eq!(usage.accounted(), usage.total);
        fs.unmount().unwrap();
    }

    #[test]
    fn mknod_creates_device_nodes() {
        let fs = mounted(512);
        let node = fs
            .mknod(0, ROOT_INO, "null", FileType::CharacterDevice, 0o666, 0, 0, 0x0103)
            .unwrap();
        assert_eq!(node.file_type, FileType::CharacterDevice);
        assert_eq!(node.rdev, 0x0103);
        assert_eq!(fs.lookup(0, ROOT_INO, "null").unwrap().ino, node.ino);

        // Directories and symlinks take their own paths.
        assert_eq!(
            fs.mknod(0, ROOT_INO, "bad", FileType::Directory, 0o755, 0, 0, 0)
                .map(|_| ()),
            Err(FsError::Invalid)
        );
        fs.unmount().unwrap();
    }

    #[test]
    fn readdir_cookies_resume_iteration() {
        let fs = mounted(512);
        for i in 0..10 {
            fs.mkdir(0, ROOT_INO, &format!("d{i}"), 0o755, 0, 0).unwrap();
        }
        let fh = fs.opendir(0, ROOT_INO).unwrap();
        let mut seen = Vec::new();
        let mut cookie = 0;
        loop {
            let batch: Vec<_> = fs.readdir(fh, cookie).unwrap().into_iter().take(4).collect();
            let Some(last) = batch.last() else { break };
            cookie = last.cookie;
            seen.extend(batch);
        }
        fs.releasedir(fh).unwrap();

        assert_eq!(seen.len(), 12);
        assert_eq!(seen[0].name, ".");
        assert_eq!(seen[1].name, "..");
        let dirs: Vec<_> = seen.iter().skip(2).map(|e| e.name.clone()).collect();
        assert_eq!(dirs, (0..10).map(|i| format!("d{i}")).collect::<Vec<_>>());
        fs.unmount().unwrap();
    }

    #[test]
    fn read_only_mount_rejects_modification() {
        let dev = Arc::new(MemDevice::new(256));
        Lcfs::format(dev.as_ref()).unwrap();
        let opts = MountOptions {
            read_only: true,
            ..Default::default()
        };
        let fs = Lcfs::mount(dev, opts).unwrap();
        assert_eq!(
            fs.mkdir(0, ROOT_INO, "x", 0o755, 0, 0).map(|_| ()),
            Err(FsError::ReadOnly)
        );
        assert!(fs.getattr(0, ROOT_INO).is_ok());
        fs.unmount().unwrap();
    }
}
