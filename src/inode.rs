//! Inodes and the per-layer inode cache
//!
//! Every layer owns a fixed-size, bucketed hash of its inodes. Lookups that
//! miss walk up the layer parent chain; the first hit wins, and a removed
//! inode found in a child layer is authoritative, it hides the parent's
//! copy. Modifying an inode that lives in a parent layer first clones it
//! into the target layer (copy-up): stat fields are copied, kind-specific
//! bodies and the xattr list are borrowed by reference and only
//! materialized into private copies on first mutation.
//!
//! Inodes are never reclaimed individually while their layer is mounted, so
//! parent-chain lookups can hold plain references without liveness
//! bookkeeping.

use crate::bmap::BlockMap;
use crate::dir::DirBody;
use crate::disk::{mode_from, DiskInode};
use crate::extent::Extent;
use crate::fs::Lcfs;
use crate::layer::Layer;
use crate::xattr::Xattrs;
use crate::{
    now, FileType, FsError, FsResult, InodeNumber, LayerId, Stat, BLOCK_SIZE, ICACHE_BUCKETS,
};
use bitflags::bitflags;
use log::debug;
use spin::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

bitflags! {
    /// Inode state flags
    pub struct InodeFlags: u32 {
        /// Kind-specific body is borrowed from a parent layer
        const SHARED = 0x001;
        /// Xattr list is borrowed from a parent layer
        const XATTR_SHARED = 0x002;
        /// Inode was cloned into this layer by copy-up
        const CLONED = 0x004;
        /// Inode was unlinked within this layer
        const REMOVED = 0x008;
        /// Stat fields need persisting
        const DIRTY = 0x010;
        /// Block map needs persisting
        const BMAP_DIRTY = 0x020;
        /// Directory body needs persisting
        const DIR_DIRTY = 0x040;
        /// Xattr list needs persisting
        const XATTR_DIRTY = 0x080;
        /// A prior copy of this inode exists on disk in this layer
        const ON_DISK = 0x100;
    }
}

/// Kind-specific inode body
#[derive(Debug, Clone)]
pub enum Body {
    /// Regular file: block map plus not-yet-flushed dirty pages
    Regular {
        /// Logical to physical mapping, shared after copy-up
        map: Arc<BlockMap>,
        /// Dirty pages keyed by logical block, private to this layer
        dirty: BTreeMap<u64, Vec<u8>>,
    },
    /// Directory entries, shared after copy-up
    Directory(Arc<DirBody>),
    /// Symlink target, shared after copy-up
    Symlink(Arc<String>),
    /// Device node, FIFO or socket; no body beyond the stat
    Special,
}

impl Body {
    fn empty_for(kind: FileType) -> Self {
        match kind {
            FileType::Regular => Body::Regular {
                map: Arc::new(BlockMap::Empty),
                dirty: BTreeMap::new(),
            },
            FileType::Directory => Body::Directory(Arc::new(DirBody::new())),
            FileType::SymbolicLink => Body::Symlink(Arc::new(String::new())),
            _ => Body::Special,
        }
    }
}

/// Mutable inode state guarded by the inode lock
#[derive(Debug)]
pub struct InodeInner {
    /// File type
    pub kind: FileType,
    /// Permission bits
    pub perms: u32,
    /// Hard link count
    pub nlink: u32,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// Device number for device nodes
    pub rdev: u32,
    /// File size in bytes
    pub size: u64,
    /// Last access time
    pub atime: u64,
    /// Last modification time
    pub mtime: u64,
    /// Last status change time
    pub ctime: u64,
    /// Parent directory inode
    pub parent: InodeNumber,
    /// State flags
    pub flags: InodeFlags,
    /// Kind-specific body
    pub body: Body,
    /// Extended attributes, shared after copy-up
    pub xattrs: Arc<Xattrs>,
    /// Block holding this inode's on-disk copy in this layer, 0 when none
    pub disk_block: u64,
    /// Bmap chain blocks this layer wrote for the inode
    pub bmap_chain: Vec<u64>,
    /// Directory chain blocks this layer wrote for the inode
    pub dir_chain: Vec<u64>,
    /// Xattr chain blocks this layer wrote for the inode
    pub xattr_chain: Vec<u64>,
}

/// One inode, hashed into exactly one layer
#[derive(Debug)]
pub struct Inode {
    /// Stable inode number
    pub ino: InodeNumber,
    /// Layer that owns this copy
    pub layer: LayerId,
    inner: RwLock<InodeInner>,
}

impl Inode {
    /// Create a fresh inode owned by `layer`
    pub fn new(
        ino: InodeNumber,
        layer: LayerId,
        kind: FileType,
        perms: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
        parent: InodeNumber,
    ) -> Arc<Self> {
        let t = now();
        Arc::new(Self {
            ino,
            layer,
            inner: RwLock::new(InodeInner {
                kind,
                perms,
                nlink: if kind == FileType::Directory { 2 } else { 1 },
                uid,
                gid,
                rdev,
                size: 0,
                atime: t,
                mtime: t,
                ctime: t,
                parent,
                flags: InodeFlags::DIRTY,
                body: Body::empty_for(kind),
                xattrs: Arc::new(Xattrs::new()),
                disk_block: 0,
                bmap_chain: Vec::new(),
                dir_chain: Vec::new(),
                xattr_chain: Vec::new(),
            }),
        })
    }

    /// Rebuild an inode from loaded state
    pub fn from_parts(ino: InodeNumber, layer: LayerId, inner: InodeInner) -> Arc<Self> {
        Arc::new(Self {
            ino,
            layer,
            inner: RwLock::new(inner),
        })
    }

    /// Acquire the inode read lock
    pub fn read(&self) -> RwLockReadGuard<'_, InodeInner> {
        self.inner.read()
    }

    /// Acquire the inode write lock
    pub fn write(&self) -> RwLockWriteGuard<'_, InodeInner> {
        self.inner.write()
    }

    /// Stat snapshot under the caller's lock
    pub fn stat_locked(&self, inner: &InodeInner) -> Stat {
        Stat {
            ino: self.ino,
            file_type: inner.kind,
            perms: inner.perms,
            nlink: inner.nlink,
            uid: inner.uid,
            gid: inner.gid,
            rdev: inner.rdev,
            size: inner.size,
            blocks: inner.block_count(),
            atime: inner.atime,
            mtime: inner.mtime,
            ctime: inner.ctime,
            blksize: BLOCK_SIZE as u32,
        }
    }
}

impl InodeInner {
    /// Allocated blocks, counting dirty pages not yet placed
    pub fn block_count(&self) -> u64 {
        match &self.body {
            Body::Regular { map, dirty } => {
                let mapped = map.block_count();
                let pending = dirty.keys().filter(|l| map.lookup(**l).is_none()).count();
                mapped + pending as u64
            }
            _ => 0,
        }
    }

    /// Directory body reference; the inode must be a directory
    pub fn dir(&self) -> FsResult<&Arc<DirBody>> {
        match &self.body {
            Body::Directory(dir) => Ok(dir),
            _ => Err(FsError::NotADirectory),
        }
    }

    /// Make the kind-specific body privately owned. Idempotent.
    ///
    /// For a copied-up regular file this converts the borrowed map into a
    /// sparse map whose entries are all marked inherited, so nothing the
    /// parent references is ever freed by this layer.
    pub fn materialize_body(&mut self) {
        if !self.flags.contains(InodeFlags::SHARED) {
            return;
        }
        let cloned = self.flags.contains(InodeFlags::CLONED);
        match &mut self.body {
            Body::Regular { map, .. } => {
                let mut owned = (**map).clone();
                owned.to_sparse(cloned);
                if cloned {
                    // Every pre-existing block belongs to an ancestor, even
                    // ones the ancestor itself marked as its own.
                    owned.mark_all_inherited();
                }
                *map = Arc::new(owned);
            }
            Body::Directory(dir) => {
                *dir = Arc::new((**dir).clone());
            }
            Body::Symlink(target) => {
                *target = Arc::new((**target).clone());
            }
            Body::Special => {}
        }
        self.flags.remove(InodeFlags::SHARED);
    }

    /// Make the xattr list privately owned. Idempotent.
    pub fn materialize_xattrs(&mut self) {
        if self.flags.contains(InodeFlags::XATTR_SHARED) {
            self.xattrs = Arc::new((*self.xattrs).clone());
            self.flags.remove(InodeFlags::XATTR_SHARED);
        }
    }

    /// Contiguous extent of the compact map form, if that is the current
    /// representation
    pub fn contig_extent(&self) -> Option<Extent> {
        match &self.body {
            Body::Regular { map, .. } => match **map {
                BlockMap::Contig(ext) => Some(ext),
                _ => None,
            },
            _ => None,
        }
    }

    /// Serialize the stat portion for the inode block
    pub fn to_disk(&self, ino: InodeNumber) -> DiskInode {
        let mut d = DiskInode {
            ino,
            size: self.size,
            blocks: self.block_count(),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            parent: self.parent,
            extent_start: 0,
            extent_len: 0,
            bmap_head: 0,
            dir_head: 0,
            xattr_head: 0,
            mode: mode_from(self.kind, self.perms),
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            target_len: 0,
        };
        if let Some(ext) = self.contig_extent() {
            d.extent_start = ext.start;
            d.extent_len = ext.len;
        }
        if let Body::Symlink(target) = &self.body {
            d.target_len = target.len() as u32;
        }
        d
    }
}

// ============================================================================
// Per-layer inode hash
// ============================================================================

/// Fixed-size bucketed hash of one layer's inodes
pub struct InodeCache {
    buckets: Vec<Mutex<Vec<Arc<Inode>>>>,
}

impl InodeCache {
    /// Create an empty cache
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(ICACHE_BUCKETS);
        for _ in 0..ICACHE_BUCKETS {
            buckets.push(Mutex::new(Vec::new()));
        }
        Self { buckets }
    }

    fn bucket(&self, ino: InodeNumber) -> &Mutex<Vec<Arc<Inode>>> {
        &self.buckets[(ino % ICACHE_BUCKETS as u64) as usize]
    }

    /// Find an inode without taking its lock
    pub fn lookup(&self, ino: InodeNumber) -> Option<Arc<Inode>> {
        self.bucket(ino)
            .lock()
            .iter()
            .find(|i| i.ino == ino)
            .cloned()
    }

    /// Insert a new inode; returns the existing one when another thread
    /// inserted the same number first
    pub fn insert_or_existing(&self, inode: Arc<Inode>) -> Arc<Inode> {
        let mut bucket = self.bucket(inode.ino).lock();
        if let Some(existing) = bucket.iter().find(|i| i.ino == inode.ino) {
            return existing.clone();
        }
        bucket.push(inode.clone());
        inode
    }

    /// Drop an inode from the hash
    pub fn remove(&self, ino: InodeNumber) -> Option<Arc<Inode>> {
        let mut bucket = self.bucket(ino).lock();
        let pos = bucket.iter().position(|i| i.ino == ino)?;
        Some(bucket.remove(pos))
    }

    /// Snapshot of every cached inode
    pub fn all(&self) -> Vec<Arc<Inode>> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            out.extend(bucket.lock().iter().cloned());
        }
        out
    }

    /// Number of cached inodes
    pub fn count(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Chain lookup and copy-up
// ============================================================================

impl Lcfs {
    /// Find `ino` in `layer` or any ancestor, for reading.
    ///
    /// A removed inode in a descendant hides the parent's copy; the walk
    /// stops there with `NotFound` instead of falling through.
    pub(crate) fn resolve_inode(
        &self,
        layer: &Arc<Layer>,
        ino: InodeNumber,
    ) -> FsResult<Arc<Inode>> {
        let mut current = layer.clone();
        loop {
            if let Some(inode) = current.icache.lookup(ino) {
                if inode.read().flags.contains(InodeFlags::REMOVED) {
                    return Err(FsError::NotFound);
                }
                return Ok(inode);
            }
            current = match current.parent {
                Some(pid) => self.layers.get(pid)?,
                None => return Err(FsError::NotFound),
            };
        }
    }

    /// Find `ino` for modification in `layer`, cloning it out of an
    /// ancestor when necessary. Fails with `ReadOnly` on frozen layers.
    ///
    /// Callers hold the layer's write barrier (through `check_mutable`),
    /// so the frozen flag cannot flip mid-operation; the check here only
    /// re-validates the entry condition.
    pub(crate) fn resolve_for_write(
        &self,
        layer: &Arc<Layer>,
        ino: InodeNumber,
    ) -> FsResult<Arc<Inode>> {
        if layer.is_frozen() {
            return Err(FsError::ReadOnly);
        }
        let source = self.resolve_inode(layer, ino)?;
        if source.layer == layer.id {
            return Ok(source);
        }
        self.copy_up(layer, &source)
    }

    /// Clone `source` from an ancestor layer into `layer`
    fn copy_up(&self, layer: &Arc<Layer>, source: &Arc<Inode>) -> FsResult<Arc<Inode>> {
        let src = source.read();
        let clone = Inode::from_parts(
            source.ino,
            layer.id,
            InodeInner {
                kind: src.kind,
                perms: src.perms,
                nlink: src.nlink,
                uid: src.uid,
                gid: src.gid,
                rdev: src.rdev,
                size: src.size,
                atime: src.atime,
                mtime: src.mtime,
                ctime: src.ctime,
                parent: src.parent,
                // Borrowed bodies are marked dirty so the clone's own copy
                // of everything lands on disk at the next sync.
                flags: shared_flags_for(&src.body)
                    | InodeFlags::XATTR_SHARED
                    | InodeFlags::XATTR_DIRTY
                    | InodeFlags::CLONED
                    | InodeFlags::DIRTY,
                body: match &src.body {
                    Body::Regular { map, .. } => Body::Regular {
                        map: map.clone(),
                        dirty: BTreeMap::new(),
                    },
                    Body::Directory(dir) => Body::Directory(dir.clone()),
                    Body::Symlink(target) => Body::Symlink(target.clone()),
                    Body::Special => Body::Special,
                },
                xattrs: src.xattrs.clone(),
                disk_block: 0,
                bmap_chain: Vec::new(),
                dir_chain: Vec::new(),
                xattr_chain: Vec::new(),
            },
        );
        drop(src);

        // Another writer may have copied the inode up concurrently; the
        // bucket decides who won.
        let inode = layer.icache.insert_or_existing(clone.clone());
        if Arc::ptr_eq(&inode, &clone) {
            layer.mark_dirty();
            self.counters.clones.fetch_add(1, Ordering::Relaxed);
            debug!("copied up inode {} into layer {}", source.ino, layer.id);
        }
        Ok(inode)
    }

    /// Allocate a brand new inode in `layer`
    pub(crate) fn alloc_inode(
        &self,
        layer: &Arc<Layer>,
        kind: FileType,
        perms: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
        parent: InodeNumber,
    ) -> Arc<Inode> {
        let ino = self.next_inode.fetch_add(1, Ordering::SeqCst);
        let inode = Inode::new(ino, layer.id, kind, perms, uid, gid, rdev, parent);
        let inserted = layer.icache.insert_or_existing(inode);
        debug_assert_eq!(inserted.ino, ino);
        self.inode_count.fetch_add(1, Ordering::Relaxed);
        layer.mark_dirty();
        inserted
    }
}

/// Dirty flags to raise on a clone so its borrowed bodies reach disk
fn shared_flags_for(body: &Body) -> InodeFlags {
    match body {
        Body::Regular { .. } => InodeFlags::SHARED | InodeFlags::BMAP_DIRTY,
        Body::Directory(_) => InodeFlags::SHARED | InodeFlags::DIR_DIRTY,
        Body::Symlink(_) => InodeFlags::SHARED,
        Body::Special => InodeFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_holds_one_copy_per_number() {
        let cache = InodeCache::new();
        let a = Inode::new(10, 0, FileType::Regular, 0o644, 0, 0, 0, 2);
        let b = Inode::new(10, 0, FileType::Regular, 0o600, 0, 0, 0, 2);

        let first = cache.insert_or_existing(a);
        let second = cache.insert_or_existing(b);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.count(), 1);

        // Colliding bucket, different number.
        let c = Inode::new(10 + ICACHE_BUCKETS as u64, 0, FileType::Regular, 0o644, 0, 0, 0, 2);
        cache.insert_or_existing(c);
        assert_eq!(cache.count(), 2);
        assert!(cache.lookup(10).is_some());
        assert!(cache.lookup(10 + ICACHE_BUCKETS as u64).is_some());
        assert!(cache.lookup(11).is_none());
    }

    #[test]
    fn materialize_body_is_idempotent() {
        let parent_dir = Arc::new({
            let mut d = DirBody::new();
            d.insert("etc", 5, FileType::Directory).unwrap();
            d
        });
        let inode = Inode::new(7, 1, FileType::Directory, 0o755, 0, 0, 0, 2);
        {
            let mut inner = inode.write();
            inner.body = Body::Directory(parent_dir.clone());
            inner.flags |= InodeFlags::SHARED | InodeFlags::CLONED;
            inner.materialize_body();
            assert!(!inner.flags.contains(InodeFlags::SHARED));

            // Private copy now; mutating it leaves the original alone.
            if let Body::Directory(dir) = &mut inner.body {
                assert!(!Arc::ptr_eq(dir, &parent_dir));
                Arc::get_mut(dir).unwrap().remove("etc").unwrap();
            }
            inner.materialize_body();
        }
        assert_eq!(parent_dir.len(), 1);
    }

    #[test]
    fn materialized_clone_map_marks_blocks_inherited() {
        let inode = Inode::new(9, 1, FileType::Regular, 0o644, 0, 0, 0, 2);
        let mut inner = inode.write();
        inner.body = Body::Regular {
            map: Arc::new(BlockMap::Contig(Extent::new(100, 4))),
            dirty: BTreeMap::new(),
        };
        inner.flags |= InodeFlags::SHARED | InodeFlags::CLONED;
        inner.materialize_body();

        if let Body::Regular { map, .. } = &mut inner.body {
            let owned = Arc::get_mut(map).unwrap();
            // Overwriting an inherited block must free nothing.
            assert_eq!(owned.insert(2, 500), None);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn disk_round_trip_keeps_stat_fields() {
        let inode = Inode::new(42, 0, FileType::Regular, 0o640, 1000, 100, 0, 2);
        let mut inner = inode.write();
        inner.size = 12345;
        let d = inner.to_disk(42);
        assert_eq!(d.ino, 42);
        assert_eq!(d.size, 12345);
        assert_eq!(crate::disk::kind_from_mode(d.mode), Some((FileType::Regular, 0o640)));
        assert_eq!(d.nlink, 1);
    }
}
