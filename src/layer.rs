//! Layers and their lifecycle
//!
//! A layer is a named view of the filesystem composed of its own inodes
//! over a parent layer's inodes. Layers form a tree through parent ids kept
//! in an arena; a layer that gains a child is frozen, so parent-chain reads
//! never race with writers. Committing a layer persists its dirty inodes,
//! their overflow chains and the layer's inode-block index, then rewrites
//! the global tail: free-extent chain, layer table and superblock.

use crate::balloc::AllocPools;
use crate::bmap::BlockMap;
use crate::buffer::{PageState, WriteCluster};
use crate::dir::DirBody;
use crate::disk::{
    self, link_chain, read_struct, write_struct, ChainHeader, ChainWriter, DiskBmapRecord,
    DiskExtent, DiskInode, DiskLayerRecord, DiskSuper, CHAIN_HEADER_SIZE, LAYER_FLAG_SNAP,
    LAYER_NAME_MAX, SUPERBLOCK_BLOCK,
};
use crate::extent::Extent;
use crate::fs::Lcfs;
use crate::inode::{Body, Inode, InodeCache, InodeFlags, InodeInner};
use crate::xattr::Xattrs;
use crate::{FileType, FsError, FsResult, InodeNumber, LayerId, BLOCK_SIZE};
use bytemuck::Zeroable;
use log::{debug, info, warn};
use spin::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// One mounted layer
pub struct Layer {
    /// Layer identifier, index into the layer arena
    pub id: LayerId,
    /// Layer name, empty for the base layer
    pub name: String,
    /// Parent layer id, `None` for the base layer
    pub parent: Option<LayerId>,
    /// Root directory inode of this layer's tree
    pub root_ino: InodeNumber,
    /// This layer's inode hash
    pub icache: InodeCache,
    /// Block reservations drawn from the global pool
    pub pools: AllocPools,
    /// Pending write cluster
    pub cluster: Mutex<WriteCluster>,
    /// Blocks holding this layer's on-disk inodes
    inode_blocks: Mutex<BTreeSet<u64>>,
    /// Current on-disk index chain blocks
    index_blocks: Mutex<Vec<u64>>,
    /// Allocation hint keeping inode blocks adjacent
    last_inode_block: AtomicU64,
    /// Held shared by in-flight writers, exclusively by the freeze
    /// transition; a layer never freezes under a writer's feet
    write_barrier: RwLock<()>,
    /// Immutable snapshot, set at creation for read-only layers
    snap: AtomicBool,
    /// No writes admitted; set for snapshots and for parents of live layers
    frozen: AtomicBool,
    /// Number of direct child layers
    children: AtomicU32,
    /// Something changed since the last commit
    dirty: AtomicBool,
}

impl Layer {
    /// Create an empty in-memory layer
    pub fn new(
        id: LayerId,
        name: String,
        parent: Option<LayerId>,
        root_ino: InodeNumber,
        snap: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            parent,
            root_ino,
            icache: InodeCache::new(),
            pools: AllocPools::new(),
            cluster: Mutex::new(WriteCluster::new()),
            inode_blocks: Mutex::new(BTreeSet::new()),
            index_blocks: Mutex::new(Vec::new()),
            last_inode_block: AtomicU64::new(0),
            write_barrier: RwLock::new(()),
            snap: AtomicBool::new(snap),
            frozen: AtomicBool::new(snap),
            children: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    /// True when no modification may touch this layer
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// True when the layer was created as a read-only snapshot
    pub fn is_snap(&self) -> bool {
        self.snap.load(Ordering::Acquire)
    }

    /// Enter the layer as a writer.
    ///
    /// The guard must be held for the whole mutating operation, through the
    /// inode write-lock acquisitions it performs. [`Layer::freeze`] takes
    /// the same barrier exclusively, so a writer that passed the frozen
    /// check is waited out before the layer snapshots, and a writer
    /// arriving afterwards observes the flag and is turned away.
    pub fn begin_write(&self) -> FsResult<RwLockReadGuard<'_, ()>> {
        let guard = self.write_barrier.read();
        if self.is_frozen() {
            return Err(FsError::ReadOnly);
        }
        Ok(guard)
    }

    /// Freeze the layer, draining in-flight writers first. Callers hold
    /// the layer-table lock so freezes do not race each other.
    pub fn freeze(&self) {
        let _barrier = self.write_barrier.write();
        self.frozen.store(true, Ordering::Release);
    }

    fn thaw(&self) {
        if !self.is_snap() {
            self.frozen.store(false, Ordering::Release);
        }
    }

    /// Record a modification since the last commit
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// True when a commit has work to do
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    fn add_child(&self) {
        self.children.fetch_add(1, Ordering::AcqRel);
        self.freeze();
    }

    fn remove_child(&self) {
        if self.children.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.thaw();
        }
    }

    /// Number of direct children
    pub fn child_count(&self) -> u32 {
        self.children.load(Ordering::Acquire)
    }

    /// Register the block carrying an inode of this layer
    pub fn register_inode_block(&self, block: u64) {
        self.inode_blocks.lock().insert(block);
        self.last_inode_block.store(block, Ordering::Relaxed);
    }

    /// First block of the on-disk index chain, 0 when none
    pub fn index_head(&self) -> u64 {
        self.index_blocks.lock().first().copied().unwrap_or(0)
    }

    /// Allocation hint for the next inode block
    pub fn inode_block_hint(&self) -> u64 {
        let hint = self.last_inode_block.load(Ordering::Relaxed);
        if hint == 0 {
            0
        } else {
            hint + 1
        }
    }

    /// Inode and index blocks this layer references on disk
    pub fn meta_block_count(&self) -> u64 {
        self.inode_blocks.lock().len() as u64 + self.index_blocks.lock().len() as u64
    }
}

/// Per-layer statistics returned by the stat-layer ioctl
#[derive(Debug, Clone)]
pub struct LayerStat {
    /// Layer name
    pub name: String,
    /// Layer id
    pub id: LayerId,
    /// Parent layer id
    pub parent: Option<LayerId>,
    /// Root directory inode
    pub root_ino: InodeNumber,
    /// Layer is a read-only snapshot
    pub snapshot: bool,
    /// Layer rejects writes
    pub frozen: bool,
    /// Direct children
    pub children: u32,
    /// Inodes in the layer's hash
    pub inodes_cached: u64,
    /// Blocks reserved in the layer's pools
    pub reserved_blocks: u64,
}

// ============================================================================
// Layer arena
// ============================================================================

/// Arena of mounted layers keyed by id
pub struct LayerSet {
    slots: RwLock<Vec<Option<Arc<Layer>>>>,
    /// Serializes layer creation, removal, commit and the global tail write
    pub(crate) lock: Mutex<()>,
}

impl LayerSet {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            lock: Mutex::new(()),
        }
    }

    /// Layer by id
    pub fn get(&self, id: LayerId) -> FsResult<Arc<Layer>> {
        self.slots
            .read()
            .get(id as usize)
            .and_then(|s| s.clone())
            .ok_or(FsError::Invalid)
    }

    /// Layer by name; the empty name is the base layer
    pub fn by_name(&self, name: &str) -> Option<Arc<Layer>> {
        if name.is_empty() {
            return self.get(0).ok();
        }
        self.slots
            .read()
            .iter()
            .flatten()
            .find(|l| l.name == name)
            .cloned()
    }

    /// Lowest free slot id
    pub fn next_id(&self) -> LayerId {
        let slots = self.slots.read();
        slots
            .iter()
            .position(|s| s.is_none())
            .unwrap_or(slots.len()) as LayerId
    }

    /// Install a layer at its id
    pub fn insert(&self, layer: Arc<Layer>) {
        let mut slots = self.slots.write();
        let idx = layer.id as usize;
        if idx >= slots.len() {
            slots.resize(idx + 1, None);
        }
        slots[idx] = Some(layer);
    }

    /// Drop a layer from the arena
    pub fn remove(&self, id: LayerId) -> Option<Arc<Layer>> {
        self.slots.write().get_mut(id as usize)?.take()
    }

    /// Every mounted layer in id order
    pub fn all(&self) -> Vec<Arc<Layer>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// Number of mounted layers
    pub fn count(&self) -> u32 {
        self.slots.read().iter().flatten().count() as u32
    }
}

impl Default for LayerSet {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Layer lifecycle
// ============================================================================

impl Lcfs {
    /// Create a layer on top of `parent_name` (empty or absent selects the
    /// base layer). The parent is frozen and committed; `readonly` marks
    /// the new layer as an immutable snapshot.
    pub fn create_layer(
        &self,
        name: &str,
        parent_name: Option<&str>,
        readonly: bool,
    ) -> FsResult<LayerId> {
        self.check_entry()?;
        if name.is_empty() || name.len() > LAYER_NAME_MAX || name.contains('/') {
            return Err(FsError::Invalid);
        }
        let _guard = self.layers.lock.lock();
        if self.layers.by_name(name).is_some() {
            return Err(FsError::Exists);
        }
        let parent = match parent_name {
            Some(p) => self.layers.by_name(p).ok_or(FsError::NotFound)?,
            None => self.layers.get(0)?,
        };

        // Freeze first so no new writer enters the parent, then commit so
        // the child snapshots the parent's final state.
        parent.add_child();
        if let Err(e) = self.commit_internal(&parent) {
            parent.remove_child();
            return Err(e);
        }

        let id = self.layers.next_id();
        let layer = Layer::new(id, name.to_string(), Some(parent.id), parent.root_ino, readonly);
        self.layers.insert(layer);
        self.write_global_tail()?;
        info!("created layer {name:?} (id {id}) over layer {}", parent.id);
        Ok(id)
    }

    /// Commit a layer by name
    pub fn commit_layer(&self, name: &str) -> FsResult<()> {
        self.check_entry()?;
        let layer = self.layers.by_name(name).ok_or(FsError::NotFound)?;
        let _guard = self.layers.lock.lock();
        self.commit_internal(&layer)?;
        self.write_global_tail()
    }

    /// Remove a layer by name. The layer must have no children; nothing is
    /// flushed, every block it owns returns to the global pool.
    pub fn remove_layer(&self, name: &str) -> FsResult<()> {
        self.check_entry()?;
        if name.is_empty() {
            return Err(FsError::Invalid);
        }
        let _guard = self.layers.lock.lock();
        let layer = self.layers.by_name(name).ok_or(FsError::NotFound)?;
        if layer.id == 0 {
            return Err(FsError::Invalid);
        }
        if layer.child_count() > 0 {
            return Err(FsError::NotEmpty);
        }
        self.layers.remove(layer.id);

        for inode in layer.icache.all() {
            let mut inner = inode.write();
            self.release_inode_storage(None, &mut inner);
            self.inode_count.fetch_sub(1, Ordering::Relaxed);
        }
        for block in layer.inode_blocks.lock().iter() {
            self.alloc.free(None, Extent::new(*block, 1), true);
        }
        for block in layer.index_blocks.lock().iter() {
            self.alloc.free(None, Extent::new(*block, 1), true);
        }
        self.alloc.release_pools(&layer.pools);
        self.cache.invalidate_layer(layer.id);

        if let Some(pid) = layer.parent {
            if let Ok(parent) = self.layers.get(pid) {
                parent.remove_child();
            }
        }
        self.write_global_tail()?;
        info!("removed layer {name:?} (id {})", layer.id);
        Ok(())
    }

    /// Per-layer statistics
    pub fn stat_layer(&self, name: &str) -> FsResult<LayerStat> {
        self.check_entry()?;
        let layer = self.layers.by_name(name).ok_or(FsError::NotFound)?;
        Ok(LayerStat {
            name: layer.name.clone(),
            id: layer.id,
            parent: layer.parent,
            root_ino: layer.root_ino,
            snapshot: layer.is_snap(),
            frozen: layer.is_frozen(),
            children: layer.child_count(),
            inodes_cached: layer.icache.count() as u64,
            reserved_blocks: layer.pools.reserved_blocks(),
        })
    }

    /// Commit every layer and rewrite the global tail
    pub fn sync_all(&self) -> FsResult<()> {
        let _guard = self.layers.lock.lock();
        for layer in self.layers.all() {
            self.commit_internal(&layer)?;
        }
        self.write_global_tail()
    }

    /// Free the blocks an inode owns. `pools` of `None` routes them
    /// straight to the global pool (layer teardown).
    pub(crate) fn release_inode_storage(
        &self,
        pools: Option<&AllocPools>,
        inner: &mut InodeInner,
    ) {
        let cloned = inner.flags.contains(InodeFlags::CLONED);
        if let Body::Regular { map, dirty } = &mut inner.body {
            for ext in map.owned_extents(cloned) {
                self.alloc.free(pools, ext, false);
            }
            *map = Arc::new(BlockMap::Empty);
            dirty.clear();
            inner.flags.remove(InodeFlags::SHARED);
        }
        for block in inner
            .bmap_chain
            .drain(..)
            .chain(inner.dir_chain.drain(..))
            .chain(inner.xattr_chain.drain(..))
        {
            self.alloc.free(pools, Extent::new(block, 1), true);
        }
    }
}

// ============================================================================
// Commit
// ============================================================================

impl Lcfs {
    /// Flush a layer's dirty inodes, drain its cluster and rewrite its
    /// index chain. Caller holds the layer-table lock. Idempotent.
    pub(crate) fn commit_internal(&self, layer: &Arc<Layer>) -> FsResult<()> {
        if !layer.take_dirty() {
            return Ok(());
        }
        let result = self.commit_layer_body(layer);
        if result.is_err() {
            layer.mark_dirty();
        }
        result
    }

    fn commit_layer_body(&self, layer: &Arc<Layer>) -> FsResult<()> {
        debug!("committing layer {} ({:?})", layer.id, layer.name);
        for inode in layer.icache.all() {
            self.flush_inode(layer, &inode)?;
        }

        // Rewrite the inode-block index chain from scratch.
        let old: Vec<u64> = std::mem::take(&mut *layer.index_blocks.lock());
        for block in old {
            self.alloc.free(Some(&layer.pools), Extent::new(block, 1), true);
        }
        let mut writer = ChainWriter::records();
        for block in layer.inode_blocks.lock().iter() {
            writer.push(&block.to_ne_bytes());
        }
        let blocks = self.write_chain(layer, writer.finish())?;
        *layer.index_blocks.lock() = blocks;

        self.cache.drain(layer.id, &layer.cluster)?;
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Persist one inode: data pages, xattrs, body chains, then the inode
    /// block itself.
    pub(crate) fn flush_inode(&self, layer: &Arc<Layer>, inode: &Arc<Inode>) -> FsResult<()> {
        let mut inner = inode.write();
        if inner.flags.contains(InodeFlags::REMOVED) {
            return self.flush_removed(layer, inode, &mut inner);
        }
        let has_dirty_pages =
            matches!(&inner.body, Body::Regular { dirty, .. } if !dirty.is_empty());
        if !has_dirty_pages
            && !inner.flags.intersects(
                InodeFlags::DIRTY
                    | InodeFlags::BMAP_DIRTY
                    | InodeFlags::DIR_DIRTY
                    | InodeFlags::XATTR_DIRTY,
            )
        {
            return Ok(());
        }

        if has_dirty_pages {
            self.flush_file_pages(layer, &mut inner)?;
        }

        if inner.flags.contains(InodeFlags::XATTR_DIRTY) {
            let old = std::mem::take(&mut inner.xattr_chain);
            for block in old {
                self.alloc.free(Some(&layer.pools), Extent::new(block, 1), true);
            }
            if !inner.xattrs.is_empty() {
                let mut writer = ChainWriter::packed();
                inner.xattrs.encode(&mut writer);
                inner.xattr_chain = self.write_chain(layer, writer.finish())?;
            }
            inner.flags.remove(InodeFlags::XATTR_DIRTY);
        }

        if inner.flags.contains(InodeFlags::DIR_DIRTY) {
            let old = std::mem::take(&mut inner.dir_chain);
            for block in old {
                self.alloc.free(Some(&layer.pools), Extent::new(block, 1), true);
            }
            let dir = inner.dir()?.clone();
            if !dir.is_empty() {
                let mut writer = ChainWriter::packed();
                dir.encode(&mut writer);
                inner.dir_chain = self.write_chain(layer, writer.finish())?;
            }
            inner.flags.remove(InodeFlags::DIR_DIRTY);
        }

        if inner.flags.contains(InodeFlags::BMAP_DIRTY) {
            let old = std::mem::take(&mut inner.bmap_chain);
            for block in old {
                self.alloc.free(Some(&layer.pools), Extent::new(block, 1), true);
            }
            let records = match &inner.body {
                Body::Regular { map, .. } => map.encode(),
                _ => Vec::new(),
            };
            if !records.is_empty() {
                let mut writer = ChainWriter::records();
                for rec in &records {
                    writer.push(bytemuck::bytes_of(rec));
                }
                inner.bmap_chain = self.write_chain(layer, writer.finish())?;
            }
            inner.flags.remove(InodeFlags::BMAP_DIRTY);
        }

        self.write_inode_block(layer, inode, &mut inner)?;
        inner.flags.remove(InodeFlags::DIRTY);
        Ok(())
    }

    fn flush_removed(
        &self,
        layer: &Arc<Layer>,
        inode: &Arc<Inode>,
        inner: &mut InodeInner,
    ) -> FsResult<()> {
        let exists_below =
            inner.flags.contains(InodeFlags::ON_DISK) || inner.flags.contains(InodeFlags::CLONED);
        if !exists_below {
            // Created and deleted without ever reaching disk: just drop it.
            layer.icache.remove(inode.ino);
            self.inode_count.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }
        if inner.flags.contains(InodeFlags::DIRTY) {
            // mode 0 keeps hiding the lower copy across a remount.
            let mut buf = disk::zeroed_block();
            let mut tomb = DiskInode::zeroed();
            tomb.ino = inode.ino;
            write_struct(&mut buf, 0, &tomb);
            let state = if inner.disk_block == 0 {
                let ext =
                    self.alloc
                        .alloc_near(&layer.pools, layer.inode_block_hint(), 1, true)?;
                inner.disk_block = ext.start;
                layer.register_inode_block(ext.start);
                PageState::DirtyNew
            } else {
                PageState::DirtyUpdated
            };
            self.cache
                .stage(layer.id, &layer.cluster, inner.disk_block, buf, state)?;
            inner.flags.insert(InodeFlags::ON_DISK);
            inner.flags.remove(InodeFlags::DIRTY);
        }
        Ok(())
    }

    fn write_inode_block(
        &self,
        layer: &Arc<Layer>,
        inode: &Arc<Inode>,
        inner: &mut InodeInner,
    ) -> FsResult<()> {
        let mut d = inner.to_disk(inode.ino);
        d.bmap_head = inner.bmap_chain.first().copied().unwrap_or(0);
        d.dir_head = inner.dir_chain.first().copied().unwrap_or(0);
        d.xattr_head = inner.xattr_chain.first().copied().unwrap_or(0);

        let mut buf = disk::zeroed_block();
        write_struct(&mut buf, 0, &d);
        if let Body::Symlink(target) = &inner.body {
            let bytes = target.as_bytes();
            let off = disk::INODE_TARGET_OFFSET;
            buf[off..off + bytes.len()].copy_from_slice(bytes);
        }

        let state = if inner.disk_block == 0 {
            let ext = self
                .alloc
                .alloc_near(&layer.pools, layer.inode_block_hint(), 1, true)?;
            inner.disk_block = ext.start;
            layer.register_inode_block(ext.start);
            inner.flags.insert(InodeFlags::ON_DISK);
            PageState::DirtyNew
        } else {
            PageState::DirtyUpdated
        };
        self.cache
            .stage(layer.id, &layer.cluster, inner.disk_block, buf, state)
    }

    /// Allocate blocks for a chain, link it and stage the pages. Returns
    /// the chain's block numbers in order.
    fn write_chain(&self, layer: &Arc<Layer>, mut payloads: Vec<Vec<u8>>) -> FsResult<Vec<u64>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let mut blocks = Vec::with_capacity(payloads.len());
        let mut hint = 0;
        for _ in 0..payloads.len() {
            let ext = self.alloc.alloc_near(&layer.pools, hint, 1, true)?;
            blocks.push(ext.start);
            hint = ext.end();
        }
        link_chain(&mut payloads, &blocks);
        for (block, payload) in blocks.iter().zip(payloads) {
            self.cache
                .stage(layer.id, &layer.cluster, *block, payload, PageState::DirtyNew)?;
        }
        Ok(blocks)
    }

    /// Place dirty file pages on disk, choosing between the contiguous and
    /// sparse map representations.
    fn flush_file_pages(&self, layer: &Arc<Layer>, inner: &mut InodeInner) -> FsResult<()> {
        let cloned = inner.flags.contains(InodeFlags::CLONED);
        let shared = inner.flags.contains(InodeFlags::SHARED);
        let (map_arc, pages) = match &mut inner.body {
            Body::Regular { map, dirty } => (map, std::mem::take(dirty)),
            _ => return Ok(()),
        };
        if pages.is_empty() {
            return Ok(());
        }

        let logicals: Vec<u64> = pages.keys().copied().collect();
        let prefix_run = logicals.iter().enumerate().all(|(i, &l)| l == i as u64);

        if matches!(**map_arc, BlockMap::Empty) && prefix_run {
            // Fresh file written front to back: keep the compact form with
            // one contiguous allocation.
            let count = logicals.len() as u64;
            let ext = self.alloc.alloc_exact(&layer.pools, count, false, true)?;
            for (i, (_, page)) in pages.into_iter().enumerate() {
                self.cache.stage(
                    layer.id,
                    &layer.cluster,
                    ext.start + i as u64,
                    page,
                    PageState::DirtyNew,
                )?;
            }
            *map_arc = Arc::new(BlockMap::Contig(ext));
            inner.flags.insert(InodeFlags::DIRTY);
            return Ok(());
        }

        if let BlockMap::Contig(ext) = **map_arc {
            if !cloned && logicals.iter().all(|&l| l < ext.len) {
                // Overwrite inside an extent this layer owns: in place.
                for (logical, page) in pages {
                    self.cache.stage(
                        layer.id,
                        &layer.cluster,
                        ext.start + logical,
                        page,
                        PageState::DirtyUpdated,
                    )?;
                }
                inner.flags.insert(InodeFlags::DIRTY);
                return Ok(());
            }
            if !cloned && prefix_run_from(&logicals, ext.len) {
                // Pure append: try to grow the extent in place.
                let want = logicals.len() as u64;
                if let Ok(got) = self.alloc.alloc_near(&layer.pools, ext.end(), want, false) {
                    if got.start == ext.end() && got.len == want {
                        for (i, (_, page)) in pages.into_iter().enumerate() {
                            self.cache.stage(
                                layer.id,
                                &layer.cluster,
                                got.start + i as u64,
                                page,
                                PageState::DirtyNew,
                            )?;
                        }
                        *map_arc =
                            Arc::new(BlockMap::Contig(Extent::new(ext.start, ext.len + want)));
                        inner.flags.insert(InodeFlags::DIRTY);
                        return Ok(());
                    }
                    // Not adjacent after all; the run goes back to the pool
                    // and the file converts to the sparse form.
                    self.alloc.free(Some(&layer.pools), got, false);
                }
            }
        }

        // Sparse path. A borrowed map is deep-copied first with every
        // pre-existing block marked inherited.
        if shared {
            let mut owned = (**map_arc).clone();
            owned.to_sparse(true);
            owned.mark_all_inherited();
            *map_arc = Arc::new(owned);
        } else {
            Arc::make_mut(map_arc).to_sparse(cloned);
        }
        let map = Arc::make_mut(map_arc);
        let mut hint = 0u64;
        for (logical, page) in pages {
            let ext = self.alloc.alloc_near(&layer.pools, hint, 1, false)?;
            if let Some(old) = map.insert(logical, ext.start) {
                self.alloc
                    .free(Some(&layer.pools), Extent::new(old, 1), false);
            }
            self.cache
                .stage(layer.id, &layer.cluster, ext.start, page, PageState::DirtyNew)?;
            hint = ext.end();
        }
        inner.flags.remove(InodeFlags::SHARED);
        inner.flags.insert(InodeFlags::DIRTY | InodeFlags::BMAP_DIRTY);
        Ok(())
    }
}

fn prefix_run_from(logicals: &[u64], start: u64) -> bool {
    logicals.iter().enumerate().all(|(i, &l)| l == start + i as u64)
}

// ============================================================================
// Global tail: free chain, layer table, superblock
// ============================================================================

impl Lcfs {
    /// Rewrite the free-extent chain, the layer table and the superblock.
    /// Caller holds the layer-table lock.
    pub(crate) fn write_global_tail(&self) -> FsResult<()> {
        let mut chains = self.sb_chains.lock();

        // Old chain blocks rejoin the free pool before it is serialized.
        let free_blocks: Vec<u64> = chains.free.drain(..).collect();
        let layer_blocks: Vec<u64> = chains.layers.drain(..).collect();
        for block in free_blocks.into_iter().chain(layer_blocks.into_iter()) {
            self.alloc.free(None, Extent::new(block, 1), true);
        }

        // Layer table, parents before children.
        let mut layers = self.layers.all();
        layers.sort_by_key(|l| self.layer_depth(l));
        let mut writer = ChainWriter::records();
        for layer in &layers {
            let mut name = [0u8; LAYER_NAME_MAX];
            let bytes = layer.name.as_bytes();
            name[..bytes.len()].copy_from_slice(bytes);
            let record = DiskLayerRecord {
                id: layer.id,
                parent: layer.parent.map(|p| p as i32).unwrap_or(-1),
                flags: if layer.is_snap() { LAYER_FLAG_SNAP } else { 0 },
                pad: 0,
                root_ino: layer.root_ino,
                index_head: layer.index_head(),
                name,
            };
            writer.push(bytemuck::bytes_of(&record));
        }
        let mut layer_payloads = writer.finish();
        let layer_blocks = self.alloc_global_chain(layer_payloads.len())?;

        // Free-extent chain. Its blocks leave the pool before the snapshot
        // is taken so the serialized extents are exact; single-block takes
        // never grow the extent count, the estimate stays an upper bound.
        let estimate = chain_blocks_for(self.alloc.snapshot().len());
        let mut free_blocks = self.alloc_global_chain(estimate)?;
        let extents = self.alloc.snapshot();
        let mut writer = ChainWriter::records();
        for ext in &extents {
            let record = DiskExtent {
                start: ext.start,
                len: ext.len,
            };
            writer.push(bytemuck::bytes_of(&record));
        }
        let mut free_payloads = writer.finish();
        while free_blocks.len() > free_payloads.len() {
            // Overshoot; the surplus block is free again in memory and will
            // be serialized at the next tail write.
            let surplus = free_blocks.pop().unwrap();
            self.alloc.free(None, Extent::new(surplus, 1), true);
        }

        self.write_chain_direct(&mut free_payloads, &free_blocks)?;
        self.write_chain_direct(&mut layer_payloads, &layer_blocks)?;

        let mut sb = DiskSuper {
            magic: disk::SUPER_MAGIC,
            version: disk::LAYOUT_VERSION,
            checksum: 0,
            flags: 0,
            block_count: self.dev.block_count(),
            next_inode: self.next_inode.load(Ordering::SeqCst),
            inode_count: self.inode_count.load(Ordering::Relaxed),
            snapshot_root: self.snapshot_root,
            free_head: free_blocks.first().copied().unwrap_or(0),
            layer_head: layer_blocks.first().copied().unwrap_or(0),
            layer_count: layers.len() as u32,
            pad: 0,
        };
        sb.checksum = disk::super_checksum(&sb);
        let mut buf = disk::zeroed_block();
        write_struct(&mut buf, 0, &sb);
        self.dev.write_block(SUPERBLOCK_BLOCK, &buf)?;

        chains.free = free_blocks;
        chains.layers = layer_blocks;
        Ok(())
    }

    fn alloc_global_chain(&self, count: usize) -> FsResult<Vec<u64>> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            match self.alloc.alloc_global_single() {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    for block in blocks {
                        self.alloc.free(None, Extent::new(block, 1), true);
                    }
                    return Err(e);
                }
            }
        }
        Ok(blocks)
    }

    fn write_chain_direct(&self, payloads: &mut [Vec<u8>], blocks: &[u64]) -> FsResult<()> {
        link_chain(payloads, blocks);
        for (block, payload) in blocks.iter().zip(payloads.iter()) {
            self.dev.write_block(*block, payload)?;
        }
        Ok(())
    }

    pub(crate) fn layer_depth(&self, layer: &Arc<Layer>) -> u32 {
        let mut depth = 0;
        let mut current = layer.parent;
        while let Some(pid) = current {
            depth += 1;
            current = self.layers.get(pid).ok().and_then(|l| l.parent);
        }
        depth
    }
}

/// Chain blocks needed for `records` free-extent records
fn chain_blocks_for(records: usize) -> usize {
    if records == 0 {
        0
    } else {
        (records + disk::EXTENT_RECORDS_PER_BLOCK - 1) / disk::EXTENT_RECORDS_PER_BLOCK
    }
}

// ============================================================================
// Mount-time loading
// ============================================================================

impl Lcfs {
    /// Rebuild the layer table and inode caches from the superblock's
    /// chains. Layer-chain inconsistencies are fatal; corrupt inode slots
    /// are logged and skipped.
    pub(crate) fn load_from_disk(&self, sb: &DiskSuper) -> FsResult<()> {
        let free_chain = self.read_chain_raw(0, sb.free_head)?;
        for (_, payload) in &free_chain {
            let header: ChainHeader = read_struct(payload)?;
            for i in 0..header.count as usize {
                let off = CHAIN_HEADER_SIZE + i * core::mem::size_of::<DiskExtent>();
                let rec: DiskExtent = read_struct(&payload[off..])?;
                self.alloc.seed(Extent::new(rec.start, rec.len));
            }
        }

        // Layer table, records are ordered parents first.
        let layer_chain = self.read_chain_raw(0, sb.layer_head)?;
        let mut loaded = 0u32;
        for (_, payload) in &layer_chain {
            let header: ChainHeader = read_struct(payload)?;
            for i in 0..header.count as usize {
                let off = CHAIN_HEADER_SIZE + i * core::mem::size_of::<DiskLayerRecord>();
                let rec: DiskLayerRecord = read_struct(&payload[off..])?;
                self.load_layer(&rec)?;
                loaded += 1;
            }
        }
        if loaded != sb.layer_count {
            warn!(
                "layer table holds {loaded} records, superblock says {}",
                sb.layer_count
            );
        }

        let mut chains = self.sb_chains.lock();
        chains.free = free_chain.iter().map(|(b, _)| *b).collect();
        chains.layers = layer_chain.iter().map(|(b, _)| *b).collect();
        Ok(())
    }

    fn load_layer(&self, rec: &DiskLayerRecord) -> FsResult<()> {
        let parent = if rec.parent < 0 {
            None
        } else {
            Some(rec.parent as LayerId)
        };
        if let Some(pid) = parent {
            // Parents precede children in the table; a dangling id means
            // the chain is inconsistent, which is fatal at mount.
            self.layers.get(pid).map_err(|_| FsError::Corrupt)?;
        }
        let name = {
            let end = rec.name.iter().position(|&b| b == 0).unwrap_or(LAYER_NAME_MAX);
            String::from_utf8(rec.name[..end].to_vec()).map_err(|_| FsError::Corrupt)?
        };
        let layer = Layer::new(
            rec.id,
            name,
            parent,
            rec.root_ino,
            rec.flags & LAYER_FLAG_SNAP != 0,
        );
        if let Some(pid) = parent {
            self.layers.get(pid)?.add_child();
        }

        // Visible in the arena before its inodes load; later records walk
        // the parent chain through it.
        self.layers.insert(layer.clone());

        let index_chain = self.read_chain_raw(rec.id, rec.index_head)?;
        for (_, payload) in &index_chain {
            let header: ChainHeader = read_struct(payload)?;
            for i in 0..header.count as usize {
                let off = CHAIN_HEADER_SIZE + i * 8;
                let block = u64::from_ne_bytes(
                    payload[off..off + 8].try_into().map_err(|_| FsError::Corrupt)?,
                );
                if let Err(e) = self.load_inode(&layer, block) {
                    warn!(
                        "skipping unreadable inode block {block} in layer {}: {e}",
                        rec.id
                    );
                }
            }
        }
        *layer.index_blocks.lock() = index_chain.iter().map(|(b, _)| *b).collect();
        debug!("loaded layer {} ({} inodes)", rec.id, layer.icache.count());
        Ok(())
    }

    fn load_inode(&self, layer: &Arc<Layer>, block: u64) -> FsResult<()> {
        let payload = self.cache.read_meta(layer.id, block)?;
        let d: DiskInode = read_struct(&payload)?;

        if d.mode == 0 {
            // Tombstone: the inode stays removed and keeps hiding any
            // parent copy.
            let stub = Inode::from_parts(
                d.ino,
                layer.id,
                InodeInner {
                    kind: FileType::Regular,
                    perms: 0,
                    nlink: 0,
                    uid: 0,
                    gid: 0,
                    rdev: 0,
                    size: 0,
                    atime: 0,
                    mtime: 0,
                    ctime: 0,
                    parent: 0,
                    flags: InodeFlags::REMOVED | InodeFlags::ON_DISK,
                    body: Body::Special,
                    xattrs: Arc::new(Xattrs::new()),
                    disk_block: block,
                    bmap_chain: Vec::new(),
                    dir_chain: Vec::new(),
                    xattr_chain: Vec::new(),
                },
            );
            layer.icache.insert_or_existing(stub);
            layer.register_inode_block(block);
            self.inode_count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let (kind, perms) = match disk::kind_from_mode(d.mode) {
            Some(parts) => parts,
            None => {
                warn!("inode block {block}: unknown mode {:#o}, slot skipped", d.mode);
                return Ok(());
            }
        };
        let inherited = self.ancestor_has(layer, d.ino);

        let mut bmap_chain = Vec::new();
        let mut dir_chain = Vec::new();
        let mut xattr_chain = Vec::new();

        let body = match kind {
            FileType::Regular => {
                let map = if d.extent_len > 0 {
                    BlockMap::Contig(Extent::new(d.extent_start, d.extent_len))
                } else if d.bmap_head != 0 {
                    let chain = self.read_chain_raw(layer.id, d.bmap_head)?;
                    bmap_chain = chain.iter().map(|(b, _)| *b).collect();
                    let mut records = Vec::new();
                    for (_, payload) in &chain {
                        let header: ChainHeader = read_struct(payload)?;
                        for i in 0..header.count as usize {
                            let off = CHAIN_HEADER_SIZE
                                + i * core::mem::size_of::<DiskBmapRecord>();
                            records.push(read_struct(&payload[off..])?);
                        }
                    }
                    BlockMap::from_records(&records, inherited)
                } else {
                    BlockMap::Empty
                };
                Body::Regular {
                    map: Arc::new(map),
                    dirty: BTreeMap::new(),
                }
            }
            FileType::Directory => {
                let mut dir = DirBody::new();
                if d.dir_head != 0 {
                    let chain = self.read_chain_raw(layer.id, d.dir_head)?;
                    dir_chain = chain.iter().map(|(b, _)| *b).collect();
                    for (_, payload) in &chain {
                        let header: ChainHeader = read_struct(payload)?;
                        let used = header.count as usize;
                        if CHAIN_HEADER_SIZE + used > BLOCK_SIZE {
                            return Err(FsError::Corrupt);
                        }
                        dir.parse_block(&payload[CHAIN_HEADER_SIZE..CHAIN_HEADER_SIZE + used])?;
                    }
                }
                Body::Directory(Arc::new(dir))
            }
            FileType::SymbolicLink => {
                let off = disk::INODE_TARGET_OFFSET;
                let len = d.target_len as usize;
                if off + len > BLOCK_SIZE {
                    return Err(FsError::Corrupt);
                }
                let target = std::str::from_utf8(&payload[off..off + len])
                    .map_err(|_| FsError::Corrupt)?
                    .to_string();
                Body::Symlink(Arc::new(target))
            }
            _ => Body::Special,
        };

        let mut xattrs = Xattrs::new();
        if d.xattr_head != 0 {
            let chain = self.read_chain_raw(layer.id, d.xattr_head)?;
            xattr_chain = chain.iter().map(|(b, _)| *b).collect();
            for (_, payload) in &chain {
                let header: ChainHeader = read_struct(payload)?;
                let used = header.count as usize;
                if CHAIN_HEADER_SIZE + used > BLOCK_SIZE {
                    return Err(FsError::Corrupt);
                }
                xattrs.parse_block(&payload[CHAIN_HEADER_SIZE..CHAIN_HEADER_SIZE + used])?;
            }
        }

        let mut flags = InodeFlags::ON_DISK;
        if inherited {
            flags |= InodeFlags::CLONED;
        }
        let inode = Inode::from_parts(
            d.ino,
            layer.id,
            InodeInner {
                kind,
                perms,
                nlink: d.nlink,
                uid: d.uid,
                gid: d.gid,
                rdev: d.rdev,
                size: d.size,
                atime: d.atime,
                mtime: d.mtime,
                ctime: d.ctime,
                parent: d.parent,
                flags,
                body,
                xattrs: Arc::new(xattrs),
                disk_block: block,
                bmap_chain,
                dir_chain,
                xattr_chain,
            },
        );
        layer.icache.insert_or_existing(inode);
        layer.register_inode_block(block);
        self.inode_count.fetch_add(1, Ordering::Relaxed);

        if d.ino >= self.next_inode.load(Ordering::SeqCst) {
            // Counter recovery: never hand out a number that exists.
            self.next_inode.store(d.ino + 1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn ancestor_has(&self, layer: &Arc<Layer>, ino: InodeNumber) -> bool {
        let mut current = layer.parent;
        while let Some(pid) = current {
            match self.layers.get(pid) {
                Ok(parent) => {
                    if parent.icache.lookup(ino).is_some() {
                        return true;
                    }
                    current = parent.parent;
                }
                Err(_) => return false,
            }
        }
        false
    }

    /// Read a metadata chain, returning `(block, payload)` pairs in order
    pub(crate) fn read_chain_raw(
        &self,
        layer: LayerId,
        head: u64,
    ) -> FsResult<Vec<(u64, Arc<Vec<u8>>)>> {
        let mut out = Vec::new();
        let mut block = head;
        let limit = self.dev.block_count();
        while block != 0 {
            if out.len() as u64 > limit {
                return Err(FsError::Corrupt);
            }
            let payload = self.cache.read_meta(layer, block)?;
            let header: ChainHeader = read_struct(&payload)?;
            let next = header.next;
            out.push((block, payload));
            block = next;
        }
        Ok(out)
    }
}
