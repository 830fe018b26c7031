//! Page cache and cluster writer
//!
//! In-memory pages staged here have two jobs: holding dirty metadata and
//! data blocks until they reach the device, and caching recently read
//! metadata blocks. Dirty pages are linked into a per-layer cluster; the
//! cluster is emitted as one large sequential write whenever the next dirty
//! block is not the immediate successor of the previous one, or when the
//! cluster reaches its cap. There is no LRU eviction in this cache, memory
//! is bounded by write-in-progress state.

use crate::device::BlockDevice;
use crate::{BlockNumber, FsResult, LayerId, BLOCK_SIZE, CLUSTER_MAX_BLOCKS};
use spin::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Page states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Page mirrors the device content
    Clean,
    /// Page targets a freshly allocated block
    DirtyNew,
    /// Page overwrites an existing block
    DirtyUpdated,
}

/// Pending cluster of a single layer.
///
/// Moves between three shapes: empty, accumulating a run of consecutive
/// blocks, and flushing. The accumulating invariant is that page `i` targets
/// block `start + i`.
#[derive(Debug, Default)]
pub struct WriteCluster {
    start: BlockNumber,
    pages: Vec<Vec<u8>>,
}

impl WriteCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn next_block(&self) -> BlockNumber {
        self.start + self.pages.len() as u64
    }
}

/// Page cache statistics
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Metadata reads served from cache
    pub hits: u64,
    /// Metadata reads that went to the device
    pub misses: u64,
    /// Pages staged for write
    pub staged: u64,
    /// Clusters emitted to the device
    pub clusters_emitted: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    staged: AtomicU64,
    clusters_emitted: AtomicU64,
}

/// Block-sized page cache over the backing device
pub struct PageCache {
    dev: Arc<dyn BlockDevice>,
    /// Clean metadata blocks by (layer, block)
    meta_cache: RwLock<BTreeMap<(LayerId, BlockNumber), Arc<Vec<u8>>>>,
    /// Staged pages not yet emitted, by (layer, block)
    pending: RwLock<BTreeMap<(LayerId, BlockNumber), Arc<Vec<u8>>>>,
    counters: CacheCounters,
}

impl PageCache {
    /// Create a cache over `dev`
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            meta_cache: RwLock::new(BTreeMap::new()),
            pending: RwLock::new(BTreeMap::new()),
            counters: CacheCounters::default(),
        }
    }

    /// The device underneath the cache
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Read a metadata block through the cache
    pub fn read_meta(&self, layer: LayerId, block: BlockNumber) -> FsResult<Arc<Vec<u8>>> {
        let key = (layer, block);
        if let Some(page) = self.pending.read().get(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page.clone());
        }
        if let Some(page) = self.meta_cache.read().get(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page.clone());
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.dev.read_block(block, &mut buf)?;
        let page = Arc::new(buf);
        self.meta_cache.write().insert(key, page.clone());
        Ok(page)
    }

    /// Read a data block. Staged-but-unwritten content is returned from the
    /// pending set; anything else comes straight from the device, data is
    /// not cached.
    pub fn read_data(&self, layer: LayerId, block: BlockNumber) -> FsResult<Arc<Vec<u8>>> {
        if let Some(page) = self.pending.read().get(&(layer, block)) {
            return Ok(page.clone());
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.dev.read_block(block, &mut buf)?;
        Ok(Arc::new(buf))
    }

    /// Stage a dirty page into the layer's cluster.
    ///
    /// Emits the pending cluster first when `block` does not continue the
    /// current run or the run has reached [`CLUSTER_MAX_BLOCKS`].
    pub fn stage(
        &self,
        layer: LayerId,
        cluster: &Mutex<WriteCluster>,
        block: BlockNumber,
        data: Vec<u8>,
        state: PageState,
    ) -> FsResult<()> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        debug_assert_ne!(state, PageState::Clean);
        self.counters.staged.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::new(data);
        self.pending.write().insert((layer, block), shared.clone());
        if state == PageState::DirtyUpdated {
            // Keep cached readers of this metadata block current.
            self.meta_cache.write().insert((layer, block), shared.clone());
        }

        let mut cl = cluster.lock();
        if !cl.is_empty() {
            if block >= cl.start && block < cl.next_block() {
                // Same block staged twice before emission, replace in place.
                let idx = (block - cl.start) as usize;
                cl.pages[idx] = shared.as_ref().clone();
                return Ok(());
            }
            if block != cl.next_block() || cl.pages.len() >= CLUSTER_MAX_BLOCKS {
                self.emit(layer, &mut cl)?;
            }
        }
        if cl.is_empty() {
            cl.start = block;
        }
        cl.pages.push(shared.as_ref().clone());
        Ok(())
    }

    /// Emit whatever the cluster holds
    pub fn drain(&self, layer: LayerId, cluster: &Mutex<WriteCluster>) -> FsResult<()> {
        let mut cl = cluster.lock();
        if cl.is_empty() {
            return Ok(());
        }
        self.emit(layer, &mut cl)
    }

    fn emit(&self, layer: LayerId, cl: &mut WriteCluster) -> FsResult<()> {
        let start = cl.start;
        let pages = std::mem::take(&mut cl.pages);
        let count = pages.len() as u64;
        self.dev.write_cluster(start, &pages)?;
        self.counters.clusters_emitted.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.pending.write();
        for block in start..start + count {
            pending.remove(&(layer, block));
        }
        Ok(())
    }

    /// Drop cached pages belonging to `layer`
    pub fn invalidate_layer(&self, layer: LayerId) {
        self.meta_cache
            .write()
            .retain(|&(l, _), _| l != layer);
        self.pending.write().retain(|&(l, _), _| l != layer);
    }

    /// Drop one cached metadata block
    pub fn invalidate(&self, layer: LayerId, block: BlockNumber) {
        self.meta_cache.write().remove(&(layer, block));
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            staged: self.counters.staged.load(Ordering::Relaxed),
            clusters_emitted: self.counters.clusters_emitted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn cache(blocks: u64) -> PageCache {
        PageCache::new(Arc::new(MemDevice::new(blocks)))
    }

    fn page(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn adjacent_pages_form_one_cluster() {
        let cache = cache(64);
        let cluster = Mutex::new(WriteCluster::new());

        for i in 0..4u64 {
            cache
                .stage(0, &cluster, 10 + i, page(i as u8), PageState::DirtyNew)
                .unwrap();
        }
        // Nothing emitted yet, the run is still open.
        assert_eq!(cache.stats().clusters_emitted, 0);

        cache.drain(0, &cluster).unwrap();
        assert_eq!(cache.stats().clusters_emitted, 1);

        let mut buf = vec![0u8; BLOCK_SIZE];
        cache.device().read_block(12, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 2));
    }

    #[test]
    fn gap_emits_previous_run() {
        let cache = cache(64);
        let cluster = Mutex::new(WriteCluster::new());

        cache.stage(0, &cluster, 10, page(1), PageState::DirtyNew).unwrap();
        cache.stage(0, &cluster, 11, page(2), PageState::DirtyNew).unwrap();
        // Block 20 is not the successor of 11.
        cache.stage(0, &cluster, 20, page(3), PageState::DirtyNew).unwrap();
        assert_eq!(cache.stats().clusters_emitted, 1);

        cache.drain(0, &cluster).unwrap();
        assert_eq!(cache.stats().clusters_emitted, 2);
    }

    #[test]
    fn cluster_cap_forces_emission() {
        let cache = cache(1024);
        let cluster = Mutex::new(WriteCluster::new());

        for i in 0..(CLUSTER_MAX_BLOCKS as u64 + 1) {
            cache
                .stage(0, &cluster, 2 + i, page(0x55), PageState::DirtyNew)
                .unwrap();
        }
        assert_eq!(cache.stats().clusters_emitted, 1);
    }

    #[test]
    fn pending_page_visible_before_emission() {
        let cache = cache(64);
        let cluster = Mutex::new(WriteCluster::new());

        cache.stage(0, &cluster, 30, page(9), PageState::DirtyNew).unwrap();
        // The device still holds zeros but readers must see the staged page.
        let data = cache.read_data(0, 30).unwrap();
        assert!(data.iter().all(|&b| b == 9));

        cache.drain(0, &cluster).unwrap();
        let data = cache.read_data(0, 30).unwrap();
        assert!(data.iter().all(|&b| b == 9));
    }

    #[test]
    fn restaging_same_block_replaces_page() {
        let cache = cache(64);
        let cluster = Mutex::new(WriteCluster::new());

        cache.stage(0, &cluster, 5, page(1), PageState::DirtyNew).unwrap();
        cache.stage(0, &cluster, 6, page(2), PageState::DirtyNew).unwrap();
        cache.stage(0, &cluster, 5, page(7), PageState::DirtyUpdated).unwrap();
        cache.drain(0, &cluster).unwrap();
        assert_eq!(cache.stats().clusters_emitted, 1);

        let mut buf = vec![0u8; BLOCK_SIZE];
        cache.device().read_block(5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn meta_reads_hit_cache() {
        let cache = cache(64);
        cache.read_meta(0, 3).unwrap();
        cache.read_meta(0, 3).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }
}
