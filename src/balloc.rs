//! Block allocation
//!
//! A single global free pool feeds per-layer reservations. Each layer keeps
//! two local pools, one for metadata blocks and one for file data, so that
//! most allocations complete without touching the global lock. Pools pull
//! whole slabs ([`crate::SLAB_BLOCKS`]) from the global pool and return
//! their remainder when the layer goes away.

use crate::extent::{Extent, ExtentMap};
use crate::{FsError, FsResult, SLAB_BLOCKS};
use spin::Mutex;

/// Per-layer block reservations
#[derive(Debug, Default)]
pub struct AllocPools {
    /// Reservation for metadata blocks (inodes, chains, indexes)
    pub meta: Mutex<ExtentMap>,
    /// Reservation for file data blocks
    pub data: Mutex<ExtentMap>,
}

impl AllocPools {
    /// Create empty pools
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, metadata: bool) -> &Mutex<ExtentMap> {
        if metadata {
            &self.meta
        } else {
            &self.data
        }
    }

    /// Blocks currently reserved across both pools
    pub fn reserved_blocks(&self) -> u64 {
        self.meta.lock().total_blocks() + self.data.lock().total_blocks()
    }
}

/// Global allocator state shared by all layers
#[derive(Debug)]
pub struct BlockAllocator {
    free: Mutex<ExtentMap>,
}

impl BlockAllocator {
    /// Create an allocator with an empty free pool
    pub fn new() -> Self {
        Self {
            free: Mutex::new(ExtentMap::new()),
        }
    }

    /// Seed the global free pool with one run of blocks
    pub fn seed(&self, ext: Extent) {
        self.free.lock().insert(ext);
    }

    /// Blocks in the global free pool
    pub fn free_blocks(&self) -> u64 {
        self.free.lock().total_blocks()
    }

    /// Snapshot of the global free extents, for persistence
    pub fn snapshot(&self) -> Vec<Extent> {
        self.free.lock().iter().collect()
    }

    /// Allocate `count` contiguous blocks for a layer.
    ///
    /// The layer pool is searched first. On a miss a fresh slab is pulled
    /// from the global pool and the search retried; requests larger than a
    /// slab, or with `contiguous` set, also fall through to the global pool
    /// directly so one unbroken run can be served.
    pub fn alloc_exact(
        &self,
        pools: &AllocPools,
        count: u64,
        metadata: bool,
        contiguous: bool,
    ) -> FsResult<Extent> {
        if count == 0 {
            return Err(FsError::Invalid);
        }
        let pool = pools.pool(metadata);
        if let Some(ext) = pool.lock().remove_first_fit(count) {
            return Ok(ext);
        }

        if count >= SLAB_BLOCKS || contiguous {
            // One unbroken run straight from the global pool.
            if let Some(ext) = self.free.lock().remove_first_fit(count) {
                return Ok(ext);
            }
            return Err(FsError::NoSpace);
        }

        // Refill the layer pool with a slab and retry. A shrinking global
        // pool may only be able to hand out smaller pieces.
        let slab = {
            let mut free = self.free.lock();
            free.remove_first_fit(SLAB_BLOCKS)
                .or_else(|| free.remove_first_fit(count))
        };
        match slab {
            Some(slab) => {
                let mut pool = pool.lock();
                pool.insert(slab);
                pool.remove_first_fit(count).ok_or(FsError::NoSpace)
            }
            None => Err(FsError::NoSpace),
        }
    }

    /// Allocate preferring the run immediately following `hint`, to keep a
    /// file's blocks adjacent. Falls back to [`Self::alloc_exact`].
    pub fn alloc_near(
        &self,
        pools: &AllocPools,
        hint: u64,
        count: u64,
        metadata: bool,
    ) -> FsResult<Extent> {
        if count == 0 {
            return Err(FsError::Invalid);
        }
        if hint != 0 {
            if let Some(ext) = pools.pool(metadata).lock().remove_adjacent(hint, count) {
                return Ok(ext);
            }
            if let Some(ext) = self.free.lock().remove_adjacent(hint, count) {
                return Ok(ext);
            }
        }
        self.alloc_exact(pools, count, metadata, false)
    }

    /// Return blocks to a layer pool, or directly to the global pool when
    /// no layer context applies (layer teardown, chain rewrites at commit).
    pub fn free(&self, pools: Option<&AllocPools>, ext: Extent, metadata: bool) {
        if ext.len == 0 {
            return;
        }
        match pools {
            Some(pools) => pools.pool(metadata).lock().insert(ext),
            None => self.free.lock().insert(ext),
        }
    }

    /// Take one block straight from the global pool, for global metadata
    /// chains that belong to no layer
    pub fn alloc_global_single(&self) -> FsResult<u64> {
        self.free
            .lock()
            .remove_first_fit(1)
            .map(|e| e.start)
            .ok_or(FsError::NoSpace)
    }

    /// Drain a layer's pools back into the global pool
    pub fn release_pools(&self, pools: &AllocPools) {
        let mut free = self.free.lock();
        for ext in pools.meta.lock().drain() {
            free.insert(ext);
        }
        for ext in pools.data.lock().drain() {
            free.insert(ext);
        }
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}
