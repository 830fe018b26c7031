//! Regular file block maps
//!
//! A freshly written file keeps the compact form, one contiguous extent.
//! The first write that would break contiguity converts the map to the
//! sparse form, a per-block mapping from logical file blocks to physical
//! device blocks. Sparse entries remember whether the physical block was
//! inherited from a parent layer during copy-up; inherited blocks are never
//! freed by this layer since the parent still references them.

use crate::disk::DiskBmapRecord;
use crate::extent::Extent;
use std::collections::BTreeMap;

/// One mapped block of the sparse form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedBlock {
    /// Physical device block
    pub physical: u64,
    /// Block belongs to a parent layer's allocation
    pub inherited: bool,
}

/// A run returned by [`BlockMap::slices`]; `physical` of `None` is a hole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSlice {
    /// First logical block of the run
    pub logical: u64,
    /// First physical block, or a hole reading as zeros
    pub physical: Option<u64>,
    /// Run length in blocks
    pub count: u64,
}

/// Logical to physical mapping of one regular file
#[derive(Debug, Clone)]
pub enum BlockMap {
    /// No blocks allocated yet
    Empty,
    /// Single contiguous run covering logical blocks `0..len`
    Contig(Extent),
    /// Per-block sparse mapping
    Sparse(BTreeMap<u64, MappedBlock>),
}

impl BlockMap {
    /// Physical block backing `logical`, if mapped
    pub fn lookup(&self, logical: u64) -> Option<u64> {
        match self {
            BlockMap::Empty => None,
            BlockMap::Contig(ext) => {
                (logical < ext.len).then(|| ext.start + logical)
            }
            BlockMap::Sparse(map) => map.get(&logical).map(|m| m.physical),
        }
    }

    /// Resolve `count` logical blocks starting at `start` into coalesced
    /// runs, reporting holes as zero-filled regions.
    pub fn slices(&self, start: u64, count: u64) -> Vec<MapSlice> {
        let mut out: Vec<MapSlice> = Vec::new();
        for logical in start..start + count {
            let physical = self.lookup(logical);
            if let Some(last) = out.last_mut() {
                let extends = match (last.physical, physical) {
                    (Some(p), Some(q)) => p + last.count == q,
                    (None, None) => true,
                    _ => false,
                };
                if extends {
                    last.count += 1;
                    continue;
                }
            }
            out.push(MapSlice {
                logical,
                physical,
                count: 1,
            });
        }
        out
    }

    /// Convert to the sparse form. Existing contiguous blocks become
    /// per-block entries marked with `inherited`. Idempotent.
    pub fn to_sparse(&mut self, inherited: bool) {
        match self {
            BlockMap::Sparse(_) => {}
            BlockMap::Empty => *self = BlockMap::Sparse(BTreeMap::new()),
            BlockMap::Contig(ext) => {
                let mut map = BTreeMap::new();
                for i in 0..ext.len {
                    map.insert(
                        i,
                        MappedBlock {
                            physical: ext.start + i,
                            inherited,
                        },
                    );
                }
                *self = BlockMap::Sparse(map);
            }
        }
    }

    /// Mark every mapping as belonging to a parent layer. Used when a
    /// borrowed sparse map is deep-copied during copy-up.
    pub fn mark_all_inherited(&mut self) {
        if let BlockMap::Sparse(map) = self {
            for m in map.values_mut() {
                m.inherited = true;
            }
        }
    }

    /// Install a mapping for `logical`. Returns the superseded physical
    /// block when this layer owned the previous mapping and must free it.
    ///
    /// The map must already be sparse.
    pub fn insert(&mut self, logical: u64, physical: u64) -> Option<u64> {
        match self {
            BlockMap::Sparse(map) => {
                let old = map.insert(
                    logical,
                    MappedBlock {
                        physical,
                        inherited: false,
                    },
                );
                old.and_then(|m| (!m.inherited).then_some(m.physical))
            }
            _ => {
                debug_assert!(false, "insert into non-sparse block map");
                None
            }
        }
    }

    /// Drop all mappings at or beyond `keep` logical blocks. Returns the
    /// physical runs this layer owned and must free; `cloned` declares who
    /// owns the contiguous form.
    pub fn truncate_blocks(&mut self, keep: u64, cloned: bool) -> Vec<Extent> {
        let mut freed = Vec::new();
        match self {
            BlockMap::Empty => {}
            BlockMap::Contig(ext) => {
                if ext.len > keep {
                    if !cloned {
                        freed.push(Extent::new(ext.start + keep, ext.len - keep));
                    }
                    ext.len = keep;
                    if ext.len == 0 {
                        *self = BlockMap::Empty;
                    }
                }
            }
            BlockMap::Sparse(map) => {
                let gone: Vec<u64> = map.range(keep..).map(|(&l, _)| l).collect();
                for logical in gone {
                    let m = map.remove(&logical).unwrap();
                    if !m.inherited {
                        push_coalesced(&mut freed, m.physical);
                    }
                }
            }
        }
        freed
    }

    /// Physical runs allocated by this layer, for teardown and accounting
    pub fn owned_extents(&self, cloned: bool) -> Vec<Extent> {
        let mut out = Vec::new();
        match self {
            BlockMap::Empty => {}
            BlockMap::Contig(ext) => {
                if !cloned && ext.len > 0 {
                    out.push(*ext);
                }
            }
            BlockMap::Sparse(map) => {
                for m in map.values() {
                    if !m.inherited {
                        push_coalesced(&mut out, m.physical);
                    }
                }
                out.sort_by_key(|e| e.start);
            }
        }
        out
    }

    /// Number of mapped blocks
    pub fn block_count(&self) -> u64 {
        match self {
            BlockMap::Empty => 0,
            BlockMap::Contig(ext) => ext.len,
            BlockMap::Sparse(map) => map.len() as u64,
        }
    }

    /// Serialize the sparse form, coalescing adjacent runs
    pub fn encode(&self) -> Vec<DiskBmapRecord> {
        let map = match self {
            BlockMap::Sparse(map) => map,
            _ => return Vec::new(),
        };
        let mut out: Vec<DiskBmapRecord> = Vec::new();
        for (&logical, m) in map {
            if let Some(last) = out.last_mut() {
                if last.logical + last.len == logical && last.physical + last.len == m.physical {
                    last.len += 1;
                    continue;
                }
            }
            out.push(DiskBmapRecord {
                logical,
                physical: m.physical,
                len: 1,
            });
        }
        out
    }

    /// Rebuild a sparse map from persisted records
    pub fn from_records(records: &[DiskBmapRecord], inherited: bool) -> Self {
        let mut map = BTreeMap::new();
        for rec in records {
            for i in 0..rec.len {
                map.insert(
                    rec.logical + i,
                    MappedBlock {
                        physical: rec.physical + i,
                        inherited,
                    },
                );
            }
        }
        BlockMap::Sparse(map)
    }
}

fn push_coalesced(out: &mut Vec<Extent>, physical: u64) {
    if let Some(last) = out.last_mut() {
        if last.end() == physical {
            last.len += 1;
            return;
        }
    }
    out.push(Extent::new(physical, 1));
}
