//! Extent arithmetic
//!
//! An extent is a contiguous run of blocks `(start, len)`. [`ExtentMap`]
//! keeps a set of disjoint extents sorted by start block, coalescing
//! adjacent runs on insert. It backs both the free-block pools of the
//! allocator and per-inode sets of metadata blocks.

use std::collections::BTreeMap;

/// A contiguous run of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First block of the run
    pub start: u64,
    /// Number of blocks
    pub len: u64,
}

impl Extent {
    /// Construct an extent
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last block
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// Sorted, disjoint, coalesced set of extents
#[derive(Debug, Default, Clone)]
pub struct ExtentMap {
    // start -> len
    map: BTreeMap<u64, u64>,
    blocks: u64,
}

impl ExtentMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Total blocks covered by all extents
    pub fn total_blocks(&self) -> u64 {
        self.blocks
    }

    /// Number of distinct extents
    pub fn extent_count(&self) -> usize {
        self.map.len()
    }

    /// True when no blocks are held
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert a run, coalescing with adjacent extents on both sides.
    ///
    /// The run must not overlap anything already present.
    pub fn insert(&mut self, ext: Extent) {
        if ext.len == 0 {
            return;
        }
        debug_assert!(!self.overlaps(ext), "overlapping extent insert");

        let mut start = ext.start;
        let mut len = ext.len;

        // Merge with a predecessor ending exactly at our start.
        if let Some((&pstart, &plen)) = self.map.range(..ext.start).next_back() {
            if pstart + plen == ext.start {
                self.map.remove(&pstart);
                start = pstart;
                len += plen;
            }
        }

        // Merge with a successor beginning exactly at our end.
        if let Some(&slen) = self.map.get(&ext.end()) {
            self.map.remove(&ext.end());
            len += slen;
        }

        self.map.insert(start, len);
        self.blocks += ext.len;
    }

    /// Remove the first extent of at least `count` blocks, lowest start
    /// first, and return its leading `count` blocks.
    pub fn remove_first_fit(&mut self, count: u64) -> Option<Extent> {
        if count == 0 {
            return None;
        }
        let start = self
            .map
            .iter()
            .find(|(_, &len)| len >= count)
            .map(|(&start, _)| start)?;
        let len = self.map.remove(&start).unwrap();
        if len > count {
            self.map.insert(start + count, len - count);
        }
        self.blocks -= count;
        Some(Extent::new(start, count))
    }

    /// Remove an exact range. Returns false when the range is not fully
    /// contained in a single extent.
    pub fn remove_exact(&mut self, ext: Extent) -> bool {
        if ext.len == 0 {
            return true;
        }
        let (&start, &len) = match self.map.range(..=ext.start).next_back() {
            Some(e) => e,
            None => return false,
        };
        if start + len < ext.end() || start > ext.start {
            return false;
        }
        self.map.remove(&start);
        if start < ext.start {
            self.map.insert(start, ext.start - start);
        }
        if start + len > ext.end() {
            self.map.insert(ext.end(), start + len - ext.end());
        }
        self.blocks -= ext.len;
        true
    }

    /// Take up to `count` blocks beginning exactly at `start`, if that run
    /// is free. Used to extend an allocation in place.
    pub fn remove_adjacent(&mut self, start: u64, count: u64) -> Option<Extent> {
        let (&estart, &elen) = self.map.range(..=start).next_back()?;
        if estart > start || estart + elen <= start {
            return None;
        }
        let avail = estart + elen - start;
        let take = avail.min(count);
        let got = Extent::new(start, take);
        if !self.remove_exact(got) {
            return None;
        }
        Some(got)
    }

    /// Iterate extents in ascending start order
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.map.iter().map(|(&start, &len)| Extent::new(start, len))
    }

    /// Remove and return every extent
    pub fn drain(&mut self) -> Vec<Extent> {
        let out: Vec<Extent> = self.iter().collect();
        self.map.clear();
        self.blocks = 0;
        out
    }

    fn overlaps(&self, ext: Extent) -> bool {
        if let Some((&start, &len)) = self.map.range(..ext.end()).next_back() {
            if start + len > ext.start {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_frees_coalesce_in_any_order() {
        // Insert 10..20 in shuffled single-block pieces.
        let order = [14u64, 10, 19, 12, 16, 11, 18, 13, 17, 15];
        let mut map = ExtentMap::new();
        for b in order {
            map.insert(Extent::new(b, 1));
        }
        assert_eq!(map.extent_count(), 1);
        assert_eq!(map.iter().next(), Some(Extent::new(10, 10)));
        assert_eq!(map.total_blocks(), 10);
    }

    #[test]
    fn first_fit_prefers_lowest_start() {
        let mut map = ExtentMap::new();
        map.insert(Extent::new(100, 4));
        map.insert(Extent::new(10, 4));
        map.insert(Extent::new(50, 8));

        assert_eq!(map.remove_first_fit(4), Some(Extent::new(10, 4)));
        // 10..14 is gone, next fit for 8 is at 50
        assert_eq!(map.remove_first_fit(8), Some(Extent::new(50, 8)));
        assert_eq!(map.remove_first_fit(8), None);
        assert_eq!(map.remove_first_fit(4), Some(Extent::new(100, 4)));
    }

    #[test]
    fn first_fit_splits_larger_extent() {
        let mut map = ExtentMap::new();
        map.insert(Extent::new(20, 10));
        assert_eq!(map.remove_first_fit(3), Some(Extent::new(20, 3)));
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![Extent::new(23, 7)]);
        assert_eq!(map.total_blocks(), 7);
    }

    #[test]
    fn remove_exact_splits_both_sides() {
        let mut map = ExtentMap::new();
        map.insert(Extent::new(0, 100));
        assert!(map.remove_exact(Extent::new(40, 20)));
        assert_eq!(
            map.iter().collect::<Vec<_>>(),
            vec![Extent::new(0, 40), Extent::new(60, 40)]
        );
        // Not present any more
        assert!(!map.remove_exact(Extent::new(45, 5)));
        assert_eq!(map.total_blocks(), 80);
    }

    #[test]
    fn remove_adjacent_takes_partial_run() {
        let mut map = ExtentMap::new();
        map.insert(Extent::new(30, 5));
        // Run continues at 30; ask for more than available.
        assert_eq!(map.remove_adjacent(30, 8), Some(Extent::new(30, 5)));
        assert!(map.is_empty());

        map.insert(Extent::new(30, 5));
        assert_eq!(map.remove_adjacent(32, 2), Some(Extent::new(32, 2)));
        assert_eq!(map.remove_adjacent(40, 1), None);
    }

    #[test]
    fn drain_empties_map() {
        let mut map = ExtentMap::new();
        map.insert(Extent::new(5, 2));
        map.insert(Extent::new(9, 3));
        let all = map.drain();
        assert_eq!(all.len(), 2);
        assert!(map.is_empty());
        assert_eq!(map.total_blocks(), 0);
    }
}
