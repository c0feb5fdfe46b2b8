//! Instance buffer allocator
//!
//! Hands out byte regions of one shared instance buffer. First-fit over a
//! free list kept sorted by offset; freed regions merge with their
//! neighbours, and a free region touching the end shrinks the high-water
//! mark. Allocated regions never overlap.

use std::collections::BTreeMap;

/// A byte range of the instance buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferRegion {
    pub offset: u64,
    pub size: u64,
}

impl BufferRegion {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &BufferRegion) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

#[derive(Clone, Debug, Default)]
pub struct BufferAllocator {
    /// Sorted by offset, never adjacent
    free: Vec<BufferRegion>,
    /// offset -> size
    allocated: BTreeMap<u64, u64>,
    high_water: u64,
    /// Upper bound on `high_water`; `None` grows without limit
    capacity: Option<u64>,
}

impl BufferAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// End of the furthest region ever in use, after tail shrinking.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    pub fn used_bytes(&self) -> u64 {
        self.allocated.values().sum()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn free_regions(&self) -> &[BufferRegion] {
        &self.free
    }

    /// First-fit allocation. Zero-sized requests and requests past the
    /// capacity return `None`.
    pub fn allocate(&mut self, size: u64) -> Option<BufferRegion> {
        if size == 0 {
            return None;
        }
        if let Some(i) = self.free.iter().position(|r| r.size >= size) {
            let hole = self.free[i];
            let region = BufferRegion {
                offset: hole.offset,
                size,
            };
            if hole.size == size {
                self.free.remove(i);
            } else {
                self.free[i] = BufferRegion {
                    offset: hole.offset + size,
                    size: hole.size - size,
                };
            }
            self.allocated.insert(region.offset, size);
            return Some(region);
        }

        let end = self.high_water.checked_add(size)?;
        if self.capacity.is_some_and(|cap| end > cap) {
            return None;
        }
        let region = BufferRegion {
            offset: self.high_water,
            size,
        };
        self.high_water = end;
        self.allocated.insert(region.offset, size);
        Some(region)
    }

    /// Return `region` to the free list. Unknown regions are ignored and
    /// reported as `false`.
    pub fn free(&mut self, region: BufferRegion) -> bool {
        if self.allocated.get(&region.offset) != Some(&region.size) {
            log::warn!(
                "[Allocator] free of unknown region {}+{}",
                region.offset,
                region.size
            );
            return false;
        }
        self.allocated.remove(&region.offset);

        let at = self.free.partition_point(|r| r.offset < region.offset);
        self.free.insert(at, region);
        // Merge with the right neighbour, then the left.
        if at + 1 < self.free.len() && self.free[at].end() == self.free[at + 1].offset {
            self.free[at].size += self.free[at + 1].size;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].end() == self.free[at].offset {
            self.free[at - 1].size += self.free[at].size;
            self.free.remove(at);
        }

        if let Some(last) = self.free.last().copied()
            && last.end() == self.high_water
        {
            self.high_water = last.offset;
            self.free.pop();
        }
        true
    }

    /// Free every region.
    pub fn reset(&mut self) {
        self.free.clear();
        self.allocated.clear();
        self.high_water = 0;
    }

    /// Free and allocated regions tile `[0, high_water)` exactly, the free
    /// list is sorted and coalesced, and nothing overlaps.
    pub fn is_consistent(&self) -> bool {
        let mut regions: Vec<(BufferRegion, bool)> = self
            .allocated
            .iter()
            .map(|(&offset, &size)| (BufferRegion { offset, size }, true))
            .chain(self.free.iter().map(|&r| (r, false)))
            .collect();
        regions.sort_by_key(|(r, _)| r.offset);

        let mut cursor = 0;
        let mut previous_free = false;
        for (region, allocated) in regions {
            if region.size == 0 || region.offset != cursor {
                return false;
            }
            if !allocated && previous_free {
                return false;
            }
            previous_free = !allocated;
            cursor = region.end();
        }
        cursor == self.high_water && !previous_free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_reuses_holes() {
        let mut alloc = BufferAllocator::new();
        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(128).unwrap();
        let c = alloc.allocate(64).unwrap();
        assert_eq!((a.offset, b.offset, c.offset), (0, 64, 192));

        assert!(alloc.free(b));
        let d = alloc.allocate(32).unwrap();
        assert_eq!(d.offset, 64);
        assert!(!d.overlaps(&a) && !d.overlaps(&c));
        assert_eq!(alloc.free_regions(), &[BufferRegion { offset: 96, size: 96 }]);
        assert!(alloc.is_consistent());
    }

    #[test]
    fn test_coalesce_and_tail_shrink() {
        let mut alloc = BufferAllocator::new();
        let regions: Vec<_> = (0..4).map(|_| alloc.allocate(16).unwrap()).collect();
        alloc.free(regions[1]);
        alloc.free(regions[2]);
        assert_eq!(alloc.free_regions(), &[BufferRegion { offset: 16, size: 32 }]);
        assert!(alloc.is_consistent());

        alloc.free(regions[3]);
        assert_eq!(alloc.high_water(), 16);
        assert!(alloc.free_regions().is_empty());

        alloc.free(regions[0]);
        assert_eq!(alloc.high_water(), 0);
        assert_eq!(alloc.allocation_count(), 0);
        assert!(alloc.is_consistent());
    }

    #[test]
    fn test_capacity_and_bad_free() {
        let mut alloc = BufferAllocator::with_capacity(100);
        assert!(alloc.allocate(0).is_none());
        let a = alloc.allocate(60).unwrap();
        assert!(alloc.allocate(60).is_none());
        assert!(!alloc.free(BufferRegion { offset: 0, size: 10 }));
        assert!(alloc.free(a));
        assert!(!alloc.free(a));
        assert!(alloc.is_consistent());
    }
}
