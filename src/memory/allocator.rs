//! First-fit allocator over the usable part of a local endpoint region
//!
//! Port buffer pools and shadow flag blocks are carved out of their owner's
//! endpoint region. A [`RegionLease`] returns its range on drop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::constants::{align_up, REGION_ALIGN};

#[derive(Debug)]
pub struct RegionAllocator {
    /// Free ranges keyed by offset
    free: BTreeMap<usize, usize>,
    /// Outstanding allocations keyed by offset
    used: BTreeMap<usize, usize>,
}

impl RegionAllocator {
    pub fn new(start: usize, end: usize) -> Self {
        let start = align_up(start, REGION_ALIGN);
        let mut free = BTreeMap::new();
        if end > start {
            free.insert(start, end - start);
        }
        Self {
            free,
            used: BTreeMap::new(),
        }
    }

    /// Allocate `size` bytes, rounded up to the region alignment
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let size = align_up(size.max(1), REGION_ALIGN);
        let (&offset, &len) = self.free.iter().find(|(_, &len)| len >= size)?;

        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.used.insert(offset, size);
        Some(offset)
    }

    /// Return an allocation; adjacent free ranges are merged
    pub fn release(&mut self, offset: usize) -> bool {
        let Some(size) = self.used.remove(&offset) else {
            return false;
        };
        let mut start = offset;
        let mut end = offset + size;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }

        self.free.insert(start, end - start);
        true
    }

    pub fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    pub fn allocation_count(&self) -> usize {
        self.used.len()
    }

    /// Allocate through a shared allocator, returning an RAII lease
    pub fn lease(allocator: &Arc<Mutex<Self>>, size: usize) -> Option<RegionLease> {
        let offset = allocator.lock().ok()?.allocate(size)?;
        Some(RegionLease {
            allocator: Arc::downgrade(allocator),
            offset,
            size,
        })
    }
}

/// An allocation inside a local endpoint region
#[derive(Debug)]
pub struct RegionLease {
    allocator: Weak<Mutex<RegionAllocator>>,
    offset: usize,
    size: usize,
}

impl RegionLease {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Requested size (the reservation may be larger after alignment)
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for RegionLease {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.upgrade() {
            if let Ok(mut allocator) = allocator.lock() {
                allocator.release(self.offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let mut alloc = RegionAllocator::new(4096, 8192);
        let a = alloc.allocate(10).unwrap();
        let b = alloc.allocate(100).unwrap();
        assert_eq!(a, 4096);
        assert_eq!(b, 4096 + 64);
        assert_eq!(b % REGION_ALIGN, 0);
        assert_eq!(alloc.free_bytes(), 4096 - 64 - 128);
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = RegionAllocator::new(0, 256);
        assert!(alloc.allocate(200).is_some());
        assert!(alloc.allocate(64).is_none());
    }

    #[test]
    fn test_release_merges_neighbours() {
        let mut alloc = RegionAllocator::new(0, 256);
        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(64).unwrap();
        let c = alloc.allocate(64).unwrap();
        assert!(alloc.release(a));
        assert!(alloc.release(c));
        assert!(alloc.release(b));
        assert!(!alloc.release(b));
        assert_eq!(alloc.free_bytes(), 256);
        assert_eq!(alloc.allocate(256), Some(0));
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let alloc = Arc::new(Mutex::new(RegionAllocator::new(0, 1024)));
        let lease = RegionAllocator::lease(&alloc, 512).unwrap();
        assert_eq!(lease.size(), 512);
        assert_eq!(alloc.lock().unwrap().allocation_count(), 1);
        drop(lease);
        assert_eq!(alloc.lock().unwrap().allocation_count(), 0);
        assert_eq!(alloc.lock().unwrap().free_bytes(), 1024);
    }
}
