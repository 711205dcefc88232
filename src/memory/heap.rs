//! Process-heap region backing
//!
//! Used by the in-process drivers. Page-aligned and zero-initialised like a
//! fresh shared memory object, so flag words start out equal.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use super::RegionBacking;
use crate::error::{Result, TransportError};

const PAGE_SIZE: usize = 4096;

#[derive(Debug)]
pub struct HeapBacking {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is plain memory owned by this value; concurrent
// access goes through `MappedRegion`, which uses atomics for flag words.
unsafe impl Send for HeapBacking {}

// SAFETY: see `Send`.
unsafe impl Sync for HeapBacking {}

impl HeapBacking {
    pub fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(PAGE_SIZE), PAGE_SIZE).map_err(|e| {
            TransportError::ResourceUnavailable(format!("invalid region size {}: {}", size, e))
        })?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            TransportError::ResourceUnavailable(format!("failed to allocate {} bytes", size))
        })?;

        Ok(Self { ptr, layout })
    }
}

impl RegionBacking for HeapBacking {
    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapBacking {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
