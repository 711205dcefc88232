//! Memory layout of a port's buffer pool and of shadow flag blocks
//!
//! A port block is laid out as
//!
//! ```text
//! | data[0] .. data[n-1] | meta[0] .. meta[n-1] | full[0..n] | empty[0..n][0..lanes] |
//! ```
//!
//! Each data slot is padded to a cache line. Producer ports carry one drain
//! lane per consumer port; consumer ports carry one.

use std::sync::Arc;

use super::{BufferMetaData, FlagMode};
use crate::constants::{checked_align_up, FLAG_WORD_SIZE, MAX_BUFFERS, MAX_LANES, REGION_ALIGN};
use crate::error::{Result, TransportError};
use crate::memory::{MappedRegion, RegionLease};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub data_pitch: usize,
    pub meta_pitch: usize,
    pub lanes: usize,
    pub data_offset: usize,
    pub meta_offset: usize,
    pub full_offset: usize,
    pub empty_offset: usize,
    pub total_size: usize,
}

impl PortLayout {
    pub fn new(buffer_count: usize, buffer_size: usize, lanes: usize) -> Result<Self> {
        if buffer_count == 0 || buffer_count > MAX_BUFFERS {
            return Err(TransportError::InvalidPort(format!(
                "buffer count {} outside 1..={}",
                buffer_count, MAX_BUFFERS
            )));
        }
        if buffer_size == 0 {
            return Err(TransportError::InvalidPort("zero buffer size".to_string()));
        }
        // BufferMetaData::length is a u32
        if buffer_size > u32::MAX as usize {
            return Err(TransportError::InvalidPort(format!(
                "buffer size {} exceeds {}",
                buffer_size,
                u32::MAX
            )));
        }
        if lanes == 0 || lanes > MAX_LANES {
            return Err(TransportError::InvalidPort(format!(
                "lane count {} outside 1..={}",
                lanes, MAX_LANES
            )));
        }

        let overflow = || {
            TransportError::InvalidPort(format!(
                "{} buffers of {} bytes with {} lanes overflow the address space",
                buffer_count, buffer_size, lanes
            ))
        };
        let data_pitch = checked_align_up(buffer_size, REGION_ALIGN).ok_or_else(overflow)?;
        let meta_pitch = std::mem::size_of::<BufferMetaData>();
        let data_offset = 0;
        let meta_offset = data_pitch.checked_mul(buffer_count).ok_or_else(overflow)?;
        let meta_end = meta_pitch
            .checked_mul(buffer_count)
            .and_then(|n| n.checked_add(meta_offset))
            .ok_or_else(overflow)?;
        let full_offset = checked_align_up(meta_end, FLAG_WORD_SIZE).ok_or_else(overflow)?;
        let empty_offset = FLAG_WORD_SIZE
            .checked_mul(buffer_count)
            .and_then(|n| n.checked_add(full_offset))
            .ok_or_else(overflow)?;
        let total_size = FLAG_WORD_SIZE
            .checked_mul(lanes)
            .and_then(|n| n.checked_mul(buffer_count))
            .and_then(|n| n.checked_add(empty_offset))
            .ok_or_else(overflow)?;

        Ok(Self {
            buffer_count,
            buffer_size,
            data_pitch,
            meta_pitch,
            lanes,
            data_offset,
            meta_offset,
            full_offset,
            empty_offset,
            total_size,
        })
    }

    pub fn data(&self, index: usize) -> usize {
        debug_assert!(index < self.buffer_count);
        self.data_offset + self.data_pitch * index
    }

    pub fn meta(&self, index: usize) -> usize {
        debug_assert!(index < self.buffer_count);
        self.meta_offset + self.meta_pitch * index
    }

    pub fn full(&self, index: usize) -> usize {
        debug_assert!(index < self.buffer_count);
        self.full_offset + FLAG_WORD_SIZE * index
    }

    pub fn empty_pitch(&self) -> usize {
        FLAG_WORD_SIZE * self.lanes
    }

    pub fn empty(&self, index: usize, lane: usize) -> usize {
        debug_assert!(index < self.buffer_count && lane < self.lanes);
        self.empty_offset + self.empty_pitch() * index + FLAG_WORD_SIZE * lane
    }
}

/// A block of flag words mirroring another port's buffers
///
/// Lives in the mover's region and is written by the ActiveFlowControl side.
#[derive(Debug)]
pub struct FlagBlock {
    region: Arc<MappedRegion>,
    count: usize,
    _lease: Option<RegionLease>,
}

impl FlagBlock {
    pub fn size_for(count: usize) -> usize {
        FLAG_WORD_SIZE * count
    }

    pub fn new(region: Arc<MappedRegion>, count: usize, lease: Option<RegionLease>) -> Self {
        assert!(
            region.len() >= Self::size_for(count),
            "flag block of {} words does not fit a {} byte mapping",
            count,
            region.len()
        );
        Self {
            region,
            count,
            _lease: lease,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Offset of the block in its endpoint region
    pub fn base(&self) -> usize {
        self.region.offset()
    }

    pub fn region(&self) -> &Arc<MappedRegion> {
        &self.region
    }

    pub fn offset_of(&self, index: usize) -> usize {
        assert!(index < self.count, "flag index {} out of {}", index, self.count);
        FLAG_WORD_SIZE * index
    }

    pub fn load(&self, index: usize) -> u64 {
        self.region.load_flag(self.offset_of(index))
    }

    pub fn store(&self, index: usize, value: u64, mode: FlagMode) {
        self.region
            .store_flag(self.offset_of(index), mode.encode(value));
    }
}
