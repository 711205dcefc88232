//! Buffer state machine
//!
//! A buffer's Empty/Full state is derived from two single-writer flag words:
//! the fill word, written by whoever lands data in the buffer, and the drain
//! word, written by whoever releases it. The buffer is Full while they
//! differ. Local bookkeeping (claimed by a worker, retained across runs,
//! reserved by an in-flight transfer) lives in [`BufferSlot`] and never
//! crosses a process boundary.

pub mod layout;

use std::sync::Arc;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::CircuitId;
use crate::memory::{MappedRegion, RegionLease};
use crate::port::PortRef;

pub use layout::{FlagBlock, PortLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Full,
}

/// Encoding of fill/drain flag words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagMode {
    /// Words carry cumulative per-buffer counts
    Count,
    /// Only the low bit is significant
    Toggle,
}

impl FlagMode {
    pub fn mask(self) -> u64 {
        match self {
            FlagMode::Count => u64::MAX,
            FlagMode::Toggle => 1,
        }
    }

    pub fn encode(self, count: u64) -> u64 {
        count & self.mask()
    }

    /// State implied by a fill word and a drain word
    pub fn state(self, fill: u64, drain: u64) -> BufferState {
        if (fill ^ drain) & self.mask() != 0 {
            BufferState::Full
        } else {
            BufferState::Empty
        }
    }
}

/// No more messages follow this one
pub const META_END_OF_STREAM: u32 = 1 << 0;
/// Sent to every consumer port regardless of the circuit pattern
pub const META_BROADCAST: u32 = 1 << 1;

/// Out-of-band message metadata stored next to each buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BufferMetaData {
    /// Valid bytes in the data slot
    pub length: u32,
    /// Application-defined message opcode
    pub opcode: u32,
    /// Circuit-wide fill order
    pub sequence: u64,
    /// Consumer lanes this buffer is meant for
    pub targets: u32,
    /// `META_*` bits
    pub flags: u32,
    /// Ordinal of the producer port that filled the buffer
    pub producer: u32,
    pub _reserved: u32,
}

const _: () = assert!(std::mem::size_of::<BufferMetaData>() == 32);

impl BufferMetaData {
    pub fn targets_lane(&self, lane: usize) -> bool {
        self.targets & (1u32 << lane) != 0
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & META_END_OF_STREAM != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & META_BROADCAST != 0
    }
}

/// Process-local bookkeeping for one buffer
#[derive(Debug, Clone, Default)]
pub struct BufferSlot {
    /// Handed to a worker by get_empty/get_full
    pub claimed: bool,
    /// Retained across run cycles by `take`
    pub in_use: bool,
    /// Target of a transfer that has not landed yet
    pub reserved: bool,
    /// Fills written into this buffer by the local mover or owner
    pub fills: u64,
    /// Lanes that must drain before a producer buffer is reusable
    pub expected: u32,
}

impl BufferSlot {
    /// Available to distribution policies
    pub fn selectable(&self) -> bool {
        !self.claimed && !self.in_use && !self.reserved
    }
}

/// A buffer checked out to a worker
///
/// Handles are move-only: releasing or producing consumes the handle. A
/// handle keeps its port's block reserved, so the bytes it points at are not
/// handed to another circuit while it is alive.
#[derive(Debug)]
pub struct BufferHandle {
    pub(crate) circuit: CircuitId,
    pub(crate) port: PortRef,
    pub(crate) index: usize,
    region: Arc<MappedRegion>,
    _lease: Option<Arc<RegionLease>>,
    data_offset: usize,
    meta_offset: usize,
    capacity: usize,
}

impl BufferHandle {
    pub(crate) fn new(
        circuit: CircuitId,
        port: PortRef,
        index: usize,
        region: Arc<MappedRegion>,
        lease: Option<Arc<RegionLease>>,
        layout: &PortLayout,
    ) -> Self {
        Self {
            circuit,
            port,
            index,
            region,
            _lease: lease,
            data_offset: layout.data(index),
            meta_offset: layout.meta(index),
            capacity: layout.buffer_size,
        }
    }

    pub fn circuit(&self) -> CircuitId {
        self.circuit
    }

    pub fn port(&self) -> PortRef {
        self.port
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metadata(&self) -> BufferMetaData {
        self.region.read_value(self.meta_offset)
    }

    pub fn length(&self) -> usize {
        (self.metadata().length as usize).min(self.capacity)
    }

    pub fn opcode(&self) -> u32 {
        self.metadata().opcode
    }

    /// Message bytes of a received buffer
    pub fn data(&self) -> &[u8] {
        // SAFETY: the handle is the only claim on this buffer while it exists.
        unsafe { self.region.slice(self.data_offset, self.length()) }
    }

    /// Whole data slot of a buffer being filled
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `data`; `&mut self` makes the slice exclusive.
        unsafe { self.region.slice_mut(self.data_offset, self.capacity) }
    }

    /// Copy `bytes` into the front of the data slot
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.capacity);
        self.data_mut()[..n].copy_from_slice(&bytes[..n]);
        n
    }
}
