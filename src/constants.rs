//! Global constants for the data-plane transport
//!
//! Wire magic numbers, memory layout granularity and per-circuit limits live
//! here so the endpoint, memory, descriptor and port modules agree on them.

/// Magic number at the start of every endpoint region header ("DPREGION")
pub const REGION_MAGIC: u64 = 0x4450_5245_4749_4F4E;

/// Region header layout version
pub const REGION_VERSION: u32 = 1;

/// Bytes reserved at the start of each endpoint region for its header
///
/// Allocations handed out by a region allocator start after this offset.
pub const REGION_HEADER_SIZE: usize = 4096;

/// Alignment of every allocation inside an endpoint region (cache line)
pub const REGION_ALIGN: usize = 64;

/// Magic number of a handshake message carrying a port descriptor ("DPDS")
pub const DESCRIPTOR_MAGIC: u32 = 0x4450_4453;

/// Handshake message layout version
pub const DESCRIPTOR_VERSION: u16 = 1;

/// Fixed capacity of the origin endpoint string inside a descriptor
pub const ENDPOINT_STRING_LEN: usize = 128;

/// Maximum number of buffers in one port's pool
pub const MAX_BUFFERS: usize = 64;

/// Maximum number of consumer ports in one circuit
///
/// Each consumer port owns one lane in the producer's drain words, and the
/// target mask in buffer metadata is a `u32`.
pub const MAX_LANES: usize = 16;

/// Size of one flag word in bytes
pub const FLAG_WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Upper bound on `maxMailboxes` in an endpoint address
pub const MAX_MAILBOXES: u32 = u16::MAX as u32;

/// Round `value` up to the next multiple of `align` (a power of two)
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// [`align_up`] for sizes that come from outside the process
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn test_checked_align_up_overflow() {
        assert_eq!(checked_align_up(65, 64), Some(128));
        assert_eq!(checked_align_up(usize::MAX - 10, 64), None);
    }

    #[test]
    fn test_lanes_fit_target_mask() {
        assert!(MAX_LANES <= u32::BITS as usize);
    }
}
