//! Shared memory services
//!
//! Every endpoint resolves to a [`SharedMemoryService`]: a named region that
//! can be attached, detached and mapped piecewise. Mappings are owned
//! [`MappedRegion`] handles; the backing memory lives as long as any mapping
//! of it does, so a transfer holding a mapping can outlive the circuit that
//! created it.
//!
//! Flag words inside a mapping are accessed as [`AtomicU64`] with release
//! stores and acquire loads. Each flag word has exactly one writer.

pub mod allocator;
pub mod heap;
pub mod shm;

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constants::{FLAG_WORD_SIZE, REGION_HEADER_SIZE, REGION_MAGIC, REGION_VERSION};
use crate::endpoint::EndPoint;
use crate::error::{Result, TransportError};

pub use allocator::{RegionAllocator, RegionLease};

/// Raw memory behind an endpoint region
pub trait RegionBacking: Send + Sync + fmt::Debug {
    fn base(&self) -> NonNull<u8>;
    fn len(&self) -> usize;
}

/// Header written at offset 0 of every endpoint region.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RegionHeader {
    /// Magic number for validation
    pub magic: u64,
    /// Layout version
    pub version: u32,
    /// Mailbox of the endpoint that created the region
    pub mailbox: u32,
    /// Total region size including this header
    pub size: u64,
    /// Process ID of the creator
    pub owner_pid: u32,
    pub _reserved: u32,
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() <= REGION_HEADER_SIZE);

impl RegionHeader {
    pub fn new(size: usize, mailbox: u32) -> Self {
        Self {
            magic: REGION_MAGIC,
            version: REGION_VERSION,
            mailbox,
            size: size as u64,
            owner_pid: std::process::id(),
            _reserved: 0,
        }
    }

    pub fn validate(&self) -> bool {
        self.magic == REGION_MAGIC && self.version == REGION_VERSION
    }
}

/// Write a fresh header into a newly created backing
pub(crate) fn init_header(backing: &dyn RegionBacking, mailbox: u32) {
    let header = RegionHeader::new(backing.len(), mailbox);
    // SAFETY: every backing is at least REGION_HEADER_SIZE bytes and is not
    // yet visible to any other participant.
    unsafe {
        std::ptr::copy_nonoverlapping(
            header.as_bytes().as_ptr(),
            backing.base().as_ptr(),
            std::mem::size_of::<RegionHeader>(),
        );
    }
}

/// An owned view of `[offset, offset + len)` of an endpoint region
pub struct MappedRegion {
    backing: Arc<dyn RegionBacking>,
    ptr: NonNull<u8>,
    offset: usize,
    len: usize,
    mappings: Arc<AtomicUsize>,
}

// SAFETY: the mapped memory is process-shared and the flag words inside it
// are only touched through atomics. Plain data bytes are written only by the
// side that owns the buffer under the full/empty protocol.
unsafe impl Send for MappedRegion {}

// SAFETY: see `Send`; concurrent readers observe data only after an acquire
// load of the flag that the writer released.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn new(
        backing: Arc<dyn RegionBacking>,
        offset: usize,
        len: usize,
        mappings: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| TransportError::MappingFailed("mapping range overflows".to_string()))?;
        if end > backing.len() {
            return Err(TransportError::MappingFailed(format!(
                "range {}..{} exceeds region size {}",
                offset,
                end,
                backing.len()
            )));
        }

        // SAFETY: offset is within the backing allocation (checked above).
        let ptr = unsafe { NonNull::new_unchecked(backing.base().as_ptr().add(offset)) };
        mappings.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            backing,
            ptr,
            offset,
            len,
            mappings,
        })
    }

    /// Offset of this mapping inside its region
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the whole region this mapping belongs to
    pub fn region_len(&self) -> usize {
        self.backing.len()
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "access {}..{} outside mapping of {} bytes",
            offset,
            offset.saturating_add(len),
            self.len
        );
    }

    /// Raw pointer to `offset` within the mapping
    pub fn ptr_at(&self, offset: usize, len: usize) -> *mut u8 {
        self.check(offset, len);
        // SAFETY: bounds checked above.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    /// The flag word at `offset`
    pub fn word(&self, offset: usize) -> &AtomicU64 {
        let ptr = self.ptr_at(offset, FLAG_WORD_SIZE);
        assert!(
            (ptr as usize) % std::mem::align_of::<AtomicU64>() == 0,
            "flag word at offset {} is misaligned",
            offset
        );
        // SAFETY: in bounds, aligned, and region memory lives as long as self.
        unsafe { &*(ptr as *const AtomicU64) }
    }

    pub fn load_flag(&self, offset: usize) -> u64 {
        self.word(offset).load(Ordering::Acquire)
    }

    pub fn store_flag(&self, offset: usize, value: u64) {
        self.word(offset).store(value, Ordering::Release);
    }

    /// Copy bytes out of the mapping
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        let src = self.ptr_at(offset, out.len());
        // SAFETY: bounds checked; `out` cannot alias mapped memory handed out
        // as a slice because slices are only produced through `BufferHandle`.
        unsafe { std::ptr::copy(src, out.as_mut_ptr(), out.len()) };
    }

    /// Copy bytes into the mapping
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        let dst = self.ptr_at(offset, data.len());
        // SAFETY: bounds checked.
        unsafe { std::ptr::copy(data.as_ptr(), dst, data.len()) };
    }

    pub fn read_value<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut value = T::new_zeroed();
        self.read_bytes(offset, value.as_mut_bytes());
        value
    }

    pub fn write_value<T: IntoBytes + Immutable>(&self, offset: usize, value: &T) {
        self.write_bytes(offset, value.as_bytes());
    }

    /// Copy `len` bytes from this mapping into another one
    pub fn copy_to(&self, src_offset: usize, dst: &MappedRegion, dst_offset: usize, len: usize) {
        let src = self.ptr_at(src_offset, len);
        let dst = dst.ptr_at(dst_offset, len);
        // SAFETY: both ranges are bounds checked; `copy` tolerates overlap.
        unsafe { std::ptr::copy(src, dst, len) };
    }

    /// Immutable slice view
    ///
    /// # Safety
    /// The caller must own the bytes under the full/empty protocol for the
    /// lifetime of the slice.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.ptr_at(offset, len), len)
    }

    /// Mutable slice view
    ///
    /// # Safety
    /// The caller must own the bytes exclusively for the lifetime of the slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr_at(offset, len), len)
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.mappings.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Driver-facing contract for one endpoint's memory
pub trait SharedMemoryService: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &Arc<EndPoint>;

    fn attach(&self) -> Result<()>;

    fn detach(&self) -> Result<()>;

    fn is_attached(&self) -> bool;

    /// Map `size` bytes at `offset`; unmapped when the handle is dropped
    fn map(&self, offset: usize, size: usize) -> Result<MappedRegion>;

    /// Reserve `size` bytes in a local region
    fn allocate(&self, size: usize) -> Result<RegionLease>;

    /// Number of live mappings handed out by this service
    fn active_mappings(&self) -> usize;

    fn size(&self) -> usize;
}

/// [`SharedMemoryService`] over any [`RegionBacking`]
///
/// Local regions carry an allocator; remote regions are map-only.
#[derive(Debug)]
pub struct RegionService {
    endpoint: Arc<EndPoint>,
    backing: Arc<dyn RegionBacking>,
    allocator: Option<Arc<Mutex<RegionAllocator>>>,
    attached: AtomicBool,
    mappings: Arc<AtomicUsize>,
}

impl RegionService {
    pub fn local(endpoint: Arc<EndPoint>, backing: Arc<dyn RegionBacking>) -> Self {
        let allocator = RegionAllocator::new(REGION_HEADER_SIZE, backing.len());
        Self {
            endpoint,
            backing,
            allocator: Some(Arc::new(Mutex::new(allocator))),
            attached: AtomicBool::new(true),
            mappings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn remote(endpoint: Arc<EndPoint>, backing: Arc<dyn RegionBacking>) -> Self {
        Self {
            endpoint,
            backing,
            allocator: None,
            attached: AtomicBool::new(true),
            mappings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn header(&self) -> Result<RegionHeader> {
        let header: RegionHeader = self
            .map(0, std::mem::size_of::<RegionHeader>())?
            .read_value(0);
        Ok(header)
    }
}

impl SharedMemoryService for RegionService {
    fn endpoint(&self) -> &Arc<EndPoint> {
        &self.endpoint
    }

    fn attach(&self) -> Result<()> {
        self.attached.store(true, Ordering::Release);
        Ok(())
    }

    fn detach(&self) -> Result<()> {
        if self.attached.swap(false, Ordering::AcqRel) {
            tracing::debug!(
                "Detached from {} with {} live mappings",
                self.endpoint,
                self.active_mappings()
            );
        }
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    fn map(&self, offset: usize, size: usize) -> Result<MappedRegion> {
        if !self.is_attached() {
            return Err(TransportError::MappingFailed(format!(
                "{} is detached",
                self.endpoint
            )));
        }
        MappedRegion::new(
            Arc::clone(&self.backing),
            offset,
            size,
            Arc::clone(&self.mappings),
        )
    }

    fn allocate(&self, size: usize) -> Result<RegionLease> {
        let allocator = self.allocator.as_ref().ok_or_else(|| {
            TransportError::ResourceUnavailable(format!(
                "cannot allocate in remote endpoint {}",
                self.endpoint
            ))
        })?;
        RegionAllocator::lease(allocator, size).ok_or_else(|| {
            TransportError::ResourceUnavailable(format!(
                "endpoint {} has no room for {} bytes",
                self.endpoint, size
            ))
        })
    }

    fn active_mappings(&self) -> usize {
        self.mappings.load(Ordering::Acquire)
    }

    fn size(&self) -> usize {
        self.backing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointCache;
    use heap::HeapBacking;

    fn service(size: usize) -> RegionService {
        let mut cache = EndpointCache::new();
        let (endpoint, _) = cache
            .resolve(&format!("local:test:{}.1.0", size))
            .unwrap();
        let backing: Arc<dyn RegionBacking> = Arc::new(HeapBacking::new(size).unwrap());
        init_header(backing.as_ref(), 0);
        RegionService::local(endpoint, backing)
    }

    #[test]
    fn test_header_written() {
        let svc = service(16 * 1024);
        let header = svc.header().unwrap();
        assert!(header.validate());
        assert_eq!(header.size, 16 * 1024);
        assert_eq!(header.owner_pid, std::process::id());
    }

    #[test]
    fn test_map_counts_and_bounds() {
        let svc = service(16 * 1024);
        let a = svc.map(4096, 128).unwrap();
        let b = svc.map(8192, 64).unwrap();
        assert_eq!(svc.active_mappings(), 2);
        drop(a);
        assert_eq!(svc.active_mappings(), 1);
        drop(b);
        assert_eq!(svc.active_mappings(), 0);

        assert!(matches!(
            svc.map(16 * 1024 - 8, 16),
            Err(TransportError::MappingFailed(_))
        ));
    }

    #[test]
    fn test_flag_words_visible_across_mappings() {
        let svc = service(16 * 1024);
        let writer = svc.map(4096, 64).unwrap();
        let reader = svc.map(4096, 64).unwrap();
        writer.store_flag(8, 42);
        assert_eq!(reader.load_flag(8), 42);
    }

    #[test]
    fn test_detached_refuses_maps() {
        let svc = service(16 * 1024);
        let kept = svc.map(4096, 64).unwrap();
        svc.detach().unwrap();
        assert!(svc.map(4096, 64).is_err());
        // existing mappings stay usable
        kept.store_flag(0, 7);
        assert_eq!(kept.load_flag(0), 7);
        svc.attach().unwrap();
        assert!(svc.map(4096, 64).is_ok());
    }

    #[test]
    fn test_remote_cannot_allocate() {
        let mut cache = EndpointCache::new();
        let (endpoint, _) = cache.resolve("local:test:8192.1.0").unwrap();
        let backing: Arc<dyn RegionBacking> = Arc::new(HeapBacking::new(8192).unwrap());
        let svc = RegionService::remote(endpoint, backing);
        assert!(matches!(
            svc.allocate(64),
            Err(TransportError::ResourceUnavailable(_))
        ));
    }

    #[test]
    #[should_panic(expected = "outside mapping")]
    fn test_out_of_bounds_word_panics() {
        let svc = service(16 * 1024);
        let region = svc.map(4096, 64).unwrap();
        region.load_flag(64);
    }
}
