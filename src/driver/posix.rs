//! POSIX shared memory driver (`shm` protocol)
//!
//! The resource part of an address names the shared memory object; the
//! mailbox is appended so one resource prefix can host several participants.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::xfer::{MemcpyXfer, XferService};
use super::TransportDriver;
use crate::constants::{align_up, REGION_HEADER_SIZE};
use crate::endpoint::EndPoint;
use crate::error::{Result, TransportError};
use crate::memory::shm::{ShmBacking, ShmError};
use crate::memory::{init_header, RegionBacking, RegionService, SharedMemoryService};

#[derive(Debug)]
pub struct PosixShmDriver {
    max_mailboxes: u32,
    next_endpoint: AtomicU32,
}

impl PosixShmDriver {
    pub fn new(max_mailboxes: u32) -> Self {
        Self {
            max_mailboxes: max_mailboxes.max(1),
            next_endpoint: AtomicU32::new(0),
        }
    }

    /// Shared memory object name for an endpoint
    pub fn object_name(endpoint: &EndPoint) -> String {
        let resource: String = endpoint
            .address()
            .resource
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        format!("/dp_{}.{}", resource, endpoint.mailbox())
    }
}

impl TransportDriver for PosixShmDriver {
    fn protocol(&self) -> &str {
        "shm"
    }

    fn allocate_endpoint(&self, size_hint: usize) -> Result<String> {
        let n = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let size = align_up(size_hint.max(2 * REGION_HEADER_SIZE), REGION_HEADER_SIZE);
        Ok(format!(
            "shm:p{}_{}:{}.{}.{}",
            std::process::id(),
            n,
            size,
            self.max_mailboxes,
            n % self.max_mailboxes
        ))
    }

    fn shared_memory_service(
        &self,
        endpoint: &Arc<EndPoint>,
    ) -> Result<Arc<dyn SharedMemoryService>> {
        let name = Self::object_name(endpoint);

        if endpoint.is_local() {
            let backing = ShmBacking::create(&name, endpoint.size()).map_err(|e| match e {
                ShmError::CreateFailed(io) => TransportError::ResourceUnavailable(format!(
                    "cannot create {}: {}",
                    name, io
                )),
                other => TransportError::Shm(other),
            })?;
            init_header(&backing, endpoint.mailbox());
            let backing: Arc<dyn RegionBacking> = Arc::new(backing);
            return Ok(Arc::new(RegionService::local(Arc::clone(endpoint), backing)));
        }

        let backing = ShmBacking::try_attach(&name)?.ok_or_else(|| {
            TransportError::ResourceUnavailable(format!("shared memory {} does not exist", name))
        })?;
        if backing.len() < endpoint.size() {
            return Err(TransportError::MappingFailed(format!(
                "{} holds {} bytes, endpoint expects {}",
                name,
                backing.len(),
                endpoint.size()
            )));
        }
        let backing: Arc<dyn RegionBacking> = Arc::new(backing);
        Ok(Arc::new(RegionService::remote(Arc::clone(endpoint), backing)))
    }

    fn create_xfer_service(
        &self,
        _source: &Arc<dyn SharedMemoryService>,
        _target: &Arc<dyn SharedMemoryService>,
    ) -> Result<Arc<dyn XferService>> {
        Ok(Arc::new(MemcpyXfer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointCache;

    #[test]
    fn test_object_name_sanitized() {
        let mut cache = EndpointCache::new();
        let (ep, _) = cache.resolve("shm:a/b.c:8192.4.2").unwrap();
        assert_eq!(PosixShmDriver::object_name(&ep), "/dp_a_b_c.2");
    }

    #[test]
    fn test_owner_and_peer_share_region() {
        let driver = PosixShmDriver::new(8);
        let address = driver.allocate_endpoint(16 * 1024).unwrap();

        let mut owner_cache = EndpointCache::new();
        let (owner_ep, _) = owner_cache.resolve(&address).unwrap();
        owner_ep.mark_local();
        let owner = driver.shared_memory_service(&owner_ep).unwrap();

        let mut peer_cache = EndpointCache::new();
        let (peer_ep, _) = peer_cache.resolve(&address).unwrap();
        let peer = driver.shared_memory_service(&peer_ep).unwrap();

        owner.map(4096, 8).unwrap().store_flag(0, 5);
        assert_eq!(peer.map(4096, 8).unwrap().load_flag(0), 5);
    }

    #[test]
    fn test_missing_peer_region() {
        let driver = PosixShmDriver::new(8);
        let mut cache = EndpointCache::new();
        let address = format!("shm:absent{}:8192.8.1", std::process::id());
        let (ep, _) = cache.resolve(&address).unwrap();
        assert!(matches!(
            driver.shared_memory_service(&ep),
            Err(TransportError::ResourceUnavailable(_))
        ));
    }
}
