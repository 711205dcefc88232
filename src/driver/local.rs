//! In-process drivers over heap memory
//!
//! `local` copies synchronously. `dma` behaves like an asynchronous copy
//! engine: transfers complete only when the transport dispatches.
//!
//! Regions are published in a driver-wide table, so transports that share a
//! [`super::DriverRegistry`] reach each other's endpoints as if they were
//! separate processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::xfer::{DeferredXfer, MemcpyXfer, XferService};
use super::TransportDriver;
use crate::constants::{align_up, REGION_HEADER_SIZE};
use crate::endpoint::EndPoint;
use crate::error::{Result, TransportError};
use crate::memory::heap::HeapBacking;
use crate::memory::{init_header, RegionBacking, RegionService, SharedMemoryService};

#[derive(Debug)]
pub struct LocalDriver {
    protocol: &'static str,
    deferred: bool,
    max_mailboxes: u32,
    next_endpoint: AtomicU32,
    regions: Mutex<HashMap<String, Weak<HeapBacking>>>,
}

impl LocalDriver {
    pub fn local(max_mailboxes: u32) -> Self {
        Self::new("local", false, max_mailboxes)
    }

    pub fn dma(max_mailboxes: u32) -> Self {
        Self::new("dma", true, max_mailboxes)
    }

    fn new(protocol: &'static str, deferred: bool, max_mailboxes: u32) -> Self {
        Self {
            protocol,
            deferred,
            max_mailboxes: max_mailboxes.max(1),
            next_endpoint: AtomicU32::new(0),
            regions: Mutex::new(HashMap::new()),
        }
    }

    fn regions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Weak<HeapBacking>>>> {
        self.regions.lock().map_err(|_| {
            TransportError::ResourceUnavailable(format!("{} region table poisoned", self.protocol))
        })
    }

    /// Number of regions still alive
    pub fn live_regions(&self) -> usize {
        self.regions
            .lock()
            .map(|r| r.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

impl TransportDriver for LocalDriver {
    fn protocol(&self) -> &str {
        self.protocol
    }

    fn allocate_endpoint(&self, size_hint: usize) -> Result<String> {
        let n = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let size = align_up(size_hint.max(2 * REGION_HEADER_SIZE), REGION_HEADER_SIZE);
        Ok(format!(
            "{}:{}{}-{}:{}.{}.{}",
            self.protocol,
            self.protocol,
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
        let key = endpoint.as_str().to_string();
        let mut regions = self.regions()?;
        regions.retain(|_, w| w.strong_count() > 0);

        if endpoint.is_local() {
            if regions.contains_key(&key) {
                return Err(TransportError::ResourceUnavailable(format!(
                    "endpoint {} already exists",
                    key
                )));
            }
            let backing = Arc::new(HeapBacking::new(endpoint.size())?);
            init_header(backing.as_ref(), endpoint.mailbox());
            regions.insert(key, Arc::downgrade(&backing));
            let backing: Arc<dyn RegionBacking> = backing;
            return Ok(Arc::new(RegionService::local(Arc::clone(endpoint), backing)));
        }

        let backing = regions
            .get(&key)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                TransportError::ResourceUnavailable(format!("no {} region for {}", self.protocol, key))
            })?;
        let backing: Arc<dyn RegionBacking> = backing;
        Ok(Arc::new(RegionService::remote(Arc::clone(endpoint), backing)))
    }

    fn create_xfer_service(
        &self,
        _source: &Arc<dyn SharedMemoryService>,
        _target: &Arc<dyn SharedMemoryService>,
    ) -> Result<Arc<dyn XferService>> {
        if self.deferred {
            Ok(Arc::new(DeferredXfer::new()))
        } else {
            Ok(Arc::new(MemcpyXfer))
        }
    }
}
