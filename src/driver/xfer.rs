//! Bulk-copy services
//!
//! A transfer is posted as an ordered list of [`XferOp`]s: data and metadata
//! copies first, then the flag stores that publish them. Ops hold `Arc`s of
//! their mappings, so memory stays mapped until the request has executed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::endpoint::EndPoint;
use crate::memory::MappedRegion;

/// One step of a posted transfer
#[derive(Clone)]
pub enum XferOp {
    Copy {
        src: Arc<MappedRegion>,
        src_offset: usize,
        dst: Arc<MappedRegion>,
        dst_offset: usize,
        len: usize,
    },
    /// Release-store a flag word after every preceding op
    Flag {
        dst: Arc<MappedRegion>,
        offset: usize,
        value: u64,
    },
}

impl fmt::Debug for XferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XferOp::Copy {
                src_offset,
                dst_offset,
                len,
                ..
            } => write!(f, "Copy({} -> {}, {} bytes)", src_offset, dst_offset, len),
            XferOp::Flag { offset, value, .. } => write!(f, "Flag({} = {})", offset, value),
        }
    }
}

impl XferOp {
    fn execute(&self) {
        match self {
            XferOp::Copy {
                src,
                src_offset,
                dst,
                dst_offset,
                len,
            } => src.copy_to(*src_offset, dst, *dst_offset, *len),
            XferOp::Flag { dst, offset, value } => dst.store_flag(*offset, *value),
        }
    }
}

/// Completion handle of a posted transfer
#[derive(Debug, Clone)]
pub struct XferRequest {
    complete: Arc<AtomicBool>,
}

impl XferRequest {
    fn new() -> Self {
        Self {
            complete: Arc::new(AtomicBool::new(false)),
        }
    }

    fn finish(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// Copy engine between two shared memory services
pub trait XferService: Send + Sync + fmt::Debug {
    /// Queue `ops` for in-order execution
    fn post(&self, ops: Vec<XferOp>) -> XferRequest;

    /// Advance queued work; returns the number of requests completed
    fn progress(&self) -> usize;

    /// Requests posted but not yet complete
    fn outstanding(&self) -> usize;
}

fn run(ops: &[XferOp]) {
    for op in ops {
        op.execute();
    }
}

/// Executes every request synchronously inside `post`
#[derive(Debug, Default)]
pub struct MemcpyXfer;

impl XferService for MemcpyXfer {
    fn post(&self, ops: Vec<XferOp>) -> XferRequest {
        let request = XferRequest::new();
        run(&ops);
        request.finish();
        request
    }

    fn progress(&self) -> usize {
        0
    }

    fn outstanding(&self) -> usize {
        0
    }
}

/// Models an asynchronous copy engine: requests run on `progress`
#[derive(Debug, Default)]
pub struct DeferredXfer {
    queue: Mutex<PostedOps>,
}

type PostedOps = VecDeque<(Vec<XferOp>, XferRequest)>;

impl DeferredXfer {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while the queue was held leaves it consistent: entries are
    // only pushed or drained whole.
    fn queue(&self) -> MutexGuard<'_, PostedOps> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl XferService for DeferredXfer {
    fn post(&self, ops: Vec<XferOp>) -> XferRequest {
        let request = XferRequest::new();
        self.queue().push_back((ops, request.clone()));
        request
    }

    fn progress(&self) -> usize {
        let drained: Vec<_> = self.queue().drain(..).collect();
        let completed = drained.len();
        for (ops, request) in drained {
            run(&ops);
            request.finish();
        }
        if completed > 0 {
            tracing::trace!("Deferred copy engine completed {} requests", completed);
        }
        completed
    }

    fn outstanding(&self) -> usize {
        self.queue().len()
    }
}

/// Copy services a circuit uses, keyed by (source, target) endpoint
#[derive(Debug, Default, Clone)]
pub struct XferTable {
    services: HashMap<(String, String), Arc<dyn XferService>>,
}

impl XferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: &EndPoint, target: &EndPoint, service: Arc<dyn XferService>) {
        self.services
            .insert((source.as_str().to_string(), target.as_str().to_string()), service);
    }

    pub fn get(&self, source: &EndPoint, target: &EndPoint) -> Option<&Arc<dyn XferService>> {
        self.services
            .get(&(source.as_str().to_string(), target.as_str().to_string()))
    }

    pub fn contains(&self, source: &EndPoint, target: &EndPoint) -> bool {
        self.get(source, target).is_some()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointCache;
    use crate::memory::heap::HeapBacking;
    use crate::memory::{RegionBacking, RegionService, SharedMemoryService};

    fn region() -> (RegionService, Arc<MappedRegion>) {
        let mut cache = EndpointCache::new();
        let (endpoint, _) = cache.resolve("local:xfer:16384.1.0").unwrap();
        let backing: Arc<dyn RegionBacking> = Arc::new(HeapBacking::new(16384).unwrap());
        let svc = RegionService::local(endpoint, backing);
        let map = Arc::new(svc.map(4096, 4096).unwrap());
        (svc, map)
    }

    fn ops(map: &Arc<MappedRegion>) -> Vec<XferOp> {
        vec![
            XferOp::Copy {
                src: Arc::clone(map),
                src_offset: 0,
                dst: Arc::clone(map),
                dst_offset: 1024,
                len: 4,
            },
            XferOp::Flag {
                dst: Arc::clone(map),
                offset: 2048,
                value: 9,
            },
        ]
    }

    #[test]
    fn test_memcpy_completes_in_post() {
        let (_svc, map) = region();
        map.write_bytes(0, b"abcd");
        let request = MemcpyXfer.post(ops(&map));
        assert!(request.is_complete());
        let mut out = [0u8; 4];
        map.read_bytes(1024, &mut out);
        assert_eq!(&out, b"abcd");
        assert_eq!(map.load_flag(2048), 9);
    }

    #[test]
    fn test_deferred_runs_on_progress() {
        let (svc, map) = region();
        map.write_bytes(0, b"wxyz");
        let xfer = DeferredXfer::new();
        let request = xfer.post(ops(&map));
        drop(map);

        // posted ops keep the mapping alive
        assert_eq!(svc.active_mappings(), 1);
        assert!(!request.is_complete());
        assert_eq!(xfer.outstanding(), 1);

        assert_eq!(xfer.progress(), 1);
        assert!(request.is_complete());
        assert_eq!(xfer.outstanding(), 0);
        assert_eq!(svc.active_mappings(), 0);
    }

    #[test]
    fn test_deferred_survives_poisoned_queue() {
        let (_svc, map) = region();
        map.write_bytes(0, b"wxyz");
        let xfer = Arc::new(DeferredXfer::new());
        let first = xfer.post(ops(&map));

        let poisoner = Arc::clone(&xfer);
        let result = std::thread::spawn(move || {
            let _guard = poisoner.queue.lock().unwrap();
            panic!("worker died holding the copy queue");
        })
        .join();
        assert!(result.is_err());
        assert!(xfer.queue.is_poisoned());

        let second = xfer.post(ops(&map));
        assert_eq!(xfer.outstanding(), 2);
        assert_eq!(xfer.progress(), 2);
        assert!(first.is_complete());
        assert!(second.is_complete());
        assert_eq!(xfer.outstanding(), 0);
    }
}
