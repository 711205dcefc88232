//! Transport drivers
//!
//! A driver turns endpoint addresses of one protocol into shared memory
//! services and copy engines. Drivers are collected in an explicit
//! [`DriverRegistry`] that the caller builds once and hands to every
//! [`crate::transport::Transport`] that should see them.

pub mod local;
pub mod posix;
pub mod xfer;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::EndpointConfig;
use crate::endpoint::{EndPoint, EndPointAddress};
use crate::error::{Result, TransportError};
use crate::memory::SharedMemoryService;

pub use local::LocalDriver;
pub use posix::PosixShmDriver;
pub use xfer::{DeferredXfer, MemcpyXfer, XferOp, XferRequest, XferService, XferTable};

pub trait TransportDriver: Send + Sync + fmt::Debug {
    /// Protocol name used as the address prefix
    fn protocol(&self) -> &str;

    /// Parse and validate an address of this driver's protocol
    fn create_endpoint(&self, address: &str) -> Result<EndPointAddress> {
        let parsed = EndPointAddress::parse(address)?;
        if parsed.protocol != self.protocol() {
            return Err(TransportError::UnsupportedProtocol(format!(
                "{} is not handled by the {} driver",
                parsed.protocol,
                self.protocol()
            )));
        }
        Ok(parsed)
    }

    /// Reserve a fresh endpoint of at least `size_hint` bytes
    fn allocate_endpoint(&self, size_hint: usize) -> Result<String>;

    /// Build the memory service for `endpoint`
    ///
    /// Local endpoints get newly created memory; remote ones attach to
    /// memory created by their owner.
    fn shared_memory_service(&self, endpoint: &Arc<EndPoint>)
        -> Result<Arc<dyn SharedMemoryService>>;

    fn create_xfer_service(
        &self,
        source: &Arc<dyn SharedMemoryService>,
        target: &Arc<dyn SharedMemoryService>,
    ) -> Result<Arc<dyn XferService>>;
}

/// Drivers keyed by protocol name
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn TransportDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-process (`local`, `dma`) and POSIX (`shm`) drivers
    pub fn with_defaults(config: &EndpointConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalDriver::local(config.max_mailboxes)));
        registry.register(Arc::new(LocalDriver::dma(config.max_mailboxes)));
        registry.register(Arc::new(PosixShmDriver::new(config.max_mailboxes)));
        registry
    }

    /// Add a driver, replacing any previous driver of the same protocol
    pub fn register(&mut self, driver: Arc<dyn TransportDriver>) -> Option<Arc<dyn TransportDriver>> {
        tracing::debug!("Registering transport driver {}", driver.protocol());
        self.drivers.insert(driver.protocol().to_string(), driver)
    }

    pub fn get(&self, protocol: &str) -> Result<Arc<dyn TransportDriver>> {
        self.drivers
            .get(protocol)
            .cloned()
            .ok_or_else(|| TransportError::UnsupportedProtocol(protocol.to_string()))
    }

    /// Driver responsible for a full address string
    pub fn driver_for(&self, address: &str) -> Result<Arc<dyn TransportDriver>> {
        let (protocol, _) = address
            .split_once(':')
            .ok_or_else(|| TransportError::malformed(address, "missing protocol separator"))?;
        self.get(protocol)
    }

    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_protocols() {
        let registry = DriverRegistry::with_defaults(&EndpointConfig::default());
        assert_eq!(registry.protocols(), vec!["dma", "local", "shm"]);
    }

    #[test]
    fn test_unknown_protocol() {
        let registry = DriverRegistry::with_defaults(&EndpointConfig::default());
        assert!(matches!(
            registry.driver_for("pci:bar0:4096.1.0"),
            Err(TransportError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            registry.driver_for("nothing"),
            Err(TransportError::MalformedAddress { .. })
        ));
    }

    #[test]
    fn test_driver_rejects_foreign_protocol() {
        let driver = LocalDriver::local(4);
        assert!(driver.create_endpoint("local:r:4096.4.1").is_ok());
        assert!(matches!(
            driver.create_endpoint("shm:r:4096.4.1"),
            Err(TransportError::UnsupportedProtocol(_))
        ));
    }
}
