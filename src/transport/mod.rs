//! Transport: endpoint registry, circuit table and dispatch loop
//!
//! A [`Transport`] is one participant's view of the data plane. It resolves
//! endpoint addresses through an explicit [`DriverRegistry`], caches memory
//! and copy services, owns every circuit it created and advances them in
//! [`Transport::dispatch`]. All state sits behind one mutex; workers on
//! other threads call the buffer API through `&self`.
//!
//! Closed circuits whose transfers are still in flight move to a retiring
//! list and keep their mappings until those transfers complete.

pub mod event;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::buffer::{BufferHandle, META_BROADCAST, META_END_OF_STREAM};
use crate::circuit::{Circuit, CircuitSpec, CircuitState, PortSetSpec, ProduceStatus, Resources};
use crate::config::{DispatchMode, EndpointConfig, TransportConfig};
use crate::controller::ControllerKind;
use crate::driver::{DriverRegistry, XferService};
use crate::endpoint::{EndPoint, EndpointCache};
use crate::error::{CircuitId, Result, TransportError};
use crate::memory::SharedMemoryService;
use crate::port::Negotiated;

pub use event::EventSignal;

/// Endpoint and service caches shared by every circuit of a transport
#[derive(Debug, Default)]
struct ServiceCache {
    endpoints: EndpointCache,
    /// Memory services by canonical endpoint
    services: HashMap<String, Arc<dyn SharedMemoryService>>,
    /// This participant's endpoint for each protocol
    local: HashMap<String, Arc<EndPoint>>,
    /// Copy services by (source, target) canonical endpoint
    xfers: HashMap<(String, String), Arc<dyn XferService>>,
}

#[derive(Debug, Default)]
struct Inner {
    cache: ServiceCache,
    circuits: HashMap<CircuitId, Circuit>,
    retiring: Vec<Circuit>,
    next_id: CircuitId,
}

/// [`Resources`] view over a transport's caches
struct Resolver<'a> {
    cache: &'a mut ServiceCache,
    registry: &'a DriverRegistry,
    config: &'a EndpointConfig,
}

impl Resolver<'_> {
    fn service_for(&mut self, endpoint: &Arc<EndPoint>) -> Result<Arc<dyn SharedMemoryService>> {
        if let Some(service) = self.cache.services.get(endpoint.as_str()) {
            service.attach()?;
            return Ok(Arc::clone(service));
        }
        let driver = self.registry.get(endpoint.protocol())?;
        let service = driver.shared_memory_service(endpoint)?;
        tracing::debug!(
            "Created {} memory service for {}",
            if endpoint.is_local() { "local" } else { "remote" },
            endpoint
        );
        self.cache
            .services
            .insert(endpoint.as_str().to_string(), Arc::clone(&service));
        Ok(service)
    }

    fn create_endpoint(&mut self, address: &str) -> Result<Arc<EndPoint>> {
        self.registry.driver_for(address)?.create_endpoint(address)?;
        let (endpoint, created) = self.cache.endpoints.resolve(address)?;
        if created {
            tracing::debug!("Resolved endpoint {}", endpoint);
        }
        Ok(endpoint)
    }

    fn allocate_endpoint(&mut self, protocol: &str, size_hint: usize) -> Result<Arc<EndPoint>> {
        let address = self.registry.get(protocol)?.allocate_endpoint(size_hint)?;
        let endpoint = self.create_endpoint(&address)?;
        endpoint.mark_local();
        self.service_for(&endpoint)?;
        tracing::info!("Allocated local endpoint {}", endpoint);
        Ok(endpoint)
    }

    fn local_endpoint(&mut self, protocol: Option<&str>) -> Result<Arc<EndPoint>> {
        let protocol = protocol.unwrap_or(&self.config.default_protocol).to_string();
        if let Some(endpoint) = self.cache.local.get(&protocol) {
            return Ok(Arc::clone(endpoint));
        }
        let endpoint = self.allocate_endpoint(&protocol, self.config.region_size)?;
        self.cache.local.insert(protocol, Arc::clone(&endpoint));
        Ok(endpoint)
    }
}

impl Resources for Resolver<'_> {
    fn local_service(&mut self, protocol: Option<&str>) -> Result<Arc<dyn SharedMemoryService>> {
        let endpoint = self.local_endpoint(protocol)?;
        self.service_for(&endpoint)
    }

    fn remote_service(&mut self, address: &str) -> Result<Arc<dyn SharedMemoryService>> {
        let endpoint = self.create_endpoint(address)?;
        self.service_for(&endpoint)
    }

    fn xfer_service(
        &mut self,
        source: &Arc<dyn SharedMemoryService>,
        target: &Arc<dyn SharedMemoryService>,
    ) -> Result<Arc<dyn XferService>> {
        let key = (
            source.endpoint().as_str().to_string(),
            target.endpoint().as_str().to_string(),
        );
        if let Some(xfer) = self.cache.xfers.get(&key) {
            return Ok(Arc::clone(xfer));
        }
        let driver = self.registry.get(target.endpoint().protocol())?;
        let xfer = driver.create_xfer_service(source, target)?;
        tracing::debug!("Created copy service {} -> {}", key.0, key.1);
        self.cache.xfers.insert(key, Arc::clone(&xfer));
        Ok(xfer)
    }
}

/// One participant's data-plane transport
#[derive(Debug)]
pub struct Transport {
    config: TransportConfig,
    registry: Arc<DriverRegistry>,
    inner: Mutex<Inner>,
    signal: EventSignal,
}

impl Transport {
    pub fn new(config: TransportConfig, registry: Arc<DriverRegistry>) -> Self {
        tracing::info!(
            "Transport created: {:?} dispatch, protocols {:?}, default {}",
            config.dispatch.mode,
            registry.protocols(),
            config.endpoints.default_protocol
        );
        Self {
            config,
            registry,
            inner: Mutex::new(Inner::default()),
            signal: EventSignal::new(),
        }
    }

    /// Transport over the built-in drivers
    pub fn with_defaults(config: TransportConfig) -> Self {
        let registry = Arc::new(DriverRegistry::with_defaults(&config.endpoints));
        Self::new(config, registry)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolver<'a>(&'a self, cache: &'a mut ServiceCache) -> Resolver<'a> {
        Resolver {
            cache,
            registry: &self.registry,
            config: &self.config.endpoints,
        }
    }

    /// Parse and cache an endpoint address
    pub fn create_endpoint(&self, address: &str) -> Result<Arc<EndPoint>> {
        let mut inner = self.lock();
        self.resolver(&mut inner.cache).create_endpoint(address)
    }

    /// Allocate a fresh local endpoint and create its memory
    pub fn allocate_endpoint(&self, protocol: Option<&str>, size_hint: usize) -> Result<Arc<EndPoint>> {
        let mut inner = self.lock();
        let protocol = protocol.unwrap_or(&self.config.endpoints.default_protocol);
        self.resolver(&mut inner.cache)
            .allocate_endpoint(protocol, size_hint)
    }

    /// This participant's endpoint for `protocol`, allocated on first use
    pub fn local_endpoint(&self, protocol: Option<&str>) -> Result<Arc<EndPoint>> {
        let mut inner = self.lock();
        self.resolver(&mut inner.cache).local_endpoint(protocol)
    }

    /// Memory service of an endpoint; remote endpoints are attached
    pub fn shared_memory_service(&self, endpoint: &Arc<EndPoint>) -> Result<Arc<dyn SharedMemoryService>> {
        let mut inner = self.lock();
        self.resolver(&mut inner.cache).service_for(endpoint)
    }

    fn next_id(inner: &mut Inner) -> CircuitId {
        inner.next_id += 1;
        inner.next_id
    }

    /// Build a circuit whose ports all live in this transport
    pub fn create_circuit(&self, spec: &CircuitSpec) -> Result<CircuitId> {
        let mut inner = self.lock();
        let id = Self::next_id(&mut inner);
        let circuit = Circuit::local(id, spec, &mut self.resolver(&mut inner.cache))?;
        inner.circuits.insert(id, circuit);
        Ok(id)
    }

    /// Handshake step 1: create an input and its descriptor for the producer
    pub fn create_input(&self, spec: &PortSetSpec) -> Result<(CircuitId, Vec<u8>)> {
        let mut inner = self.lock();
        let id = Self::next_id(&mut inner);
        let (circuit, bytes) = Circuit::create_input(id, spec, &mut self.resolver(&mut inner.cache))?;
        inner.circuits.insert(id, circuit);
        Ok((id, bytes))
    }

    /// Handshake step 2: connect an output to an input's descriptor
    pub fn connect_output(&self, spec: &PortSetSpec, input: &[u8]) -> Result<(CircuitId, Vec<u8>)> {
        let mut inner = self.lock();
        let id = Self::next_id(&mut inner);
        let (circuit, bytes) =
            Circuit::connect_output(id, spec, input, &mut self.resolver(&mut inner.cache))?;
        inner.circuits.insert(id, circuit);
        self.signal.notify();
        Ok((id, bytes))
    }

    /// Handshake step 3: complete an input from the output's answer
    ///
    /// On failure the input is discarded.
    pub fn finalize_input(&self, id: CircuitId, output: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let circuit = inner
            .circuits
            .get_mut(&id)
            .ok_or(TransportError::UnknownCircuit(id))?;
        let result = circuit.finalize_input(output, &mut self.resolver(&mut inner.cache));
        if let Err(e) = &result {
            tracing::warn!("Discarding input {} after failed finalize: {}", id, e);
            inner.circuits.remove(&id);
        }
        self.signal.notify();
        result
    }

    /// Handshake step 4: complete an output from the input's final answer
    ///
    /// On failure the output is discarded.
    pub fn finalize_output(&self, id: CircuitId, input: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let circuit = inner
            .circuits
            .get_mut(&id)
            .ok_or(TransportError::UnknownCircuit(id))?;
        let result = circuit.finalize_output(input);
        if let Err(e) = &result {
            tracing::warn!("Discarding output {} after failed finalize: {}", id, e);
            inner.circuits.remove(&id);
        }
        self.signal.notify();
        result
    }

    /// Stop a circuit
    ///
    /// Returns true when it was released at once. Otherwise it keeps its
    /// mappings until later dispatch passes complete its in-flight
    /// transfers.
    pub fn close_circuit(&self, id: CircuitId) -> Result<bool> {
        let mut inner = self.lock();
        let mut circuit = inner
            .circuits
            .remove(&id)
            .ok_or(TransportError::UnknownCircuit(id))?;
        let drained = circuit.close();
        if drained {
            tracing::info!("Circuit {} closed", id);
        } else {
            tracing::warn!(
                "Circuit {} closed with {} transfers in flight; retaining until drained",
                id,
                circuit.in_flight()
            );
            inner.retiring.push(circuit);
        }
        self.signal.notify();
        Ok(drained)
    }

    /// Closed circuits still waiting for transfers
    pub fn retiring(&self) -> usize {
        self.lock().retiring.len()
    }

    pub fn circuit_ids(&self) -> Vec<CircuitId> {
        let mut ids: Vec<_> = self.lock().circuits.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn circuit_state(&self, id: CircuitId) -> Result<CircuitState> {
        self.with_circuit(id, |c| Ok(c.state()))
    }

    pub fn roles(&self, id: CircuitId) -> Result<Option<Negotiated>> {
        self.with_circuit(id, |c| Ok(c.roles()))
    }

    /// Controller pattern of each consumer set
    pub fn controller_kinds(&self, id: CircuitId) -> Result<Vec<ControllerKind>> {
        self.with_circuit(id, |c| Ok(c.controllers().iter().map(|ctl| ctl.kind()).collect()))
    }

    /// Transfers posted by a circuit that have not completed
    pub fn in_flight(&self, id: CircuitId) -> Result<usize> {
        self.with_circuit(id, |c| Ok(c.in_flight()))
    }

    fn with_circuit<T>(&self, id: CircuitId, f: impl FnOnce(&mut Circuit) -> Result<T>) -> Result<T> {
        let mut inner = self.lock();
        let circuit = inner
            .circuits
            .get_mut(&id)
            .ok_or(TransportError::UnknownCircuit(id))?;
        f(circuit)
    }

    /// One non-blocking pass over every copy service and circuit
    ///
    /// Returns the number of transfers started or completed.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn dispatch(&self) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        self.signal.acknowledge();

        let mut progressed: usize = inner.cache.xfers.values().map(|x| x.progress()).sum();
        for circuit in inner.circuits.values_mut() {
            progressed += circuit.advance();
        }
        inner.retiring.retain_mut(|circuit| {
            progressed += circuit.complete_templates();
            if circuit.is_drained() {
                tracing::info!("Circuit {} drained and released", circuit.id());
                false
            } else {
                true
            }
        });
        progressed
    }

    /// Block until there may be work for `dispatch`
    ///
    /// Event mode sleeps until a produce, release or setup step notifies,
    /// or `timeout` passes. Polling mode sleeps one poll interval (at most
    /// `timeout`). Returns false only when an event-mode wait timed out.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.config.dispatch.mode {
            DispatchMode::Event => self.signal.wait(timeout),
            DispatchMode::Polling => {
                std::thread::sleep(self.config.dispatch.poll_interval().min(timeout));
                true
            }
        }
    }

    /// Claim an Empty buffer of producer port `ordinal`
    pub fn get_empty_buffer(&self, id: CircuitId, ordinal: usize) -> Result<Option<BufferHandle>> {
        self.with_circuit(id, |c| c.get_empty_buffer(ordinal))
    }

    pub fn has_empty_buffer(&self, id: CircuitId, ordinal: usize) -> Result<bool> {
        self.with_circuit(id, |c| c.has_empty_buffer(ordinal))
    }

    /// Send `length` bytes of a claimed buffer
    pub fn produce(&self, handle: BufferHandle, opcode: u32, length: usize) -> Result<ProduceStatus> {
        self.produce_with(handle, opcode, length, 0)
    }

    /// Send a buffer to every consumer port, whatever the circuit pattern
    pub fn produce_broadcast(&self, handle: BufferHandle, opcode: u32, length: usize) -> Result<ProduceStatus> {
        self.produce_with(handle, opcode, length, META_BROADCAST)
    }

    /// Send the last message of a stream
    pub fn produce_end_of_stream(
        &self,
        handle: BufferHandle,
        opcode: u32,
        length: usize,
    ) -> Result<ProduceStatus> {
        self.produce_with(handle, opcode, length, META_END_OF_STREAM)
    }

    pub fn produce_with(
        &self,
        handle: BufferHandle,
        opcode: u32,
        length: usize,
        flags: u32,
    ) -> Result<ProduceStatus> {
        let status = self.with_circuit(handle.circuit(), |c| c.produce(handle, opcode, length, flags))?;
        self.signal.notify();
        Ok(status)
    }

    /// Claim the next Full buffer of a consumer port, in fill order
    pub fn get_full_buffer(&self, id: CircuitId, set: usize, ordinal: usize) -> Result<Option<BufferHandle>> {
        self.with_circuit(id, |c| c.get_full_buffer(set, ordinal))
    }

    pub fn has_full_buffer(&self, id: CircuitId, set: usize, ordinal: usize) -> Result<bool> {
        self.with_circuit(id, |c| c.has_full_buffer(set, ordinal))
    }

    /// Give a claimed or retained buffer back
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        self.with_circuit(handle.circuit(), |c| c.release(handle))?;
        self.signal.notify();
        Ok(())
    }

    /// Retain the next Full buffer, releasing `old` when one is found
    pub fn take(
        &self,
        id: CircuitId,
        set: usize,
        ordinal: usize,
        old: Option<BufferHandle>,
    ) -> Result<Option<BufferHandle>> {
        let held = self.with_circuit(id, |c| c.take(set, ordinal, old))?;
        self.signal.notify();
        Ok(held)
    }

    /// Release every unclaimed Full buffer of a circuit's local consumers
    pub fn consume_all_local(&self, id: CircuitId) -> Result<usize> {
        let released = self.with_circuit(id, |c| Ok(c.consume_all_local()))?;
        if released > 0 {
            self.signal.notify();
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{PortRole, RoleRequest};

    fn transport() -> Transport {
        Transport::with_defaults(TransportConfig::default())
    }

    fn spec(producer: PortRole, consumer: PortRole) -> CircuitSpec {
        CircuitSpec::new(
            PortSetSpec::new(1, 2, 64, producer),
            vec![PortSetSpec::new(1, 2, 64, consumer)],
        )
    }

    #[test]
    fn test_local_endpoint_allocated_once() {
        let t = transport();
        let a = t.local_endpoint(None).unwrap();
        let b = t.local_endpoint(None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_local());
        assert_eq!(a.protocol(), "local");
    }

    #[test]
    fn test_default_protocol_used_when_unnamed() {
        let mut config = TransportConfig::default();
        config.endpoints.default_protocol = "dma".to_string();
        let t = Transport::with_defaults(config);

        let allocated = t.allocate_endpoint(None, 64 * 1024).unwrap();
        assert_eq!(allocated.protocol(), "dma");
        assert!(allocated.is_local());
        assert_eq!(t.local_endpoint(None).unwrap().protocol(), "dma");
        assert_eq!(t.local_endpoint(Some("local")).unwrap().protocol(), "local");
    }

    #[test]
    fn test_create_endpoint_rejects_unknown_protocol() {
        let t = transport();
        assert!(matches!(
            t.create_endpoint("pci:bar0:4096.1.0"),
            Err(TransportError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            t.create_endpoint("local:x:4096.2.2"),
            Err(TransportError::MalformedAddress { .. })
        ));
    }

    #[test]
    fn test_unknown_circuit() {
        let t = transport();
        assert!(matches!(
            t.get_empty_buffer(42, 0),
            Err(TransportError::UnknownCircuit(42))
        ));
        assert!(matches!(t.close_circuit(42), Err(TransportError::UnknownCircuit(42))));
    }

    #[test]
    fn test_create_and_close_circuit() {
        let t = transport();
        let id = t
            .create_circuit(&spec(PortRole::ActiveMessage, PortRole::ActiveFlowControl))
            .unwrap();
        assert_eq!(t.circuit_state(id).unwrap(), CircuitState::Ready);
        assert_eq!(t.controller_kinds(id).unwrap(), vec![ControllerKind::Broadcast]);
        assert!(t.close_circuit(id).unwrap());
        assert!(t.circuit_ids().is_empty());
    }

    #[test]
    fn test_incompatible_circuit_not_registered() {
        let t = transport();
        let mut spec = spec(PortRole::ActiveMessage, PortRole::ActiveMessage);
        spec.producer.role = RoleRequest::mandated(PortRole::ActiveMessage);
        spec.consumers[0].role = RoleRequest::mandated(PortRole::ActiveMessage);
        assert!(matches!(
            t.create_circuit(&spec),
            Err(TransportError::IncompatibleRoles(_))
        ));
        assert!(t.circuit_ids().is_empty());
    }

    #[test]
    fn test_wait_event_mode_times_out() {
        let mut config = TransportConfig::default();
        config.dispatch.mode = DispatchMode::Event;
        let t = Transport::with_defaults(config);
        t.dispatch();
        assert!(!t.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_produce_notifies_waiters() {
        let mut config = TransportConfig::default();
        config.dispatch.mode = DispatchMode::Event;
        let t = Transport::with_defaults(config);
        let id = t
            .create_circuit(&spec(PortRole::ActiveMessage, PortRole::ActiveFlowControl))
            .unwrap();
        t.dispatch();
        let handle = t.get_empty_buffer(id, 0).unwrap().unwrap();
        t.produce(handle, 1, 0).unwrap();
        assert!(t.wait(Duration::from_secs(5)));
    }
}
